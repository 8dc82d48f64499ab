use crate::audio_sink::CpalConfig;
use crate::endpoint::{EndpointError, EndpointProvider, FixedEndpoint, HttpEndpointProvider};
use crate::protocol::StreamMode;
use crate::reorder::PartBoundary;
use crate::sequencer::SequencerConfig;
use crate::transport::TransportConfig;
use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const ENDPOINT_URL_VAR: &str = "SPEAK_ENDPOINT_URL";
pub const API_TOKEN_VAR: &str = "SPEAK_API_TOKEN";
pub const VOICE_ID_VAR: &str = "SPEAK_VOICE_ID";
pub const STREAM_MODE_VAR: &str = "SPEAK_STREAM_MODE";
pub const MAX_RECONNECT_ATTEMPTS_VAR: &str = "SPEAK_MAX_RECONNECT_ATTEMPTS";
pub const RECONNECT_BASE_MS_VAR: &str = "SPEAK_RECONNECT_BASE_MS";
pub const INTER_UTTERANCE_GAP_MS_VAR: &str = "SPEAK_INTER_UTTERANCE_GAP_MS";
pub const KEEP_HISTORY_VAR: &str = "SPEAK_KEEP_HISTORY";
pub const PART_BOUNDARY_VAR: &str = "SPEAK_PART_BOUNDARY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key format for {service}: {reason}")]
    InvalidKeyFormat { service: String, reason: String },
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

impl ConfigError {
    fn invalid(var: &str, reason: impl ToString) -> Self {
        ConfigError::InvalidValue {
            var: var.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Client configuration
#[derive(Debug)]
pub struct ClientConfig {
    /// Either an HTTP endpoint handing out websocket URLs, or a websocket URL used as is
    pub endpoint_url: Url,
    api_token: Option<SecretBox<String>>,
    pub voice_id: Option<String>,
    pub stream_mode: Option<StreamMode>,
    pub part_boundary: PartBoundary,
    pub transport: TransportConfig,
    pub sequencer: SequencerConfig,
    pub audio: CpalConfig,
}

impl ClientConfig {
    pub fn new(endpoint_url: Url) -> Self {
        Self {
            endpoint_url,
            api_token: None,
            voice_id: None,
            stream_mode: None,
            part_boundary: PartBoundary::default(),
            transport: TransportConfig::default(),
            sequencer: SequencerConfig::default(),
            audio: CpalConfig::default(),
        }
    }

    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = lookup(ENDPOINT_URL_VAR)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar(ENDPOINT_URL_VAR.to_string()))?;
        let endpoint_url =
            Url::parse(raw_url.trim()).map_err(|e| ConfigError::invalid(ENDPOINT_URL_VAR, e))?;
        if !matches!(endpoint_url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(ConfigError::invalid(
                ENDPOINT_URL_VAR,
                format!("unsupported scheme '{}'", endpoint_url.scheme()),
            ));
        }

        let mut config = Self::new(endpoint_url);

        if let Some(token) = lookup(API_TOKEN_VAR) {
            if token.trim().is_empty() {
                return Err(ConfigError::InvalidKeyFormat {
                    service: "speech endpoint".to_string(),
                    reason: "API token cannot be empty".to_string(),
                });
            }
            config.api_token = Some(SecretBox::new(Box::new(token)));
        }

        config.voice_id = lookup(VOICE_ID_VAR).filter(|voice| !voice.trim().is_empty());

        if let Some(mode) = lookup(STREAM_MODE_VAR) {
            let mode = StreamMode::from_str(mode.trim())
                .map_err(|_| ConfigError::invalid(STREAM_MODE_VAR, "expected 'chunks' or 'parts'"))?;
            config.stream_mode = Some(mode);
        }

        if let Some(boundary) = lookup(PART_BOUNDARY_VAR) {
            config.part_boundary = PartBoundary::from_str(boundary.trim()).map_err(|_| {
                ConfigError::invalid(PART_BOUNDARY_VAR, "expected 'marker' or 'next-part'")
            })?;
        }

        if let Some(attempts) = parse_var::<u32, _>(&lookup, MAX_RECONNECT_ATTEMPTS_VAR)? {
            config.transport.max_reconnect_attempts = attempts;
        }
        if let Some(base_ms) = parse_var::<u64, _>(&lookup, RECONNECT_BASE_MS_VAR)? {
            config.transport.reconnect_base_delay = Duration::from_millis(base_ms);
        }
        if let Some(gap_ms) = parse_var::<u64, _>(&lookup, INTER_UTTERANCE_GAP_MS_VAR)? {
            config.sequencer.inter_utterance_gap = Duration::from_millis(gap_ms);
        }
        if let Some(keep) = parse_var::<bool, _>(&lookup, KEEP_HISTORY_VAR)? {
            config.sequencer.keep_history = keep;
        }

        Ok(config)
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(SecretBox::new(Box::new(token.into())));
        self
    }

    /// Get the API token (use only when making API calls)
    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_ref().map(|token| token.expose_secret().as_str())
    }

    /// Websocket URLs connect directly; HTTP URLs are asked for a fresh URL per attempt.
    pub fn endpoint_provider(&self) -> Result<Arc<dyn EndpointProvider>, EndpointError> {
        match self.endpoint_url.scheme() {
            "ws" | "wss" => Ok(Arc::new(FixedEndpoint::new(self.endpoint_url.as_str()))),
            _ => Ok(Arc::new(HttpEndpointProvider::new(
                self.endpoint_url.clone(),
                self.api_token().map(str::to_string),
            )?)),
        }
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(var, e)),
        None => Ok(None),
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    match ClientConfig::load() {
        Ok(config) => {
            log::info!("Successfully loaded client configuration");
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=https://your-endpoint.example/connect", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_missing_endpoint() {
        let result = ClientConfig::from_lookup(lookup(&[]));
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(var)) if var == ENDPOINT_URL_VAR));
    }

    #[test]
    fn test_defaults() {
        let config =
            ClientConfig::from_lookup(lookup(&[(ENDPOINT_URL_VAR, "wss://speak.example/ws")]))
                .unwrap();
        assert!(config.api_token().is_none());
        assert!(config.voice_id.is_none());
        assert!(config.stream_mode.is_none());
        assert_eq!(config.part_boundary, PartBoundary::Marker);
        assert_eq!(config.transport.max_reconnect_attempts, 6);
        assert_eq!(config.sequencer.inter_utterance_gap, Duration::from_millis(400));
        assert!(!config.sequencer.keep_history);
    }

    #[test]
    fn test_all_variables() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENDPOINT_URL_VAR, "https://speak.example/connect"),
            (API_TOKEN_VAR, "secret-token"),
            (VOICE_ID_VAR, "narrator"),
            (STREAM_MODE_VAR, "parts"),
            (MAX_RECONNECT_ATTEMPTS_VAR, "3"),
            (RECONNECT_BASE_MS_VAR, "250"),
            (INTER_UTTERANCE_GAP_MS_VAR, "100"),
            (KEEP_HISTORY_VAR, "true"),
            (PART_BOUNDARY_VAR, "next-part"),
        ]))
        .unwrap();

        assert_eq!(config.api_token(), Some("secret-token"));
        assert_eq!(config.voice_id.as_deref(), Some("narrator"));
        assert_eq!(config.stream_mode, Some(StreamMode::Parts));
        assert_eq!(config.transport.max_reconnect_attempts, 3);
        assert_eq!(config.transport.reconnect_base_delay, Duration::from_millis(250));
        assert_eq!(config.sequencer.inter_utterance_gap, Duration::from_millis(100));
        assert!(config.sequencer.keep_history);
        assert_eq!(config.part_boundary, PartBoundary::NextPart);
        // Token must not leak through Debug output.
        assert!(!format!("{:?}", config).contains("secret-token"));
    }

    #[test]
    fn test_invalid_values() {
        let bad_mode = ClientConfig::from_lookup(lookup(&[
            (ENDPOINT_URL_VAR, "wss://speak.example/ws"),
            (STREAM_MODE_VAR, "frames"),
        ]));
        assert!(matches!(bad_mode, Err(ConfigError::InvalidValue { .. })));

        let bad_number = ClientConfig::from_lookup(lookup(&[
            (ENDPOINT_URL_VAR, "wss://speak.example/ws"),
            (RECONNECT_BASE_MS_VAR, "soon"),
        ]));
        assert!(matches!(bad_number, Err(ConfigError::InvalidValue { var, .. }) if var == RECONNECT_BASE_MS_VAR));

        let bad_scheme =
            ClientConfig::from_lookup(lookup(&[(ENDPOINT_URL_VAR, "ftp://speak.example/")]));
        assert!(bad_scheme.is_err());

        let empty_token = ClientConfig::from_lookup(lookup(&[
            (ENDPOINT_URL_VAR, "wss://speak.example/ws"),
            (API_TOKEN_VAR, " "),
        ]));
        assert!(matches!(empty_token, Err(ConfigError::InvalidKeyFormat { .. })));
    }

    #[tokio::test]
    async fn test_websocket_endpoint_is_used_directly() {
        let config = ClientConfig::new(Url::parse("ws://127.0.0.1:9000/ws").unwrap());
        let provider = config.endpoint_provider().unwrap();
        assert_eq!(provider.fetch_url().await.unwrap(), "ws://127.0.0.1:9000/ws");
    }
}
