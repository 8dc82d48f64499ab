use reqwest::Client;
use secrecy::{ExposeSecret, SecretBox};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),
}

/// Source of single-use, time-limited websocket URLs. Called again for every
/// connection attempt; implementations must not cache.
#[async_trait::async_trait]
pub trait EndpointProvider: Send + Sync {
    async fn fetch_url(&self) -> Result<String, EndpointError>;
}

/// Fetches the websocket URL from an HTTP endpoint.
pub struct HttpEndpointProvider {
    client: Client,
    endpoint: Url,
    api_token: Option<SecretBox<String>>,
}

impl HttpEndpointProvider {
    pub fn new(endpoint: Url, api_token: Option<String>) -> Result<Self, EndpointError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;

        Ok(Self {
            client,
            endpoint,
            api_token: api_token.map(|token| SecretBox::new(Box::new(token))),
        })
    }
}

#[async_trait::async_trait]
impl EndpointProvider for HttpEndpointProvider {
    async fn fetch_url(&self) -> Result<String, EndpointError> {
        let mut request = self.client.get(self.endpoint.clone());
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EndpointError::ApiError {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let body = response.text().await?;
        let url = extract_url(&body)?;
        log::debug!("Endpoint: fetched connection URL for host {:?}", url.host_str());
        Ok(url.into())
    }
}

/// Connects to the same URL every time; for servers without expiring URLs.
pub struct FixedEndpoint {
    url: String,
}

impl FixedEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait::async_trait]
impl EndpointProvider for FixedEndpoint {
    async fn fetch_url(&self) -> Result<String, EndpointError> {
        Ok(self.url.clone())
    }
}

/// Accepts either `{"url": "..."}` or a bare URL string.
fn extract_url(body: &str) -> Result<Url, EndpointError> {
    let candidate = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(json) => match json {
            serde_json::Value::String(url) => url,
            other => other
                .get("url")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| EndpointError::InvalidUrl("missing 'url' field".to_string()))?,
        },
        Err(_) => body.trim().to_string(),
    };

    let url = Url::parse(&candidate).map_err(|e| EndpointError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(EndpointError::InvalidUrl(format!(
            "expected ws or wss scheme, got '{}'",
            scheme
        ))),
    }
}
