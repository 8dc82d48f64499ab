use crate::audio_sink::AudioError;
use crate::config::ConfigError;
use crate::endpoint::EndpointError;
use crate::protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpeakError>;

#[derive(Error, Debug)]
pub enum SpeakError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("A stream is already open for request {0}")]
    DuplicateRequest(u64),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Request {request_id} finished with status '{status}'")]
    Remote { request_id: u64, status: String },

    #[error("Request {0} was cancelled")]
    Cancelled(u64),

    #[error("Request {0} ended without a terminal status")]
    Incomplete(u64),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
