use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorType {
    InvalidRequestError,
    RateLimitError,
    AuthenticationError,
    ServerError,
    #[serde(other)]
    Unknown,
}

/// Error payload carried by a server `error` event.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerError {
    #[serde(rename = "type", default = "unknown_error_type")]
    pub error_type: ApiErrorType,
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    pub param: Option<String>,
    pub event_id: Option<String>,
}

const fn unknown_error_type() -> ApiErrorType {
    ApiErrorType::Unknown
}

/// Why a live connection stopped delivering frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// A ping went unanswered for longer than the configured ping timeout.
    KeepaliveTimeout,
    /// The server sent a close frame.
    Remote { code: u16, reason: String },
    /// The stream ended without a close frame.
    Eof,
    /// The socket failed underneath us.
    Transport(String),
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeepaliveTimeout => write!(f, "keepalive ping timeout"),
            Self::Remote { code, reason } if reason.is_empty() => write!(f, "closed by server ({code})"),
            Self::Remote { code, reason } => write!(f, "closed by server ({code}): {reason}"),
            Self::Eof => write!(f, "stream ended"),
            Self::Transport(msg) => write!(f, "transport failure: {msg}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("handshake rejected: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed server frame: {0}")]
    Decode(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Header error: {0}")]
    Header(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No live connection")]
    NotConnected,

    #[error("Connection closed: {0}")]
    ConnectionClosed(CloseCause),

    #[error("Invalid client event: {0}")]
    InvalidClientEvent(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Tool execution failed: {0}")]
    Tool(String),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),
}

impl Error {
    /// Only a keepalive timeout is worth reconnecting for; everything else
    /// means the session cannot be trusted any more.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionClosed(CloseCause::KeepaliveTimeout))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
