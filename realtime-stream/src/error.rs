//! Error types for the realtime-stream crate.

use std::fmt;

/// Errors returned by the stream client and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The transport could not be opened or failed while open
    #[error("Transport error: {0}")]
    Transport(String),

    /// Opening the transport took longer than the configured timeout
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// An inbound frame could not be decoded
    #[error("Frame decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The stream URL could not be built
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Reading the persisted auth token failed
    #[error("Token error: {0}")]
    Token(String),
}

/// Convenience type alias for Results using StreamError.
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Category of a non-fatal error surfaced through `on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientErrorKind {
    /// The transport failed to open or reported an error
    Transport,
    /// The server sent a `{type: "error"}` frame
    Server,
    /// Reconnection stopped after the configured maximum number of attempts
    BackoffExhausted,
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientErrorKind::Transport => write!(f, "transport"),
            ClientErrorKind::Server => write!(f, "server"),
            ClientErrorKind::BackoffExhausted => write!(f, "backoff exhausted"),
        }
    }
}

/// Error information passed to the `on_error` handler.
///
/// These are recoverable conditions; nothing delivered here tears down
/// the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError {
    /// What produced the error
    pub kind: ClientErrorKind,
    /// Human-readable description
    pub message: String,
}

impl ClientError {
    /// Create a new client error.
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the client keeps reconnecting on its own after this error.
    pub fn is_retrying(&self) -> bool {
        !matches!(self.kind, ClientErrorKind::BackoffExhausted)
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}
