//! Error types for the cdc-client crate.

use realtime_stream::StreamError;

/// Errors returned by the change feed client.
#[derive(Debug, thiserror::Error)]
pub enum CdcError {
    /// The HTTP request could not be sent or the response body not read
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The acknowledgment envelope reported `success: false`
    #[error("Acknowledgment rejected: {0}")]
    Rejected(String),

    /// A response body was not the expected JSON
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// An endpoint URL could not be built
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Error from the underlying stream client
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Convenience type alias for Results using CdcError.
pub type CdcResult<T> = std::result::Result<T, CdcError>;

impl CdcError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CdcError::Http(e) => e.is_timeout() || e.is_connect(),
            CdcError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CdcError::Status {
            status: 503,
            body: "maintenance".to_string(),
        };
        assert_eq!(error.to_string(), "Server returned 503: maintenance");
        assert!(error.is_transient());

        let error = CdcError::Rejected("subscription not found".to_string());
        assert_eq!(error.to_string(), "Acknowledgment rejected: subscription not found");
        assert!(!error.is_transient());
    }

    #[test]
    fn test_stream_error_is_transparent() {
        let error: CdcError = StreamError::Configuration("bad".to_string()).into();
        assert_eq!(error.to_string(), "Configuration error: bad");
    }

    #[test]
    fn test_client_errors_are_not_transient() {
        let error = CdcError::Status {
            status: 404,
            body: String::new(),
        };
        assert!(!error.is_transient());
    }
}
