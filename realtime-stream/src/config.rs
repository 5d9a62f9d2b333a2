//! Configuration types for the realtime-stream crate
//!
//! This module defines which stream endpoint a client connects to and the
//! timing knobs of its connection lifecycle: reconnection backoff, the
//! connect timeout and the optional heartbeat timeout.

use std::fmt;
use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::error::{StreamError, StreamResult};

/// Stream endpoints exposed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamEndpoint {
    /// `api/v1/ws/metrics`
    Metrics,
    /// `api/v1/ws/monitoring`
    Monitoring,
    /// `api/v1/ws/cdc/<subscription id>`
    Cdc(Uuid),
    /// Any other path relative to the base URL
    Custom(String),
}

impl StreamEndpoint {
    /// Path relative to the WebSocket base URL, without a leading slash.
    pub fn path(&self) -> String {
        match self {
            StreamEndpoint::Metrics => "api/v1/ws/metrics".to_string(),
            StreamEndpoint::Monitoring => "api/v1/ws/monitoring".to_string(),
            StreamEndpoint::Cdc(id) => format!("api/v1/ws/cdc/{}", id),
            StreamEndpoint::Custom(path) => path.trim_start_matches('/').to_string(),
        }
    }
}

impl fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Configuration for a StreamClient
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// WebSocket base URL (`ws://` or `wss://`)
    /// Default: ws://localhost:8080
    pub base_url: String,

    /// Stream to connect to
    /// Default: monitoring
    pub endpoint: StreamEndpoint,

    /// Reconnection delays after abnormal closes
    /// Default: exponential, 1s base, 30s cap, unlimited attempts
    pub backoff: BackoffPolicy,

    /// Upper bound for opening the transport
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// Treat the connection as dead when no heartbeat arrives for this long
    /// Default: disabled
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8080".to_string(),
            endpoint: StreamEndpoint::Monitoring,
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_timeout: None,
        }
    }
}

impl StreamConfig {
    /// Create a StreamConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics stream. Gives up after five reconnect attempts.
    pub fn metrics() -> Self {
        Self {
            endpoint: StreamEndpoint::Metrics,
            backoff: BackoffPolicy::default().with_max_attempts(5),
            ..Default::default()
        }
    }

    /// Monitoring stream, reconnecting forever.
    pub fn monitoring() -> Self {
        Self {
            endpoint: StreamEndpoint::Monitoring,
            ..Default::default()
        }
    }

    /// Change stream for one CDC subscription, reconnecting forever.
    pub fn cdc(subscription_id: Uuid) -> Self {
        Self {
            endpoint: StreamEndpoint::Cdc(subscription_id),
            ..Default::default()
        }
    }

    /// Monitoring stream retrying every five seconds.
    pub fn legacy_fixed_retry() -> Self {
        Self {
            backoff: BackoffPolicy::fixed(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> StreamResult<()> {
        let base = Url::parse(&self.base_url)?;
        if !matches!(base.scheme(), "ws" | "wss") {
            return Err(StreamError::Configuration(format!(
                "Base URL must use ws:// or wss://, got {}://",
                base.scheme()
            )));
        }

        if let StreamEndpoint::Custom(path) = &self.endpoint {
            if path.trim_matches('/').is_empty() {
                return Err(StreamError::Configuration(
                    "Custom endpoint path must not be empty".to_string(),
                ));
            }
        }

        if self.connect_timeout.is_zero() {
            return Err(StreamError::Configuration(
                "Connect timeout must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_timeout == Some(Duration::ZERO) {
            return Err(StreamError::Configuration(
                "Heartbeat timeout must be greater than 0".to_string(),
            ));
        }

        self.backoff.validate()
    }

    /// Full connection URL, `<base>/<path>?token=<token>`.
    ///
    /// The token is omitted when `None` or empty.
    pub fn stream_url(&self, token: Option<&str>) -> StreamResult<Url> {
        let raw = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.endpoint.path()
        );
        let mut url = Url::parse(&raw)?;

        if let Some(token) = token.filter(|t| !t.is_empty()) {
            url.query_pairs_mut().append_pair("token", token);
        }

        Ok(url)
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: StreamEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, max_attempts: u32) -> Self {
        self.backoff.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}
