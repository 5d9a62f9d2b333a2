//! # realtime-stream
//!
//! A reconnecting, multiplexed WebSocket subscription layer for RustyDB's
//! metrics, monitoring and change-data-capture streams.
//!
//! One [`StreamClient`] holds one logical connection. Any number of
//! callbacks subscribe to named channels over it; the client replays those
//! subscriptions after every reconnect, answers server heartbeats, and can
//! pause delivery without dropping the connection.
//!
//! ```rust,no_run
//! use realtime_stream::{EventHandlers, StreamClient, StreamConfig, SystemMetricsTopic};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = StreamClient::builder(StreamConfig::metrics().with_base_url("ws://db:8080"))
//!     .token("secret")
//!     .handlers(EventHandlers::new().on_error(|e| eprintln!("{}", e)))
//!     .build()?;
//!
//! let metrics = client.subscribe_topic::<SystemMetricsTopic, _>(|m| {
//!     println!("cpu {:.1}%", m.cpu_usage);
//! });
//! client.connect();
//!
//! // later
//! metrics.unsubscribe();
//! client.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod change;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod heartbeat;
pub mod registry;
pub mod router;
pub mod token;
pub mod topics;
pub mod transport;

pub use backoff::{BackoffPolicy, BackoffStrategy, ReconnectAttempt};
pub use change::{ChangeEvent, ChangeType, ColumnChange, DeliveryGuarantee};
pub use client::{ConnectionState, StreamClient, StreamClientBuilder, SubscriptionHandle};
pub use config::{StreamConfig, StreamEndpoint};
pub use error::{ClientError, ClientErrorKind, StreamError, StreamResult};
pub use frame::{ClientFrame, ServerFrame};
pub use handlers::{DisconnectReason, EventHandlers};
pub use router::RouteOutcome;
pub use token::{AuthFile, FileTokenStore, StaticToken, TokenProvider};
pub use topics::{
    ActiveSessions, ActiveSessionsTopic, Alert, AlertSeverity, AlertsTopic, SessionInfo,
    SystemMetrics, SystemMetricsTopic, Topic,
};
pub use transport::{Connector, WebSocketConnector};
