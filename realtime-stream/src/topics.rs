//! Typed channel payloads
//!
//! A [`Topic`] binds a channel name to the payload type published on it.
//! `StreamClient::subscribe_topic::<T>` decodes each payload before handing
//! it to the callback; payloads that do not decode are logged and skipped
//! for that subscriber only.
//!
//! All built-in payload fields default, so a server that adds or omits
//! fields does not break older clients.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A channel with a known payload shape.
pub trait Topic {
    /// Channel name on the wire
    const CHANNEL: &'static str;
    /// Payload published on the channel
    type Payload: DeserializeOwned + Send + 'static;
}

/// `system_metrics` channel
#[derive(Debug, Clone, Copy)]
pub struct SystemMetricsTopic;

impl Topic for SystemMetricsTopic {
    const CHANNEL: &'static str = "system_metrics";
    type Payload = SystemMetrics;
}

/// `active_sessions` channel
#[derive(Debug, Clone, Copy)]
pub struct ActiveSessionsTopic;

impl Topic for ActiveSessionsTopic {
    const CHANNEL: &'static str = "active_sessions";
    type Payload = ActiveSessions;
}

/// `alerts` channel
#[derive(Debug, Clone, Copy)]
pub struct AlertsTopic;

impl Topic for AlertsTopic {
    const CHANNEL: &'static str = "alerts";
    type Payload = Alert;
}

/// Host and engine resource usage snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SystemMetrics {
    #[serde(alias = "cpu")]
    pub cpu_usage: f64,
    #[serde(alias = "memory")]
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub active_connections: u64,
    pub queries_per_second: f64,
    pub cache_hit_ratio: f64,
    pub timestamp: Option<DateTime<Utc>>,
    /// Fields this client does not model
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// One connected session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub username: String,
    pub database: Option<String>,
    pub client_address: Option<String>,
    pub state: String,
    pub current_query: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Snapshot of the sessions currently open on the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActiveSessions {
    pub sessions: Vec<SessionInfo>,
    pub total: usize,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

/// A monitoring alert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub source: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
}

/// Decode a raw channel payload as `T`'s payload type.
pub fn decode_payload<T: Topic>(payload: &Value) -> serde_json::Result<T::Payload> {
    T::Payload::deserialize(payload)
}
