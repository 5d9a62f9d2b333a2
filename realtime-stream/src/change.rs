//! Change-data-capture event model
//!
//! Discrete change events pushed over the CDC stream (`change_event` frames)
//! and returned by the polling endpoint. Field names follow the server's
//! camelCase JSON.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
    #[serde(alias = "TRUNCATE")]
    Truncate,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Insert => write!(f, "insert"),
            ChangeType::Update => write!(f, "update"),
            ChangeType::Delete => write!(f, "delete"),
            ChangeType::Truncate => write!(f, "truncate"),
        }
    }
}

/// Delivery guarantee requested for a CDC subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// May deliver duplicates, never loses an event
    #[default]
    AtLeastOnce,
    /// Never delivers twice, may lose events
    AtMostOnce,
    /// Requires consumer-side deduplication by event id
    ExactlyOnce,
}

impl fmt::Display for DeliveryGuarantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryGuarantee::AtLeastOnce => write!(f, "at_least_once"),
            DeliveryGuarantee::AtMostOnce => write!(f, "at_most_once"),
            DeliveryGuarantee::ExactlyOnce => write!(f, "exactly_once"),
        }
    }
}

/// Column-level change detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnChange {
    pub column_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// A single captured row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Unique event id, the unit of acknowledgment and deduplication
    pub id: Uuid,
    /// CDC subscription the event was produced for
    pub subscription_id: Uuid,
    /// Table that was modified
    pub table_name: String,
    /// Type of change
    pub change_type: ChangeType,
    /// Backend log position (LSN/SCN), opaque to the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsn: Option<String>,
    /// Transaction that produced the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<String>,
    /// Row image before the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    /// Row image after the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_changes: Vec<ColumnChange>,
    /// When the change happened on the server
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ChangeEvent {
    /// Create an event with no row images.
    pub fn new(
        subscription_id: Uuid,
        table_name: impl Into<String>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            table_name: table_name.into(),
            change_type,
            lsn: None,
            txn_id: None,
            before: None,
            after: None,
            column_changes: Vec::new(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_after(mut self, after: Value) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_before(mut self, before: Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_lsn(mut self, lsn: impl Into<String>) -> Self {
        self.lsn = Some(lsn.into());
        self
    }
}
