//! Wire frames exchanged over the stream socket
//!
//! One JSON document per socket message. Outbound control frames are a
//! `type`-tagged enum. Inbound frames are discriminated by their `type`
//! field, or by a `channel` field for channel payloads; anything else is
//! kept as [`ServerFrame::Unknown`] so newer servers can add frame types
//! without breaking older clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::change::ChangeEvent;

/// Frames sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start receiving payloads for a channel
    Subscribe { channel: String },
    /// Stop receiving payloads for a channel
    Unsubscribe {
        #[serde(alias = "topic")]
        channel: String,
    },
    /// Ask the server to hold delivery
    Pause,
    /// Ask the server to continue delivery
    Resume,
    /// Reply to a server heartbeat
    HeartbeatAck,
}

impl ClientFrame {
    pub fn subscribe(channel: impl Into<String>) -> Self {
        ClientFrame::Subscribe {
            channel: channel.into(),
        }
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        ClientFrame::Unsubscribe {
            channel: channel.into(),
        }
    }

    /// Serialize to the JSON text written to the socket.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Anything that can put a control frame on the wire.
///
/// Implementations drop the frame and return `false` when there is no open
/// connection; outbound control frames are never queued.
pub trait FrameSender: Send + Sync {
    fn send_frame(&self, frame: ClientFrame) -> bool;
}

/// Frames received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// `{channel, payload}`
    Channel { channel: String, payload: Value },
    /// `{type: "change_event", event}`
    ChangeEvent(Box<ChangeEvent>),
    /// `{type: "heartbeat"}`
    Heartbeat,
    /// `{type: "error", message}`
    Error { message: String },
    /// Anything this client does not understand
    Unknown,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TypedFrame {
    Heartbeat,
    Error {
        #[serde(default)]
        message: String,
    },
    ChangeEvent {
        event: Box<ChangeEvent>,
    },
}

impl ServerFrame {
    /// Decode one socket message.
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    /// Classify an already-parsed JSON document.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        let Value::Object(mut map) = value else {
            return Ok(ServerFrame::Unknown);
        };

        match map.get("type").and_then(Value::as_str) {
            Some("heartbeat" | "error" | "change_event") => {
                let typed: TypedFrame = serde_json::from_value(Value::Object(map))?;
                Ok(match typed {
                    TypedFrame::Heartbeat => ServerFrame::Heartbeat,
                    TypedFrame::Error { message } => ServerFrame::Error { message },
                    TypedFrame::ChangeEvent { event } => ServerFrame::ChangeEvent(event),
                })
            }
            Some(_) => Ok(ServerFrame::Unknown),
            None => match map.remove("channel") {
                Some(Value::String(channel)) => Ok(ServerFrame::Channel {
                    channel,
                    payload: map.remove("payload").unwrap_or(Value::Null),
                }),
                _ => Ok(ServerFrame::Unknown),
            },
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Channel { .. } => "channel",
            ServerFrame::ChangeEvent(_) => "change_event",
            ServerFrame::Heartbeat => "heartbeat",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Unknown => "unknown",
        }
    }
}
