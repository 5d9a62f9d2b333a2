//! Inbound frame routing
//!
//! Every socket message goes through [`MessageRouter::route`]. Decoding
//! failures never reach callers: the frame is logged and dropped and the
//! connection stays open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{ClientError, ClientErrorKind};
use crate::frame::{FrameSender, ServerFrame};
use crate::handlers::EventHandlers;
use crate::heartbeat::HeartbeatMonitor;
use crate::registry::ChannelRegistry;

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Payload handed to every callback on the channel
    Delivered { channel: String, callbacks: usize },
    /// Channel payload with nobody subscribed
    NoSubscribers { channel: String },
    /// Channel payload parsed and dropped because delivery is paused
    Paused { channel: String },
    /// Change event passed to the change handler, if one is installed
    ChangeEvent { id: Uuid, handled: bool },
    /// Heartbeat answered (or not, if the connection is gone)
    Heartbeat { acked: bool },
    /// Server-reported error forwarded to `on_error`
    ServerError { message: String },
    /// Not valid JSON, or a known frame type with a broken body
    Malformed,
    /// Valid JSON this client does not understand
    Ignored,
}

/// Dispatches decoded frames to channel callbacks and hooks.
pub struct MessageRouter {
    registry: Arc<ChannelRegistry>,
    heartbeat: HeartbeatMonitor,
    handlers: EventHandlers,
    paused: AtomicBool,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        heartbeat: HeartbeatMonitor,
        handlers: EventHandlers,
    ) -> Self {
        Self {
            registry,
            heartbeat,
            handlers,
            paused: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn handlers(&self) -> &EventHandlers {
        &self.handlers
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Set the pause flag, returning the previous value.
    pub fn set_paused(&self, paused: bool) -> bool {
        self.paused.swap(paused, Ordering::SeqCst)
    }

    /// Decode and dispatch one raw message.
    pub fn route(&self, raw: &str, sender: &dyn FrameSender) -> RouteOutcome {
        match ServerFrame::decode(raw) {
            Ok(frame) => self.dispatch(frame, sender),
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                RouteOutcome::Malformed
            }
        }
    }

    /// Dispatch an already-decoded frame.
    pub fn dispatch(&self, frame: ServerFrame, sender: &dyn FrameSender) -> RouteOutcome {
        trace!(kind = frame.kind(), "Dispatching frame");
        match frame {
            ServerFrame::Channel { channel, payload } => self.deliver(channel, &payload),
            ServerFrame::Heartbeat => RouteOutcome::Heartbeat {
                acked: self.heartbeat.on_heartbeat(sender),
            },
            ServerFrame::ChangeEvent(event) => {
                let handled = self.handlers.emit_change_event(&event);
                if !handled {
                    debug!(event_id = %event.id, "Change event with no handler installed");
                }
                RouteOutcome::ChangeEvent {
                    id: event.id,
                    handled,
                }
            }
            ServerFrame::Error { message } => {
                warn!("Server reported error: {}", message);
                self.handlers
                    .emit_error(&ClientError::new(ClientErrorKind::Server, message.clone()));
                RouteOutcome::ServerError { message }
            }
            ServerFrame::Unknown => {
                trace!("Ignoring unrecognised frame");
                RouteOutcome::Ignored
            }
        }
    }

    fn deliver(&self, channel: String, payload: &Value) -> RouteOutcome {
        if self.is_paused() {
            trace!(channel = %channel, "Delivery paused, dropping payload");
            return RouteOutcome::Paused { channel };
        }

        let callbacks = self.registry.callbacks(&channel);
        if callbacks.is_empty() {
            debug!(channel = %channel, "No subscribers for channel");
            return RouteOutcome::NoSubscribers { channel };
        }

        for callback in &callbacks {
            callback(payload);
        }

        RouteOutcome::Delivered {
            channel,
            callbacks: callbacks.len(),
        }
    }
}
