//! Lifecycle and event hooks
//!
//! All hooks are optional and run on the connection task, outside every
//! lock the client holds; calling back into the client (including
//! `disconnect()`) from a hook is allowed.

use std::fmt;
use std::sync::Arc;

use crate::change::ChangeEvent;
use crate::client::ConnectionState;
use crate::error::ClientError;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    /// WebSocket close code (1000 normal, 1006 abnormal)
    pub code: u16,
    pub reason: String,
    /// Whether a reconnect has been scheduled
    pub will_reconnect: bool,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "closed with code {}", self.code)
        } else {
            write!(f, "{} (code: {})", self.reason, self.code)
        }
    }
}

pub type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;
pub type OnDisconnectCallback = Arc<dyn Fn(&DisconnectReason) + Send + Sync>;
pub type OnErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;
pub type OnChangeEventCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
pub type OnStateChangeCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Hooks invoked by the stream client.
#[derive(Clone, Default)]
pub struct EventHandlers {
    on_connect: Option<OnConnectCallback>,
    on_disconnect: Option<OnDisconnectCallback>,
    on_error: Option<OnErrorCallback>,
    on_change_event: Option<OnChangeEventCallback>,
    on_state_change: Option<OnStateChangeCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_change_event", &self.on_change_event.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after the connection opens and subscriptions were replayed.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Called whenever an open or opening connection ends, except through
    /// `disconnect()`.
    pub fn on_disconnect(mut self, f: impl Fn(&DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Called for recoverable errors: transport faults, server error
    /// frames, and exhausted reconnection.
    pub fn on_error(mut self, f: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called for every `change_event` frame.
    pub fn on_change_event(mut self, f: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_change_event = Some(Arc::new(f));
        self
    }

    /// Called on every connection state transition.
    pub fn on_state_change(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    pub(crate) fn emit_connect(&self) {
        if let Some(f) = &self.on_connect {
            f();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: &DisconnectReason) {
        if let Some(f) = &self.on_disconnect {
            f(reason);
        }
    }

    pub(crate) fn emit_error(&self, error: &ClientError) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }

    /// Returns whether a handler consumed the event.
    pub(crate) fn emit_change_event(&self, event: &ChangeEvent) -> bool {
        match &self.on_change_event {
            Some(f) => {
                f(event);
                true
            }
            None => false,
        }
    }

    pub(crate) fn emit_state_change(&self, state: ConnectionState) {
        if let Some(f) = &self.on_state_change {
            f(state);
        }
    }
}
