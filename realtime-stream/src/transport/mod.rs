//! Transport abstraction
//!
//! The connection manager never touches a socket directly. A [`Connector`]
//! opens one connection per epoch and hands back a [`TransportHandle`]: a
//! command sender for outbound text and close requests, and an event
//! receiver yielding inbound messages, errors and exactly one close.
//!
//! Two connectors ship with the crate: [`WebSocketConnector`] for real
//! servers and [`memory::MemoryConnector`] for driving the client in tests.

pub mod memory;
mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::StreamResult;

pub use websocket::WebSocketConnector;

/// Intentional close
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame carried no status code
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Requests from the client to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Write one text message
    Text(String),
    /// Close the connection with the given code and reason
    Close { code: u16, reason: String },
}

/// Notifications from the transport to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound text message
    Message(String),
    /// A transport fault; a `Closed` event follows
    Error(String),
    /// The connection is gone
    Closed { code: u16, reason: String },
}

/// An open connection.
#[derive(Debug)]
pub struct TransportHandle {
    pub sender: mpsc::UnboundedSender<TransportCommand>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transport connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to `url`. Resolves once the connection is usable.
    async fn connect(&self, url: &Url) -> StreamResult<TransportHandle>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self, url: &Url) -> StreamResult<TransportHandle> {
        (**self).connect(url).await
    }
}

/// Whether a close code means the peer ended the session on purpose.
pub fn is_normal_close(code: u16) -> bool {
    code == CLOSE_NORMAL
}
