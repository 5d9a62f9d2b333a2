//! In-process transport
//!
//! [`memory_transport`] returns a connector and the acceptor that plays the
//! server side. Every successful `connect` hands a [`MemoryPeer`] to the
//! acceptor; the peer sees the client's outbound frames and can push
//! messages or close the connection with any code.
//!
//! ```
//! use realtime_stream::transport::memory::memory_transport;
//!
//! let (connector, acceptor) = memory_transport();
//! acceptor.refuse_next(2); // the next two connects fail
//! # let _ = connector;
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use super::{Connector, TransportCommand, TransportEvent, TransportHandle};
use crate::error::{StreamError, StreamResult};

#[derive(Debug, Default)]
struct Faults {
    refuse: AtomicUsize,
    stall: AtomicUsize,
    attempts: AtomicUsize,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Create a connected connector/acceptor pair.
pub fn memory_transport() -> (MemoryConnector, MemoryAcceptor) {
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let faults = Arc::new(Faults::default());
    (
        MemoryConnector {
            peers: peer_tx,
            faults: Arc::clone(&faults),
        },
        MemoryAcceptor {
            peers: peer_rx,
            faults,
        },
    )
}

/// Client side of the in-memory transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    faults: Arc<Faults>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> StreamResult<TransportHandle> {
        self.faults.attempts.fetch_add(1, Ordering::SeqCst);

        if Faults::take(&self.faults.stall) {
            std::future::pending::<()>().await;
        }
        if Faults::take(&self.faults.refuse) {
            return Err(StreamError::Transport("connection refused".to_string()));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            url: url.clone(),
            commands: command_rx,
            events: event_tx,
        };

        self.peers
            .send(peer)
            .map_err(|_| StreamError::Transport("acceptor dropped".to_string()))?;

        Ok(TransportHandle {
            sender: command_tx,
            events: event_rx,
        })
    }
}

/// Server side: yields one [`MemoryPeer`] per accepted connection.
#[derive(Debug)]
pub struct MemoryAcceptor {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    faults: Arc<Faults>,
}

impl MemoryAcceptor {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Take an already-established connection, if any.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }

    /// Fail the next `n` connection attempts with a transport error.
    pub fn refuse_next(&self, n: usize) {
        self.faults.refuse.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` connection attempts hang forever.
    pub fn stall_next(&self, n: usize) {
        self.faults.stall.store(n, Ordering::SeqCst);
    }

    /// Total connection attempts seen, including refused and stalled ones.
    pub fn attempts(&self) -> usize {
        self.faults.attempts.load(Ordering::SeqCst)
    }
}

/// One accepted connection, as seen by the server.
#[derive(Debug)]
pub struct MemoryPeer {
    url: Url,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    /// URL the client connected to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Query parameter `token` the client sent, if any.
    pub fn token(&self) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    }

    /// Deliver a raw text message to the client.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.events
            .send(TransportEvent::Message(text.into()))
            .is_ok()
    }

    /// Deliver a JSON document to the client.
    pub fn push_json(&self, value: &Value) -> bool {
        self.push_text(value.to_string())
    }

    /// Report a transport error to the client. Does not close.
    pub fn push_error(&self, message: impl Into<String>) -> bool {
        self.events
            .send(TransportEvent::Error(message.into()))
            .is_ok()
    }

    /// Close the connection from the server side.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.events
            .send(TransportEvent::Closed {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }

    /// Next command the client sent. `None` once the client dropped the
    /// connection.
    pub async fn next_command(&mut self) -> Option<TransportCommand> {
        self.commands.recv().await
    }

    /// Next command, without waiting.
    pub fn try_next_command(&mut self) -> Option<TransportCommand> {
        self.commands.try_recv().ok()
    }

    /// Next text frame parsed as JSON. `None` on close or disconnect.
    pub async fn next_json(&mut self) -> Option<Value> {
        match self.commands.recv().await? {
            TransportCommand::Text(text) => serde_json::from_str(&text).ok(),
            TransportCommand::Close { .. } => None,
        }
    }

    /// Whether the client still holds the connection.
    pub fn is_open(&self) -> bool {
        !self.events.is_closed()
    }
}
