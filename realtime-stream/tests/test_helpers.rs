//! Shared helpers for driving a StreamClient over the in-memory transport.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use realtime_stream::transport::memory::{memory_transport, MemoryAcceptor, MemoryPeer};
use realtime_stream::{
    ClientError, ConnectionState, EventHandlers, StaticToken, StreamClient, StreamConfig,
    TokenProvider,
};
use serde_json::Value;
use tokio::sync::mpsc;

/// Generous upper bound; with a paused clock this only fires on a hang.
pub const WAIT: Duration = Duration::from_secs(600);

pub struct Harness {
    pub client: StreamClient,
    pub acceptor: MemoryAcceptor,
    pub states: mpsc::UnboundedReceiver<ConnectionState>,
    pub errors: mpsc::UnboundedReceiver<ClientError>,
}

pub fn harness(config: StreamConfig) -> Harness {
    harness_with(config, StaticToken::new("test-token"))
}

pub fn harness_with(config: StreamConfig, tokens: impl TokenProvider) -> Harness {
    let (connector, acceptor) = memory_transport();
    let (state_tx, states) = mpsc::unbounded_channel();
    let (error_tx, errors) = mpsc::unbounded_channel();

    let handlers = EventHandlers::new()
        .on_state_change(move |state| {
            let _ = state_tx.send(state);
        })
        .on_error(move |error| {
            let _ = error_tx.send(error.clone());
        });

    let client = StreamClient::builder(config)
        .connector(connector)
        .token_provider(tokens)
        .handlers(handlers)
        .build()
        .expect("valid test config");

    Harness {
        client,
        acceptor,
        states,
        errors,
    }
}

impl Harness {
    /// Drain state changes until `target` is seen.
    pub async fn wait_for(&mut self, target: ConnectionState) {
        let states = &mut self.states;
        tokio::time::timeout(WAIT, async {
            while let Some(state) = states.recv().await {
                if state == target {
                    return;
                }
            }
            panic!("state channel closed before reaching {}", target);
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {}", target));
    }

    /// Next accepted connection.
    pub async fn accept(&mut self) -> MemoryPeer {
        tokio::time::timeout(WAIT, self.acceptor.accept())
            .await
            .expect("timed out waiting for a connection")
            .expect("acceptor closed")
    }

    /// `connect()` and return the server side once connected.
    pub async fn connect(&mut self) -> MemoryPeer {
        self.client.connect();
        let peer = self.accept().await;
        self.wait_for(ConnectionState::Connected).await;
        peer
    }

    /// Next error of the given kind.
    pub async fn next_error(&mut self) -> ClientError {
        tokio::time::timeout(WAIT, self.errors.recv())
            .await
            .expect("timed out waiting for an error")
            .expect("error channel closed")
    }
}

/// Next JSON frame the client wrote.
pub async fn next_json(peer: &mut MemoryPeer) -> Value {
    tokio::time::timeout(WAIT, peer.next_json())
        .await
        .expect("timed out waiting for a client frame")
        .expect("connection closed")
}

/// Callback that records every payload it receives.
pub fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |payload: &Value| sink.lock().push(payload.clone()))
}

/// Let spawned tasks run without advancing the clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
