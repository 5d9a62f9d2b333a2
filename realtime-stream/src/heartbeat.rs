//! Heartbeat handling
//!
//! Server heartbeats are answered immediately with `heartbeat_ack`. The
//! monitor also remembers when the last heartbeat arrived; with a timeout
//! configured the connection manager uses [`HeartbeatMonitor::deadline`] to
//! treat a silent server as an abnormal close. Without one, liveness is left
//! entirely to transport close events.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::frame::{ClientFrame, FrameSender};

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    /// Heartbeats received over the client's lifetime
    pub received: u64,
    /// Acks that reached an open connection
    pub acked: u64,
}

#[derive(Debug, Default)]
struct HeartbeatState {
    last_seen: Option<Instant>,
    stats: HeartbeatStats,
}

/// Answers heartbeats and tracks liveness.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Option<Duration>,
    state: Mutex<HeartbeatState>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            state: Mutex::new(HeartbeatState::default()),
        }
    }

    /// Record a heartbeat and reply with `heartbeat_ack`.
    ///
    /// Returns whether the ack was written to an open connection.
    pub fn on_heartbeat(&self, sender: &dyn FrameSender) -> bool {
        {
            let mut state = self.state.lock();
            state.last_seen = Some(Instant::now());
            state.stats.received += 1;
        }

        let acked = sender.send_frame(ClientFrame::HeartbeatAck);
        if acked {
            self.state.lock().stats.acked += 1;
        } else {
            tracing::debug!("Heartbeat ack dropped, connection not open");
        }
        acked
    }

    /// Start the liveness window for a new connection.
    pub fn reset(&self) {
        self.state.lock().last_seen = Some(Instant::now());
    }

    /// When the server is considered silent, if a timeout is configured.
    pub fn deadline(&self) -> Option<Instant> {
        let timeout = self.timeout?;
        let last_seen = self.state.lock().last_seen.unwrap_or_else(Instant::now);
        Some(last_seen + timeout)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// When the last heartbeat (or connection start) was seen.
    pub fn last_seen(&self) -> Option<Instant> {
        self.state.lock().last_seen
    }

    pub fn stats(&self) -> HeartbeatStats {
        self.state.lock().stats
    }
}
