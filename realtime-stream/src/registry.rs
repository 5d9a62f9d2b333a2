//! Channel subscriber registry
//!
//! Maps channel names to the callbacks subscribed to them. All mutation goes
//! through this type and is guarded by one mutex; callbacks are handed out as
//! cloned `Arc`s so they can be invoked after the lock is released (a callback
//! may unsubscribe itself or others while running).
//!
//! Control frames (`subscribe` / `unsubscribe`) are emitted while the mutex is
//! held, so the order frames reach the wire matches the order the registry
//! changed. Senders must not call back into the registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::frame::ClientFrame;

/// Callback invoked with each payload published on a channel.
pub type ChannelCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

/// Result of removing a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The callback was not registered (already removed)
    NotFound,
    /// The callback was removed; the channel still has subscribers
    Removed,
    /// The callback was the last one; the channel entry was deleted
    ChannelEmptied,
}

/// Thread-safe channel → callbacks map.
pub struct ChannelRegistry {
    channels: Mutex<BTreeMap<String, Vec<(CallbackId, ChannelCallback)>>>,
    next_id: AtomicU64,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback under `channel`.
    ///
    /// Returns the callback's id and whether it created the channel entry.
    pub fn insert(&self, channel: &str, callback: ChannelCallback) -> (CallbackId, bool) {
        self.insert_then(channel, callback, |_| {})
    }

    /// Like [`insert`](Self::insert), handing a `subscribe` frame to `send`
    /// under the lock when the channel entry is created.
    pub fn insert_then(
        &self,
        channel: &str,
        callback: ChannelCallback,
        send: impl FnOnce(ClientFrame),
    ) -> (CallbackId, bool) {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.channels.lock();
        let entry = channels.entry(channel.to_string()).or_default();
        let created = entry.is_empty();
        entry.push((id, callback));
        if created {
            send(ClientFrame::subscribe(channel));
        }
        (id, created)
    }

    /// Remove one callback. Removing an unknown id is a no-op.
    pub fn remove(&self, channel: &str, id: CallbackId) -> Removal {
        self.remove_then(channel, id, |_| {})
    }

    /// Like [`remove`](Self::remove), handing an `unsubscribe` frame to `send`
    /// under the lock when the last callback leaves the channel.
    pub fn remove_then(
        &self,
        channel: &str,
        id: CallbackId,
        send: impl FnOnce(ClientFrame),
    ) -> Removal {
        let mut channels = self.channels.lock();
        let Some(entry) = channels.get_mut(channel) else {
            return Removal::NotFound;
        };

        let before = entry.len();
        entry.retain(|(existing, _)| *existing != id);
        if entry.len() == before {
            return Removal::NotFound;
        }

        if entry.is_empty() {
            channels.remove(channel);
            send(ClientFrame::unsubscribe(channel));
            Removal::ChannelEmptied
        } else {
            Removal::Removed
        }
    }

    /// Snapshot of the callbacks for `channel`, in registration order.
    pub fn callbacks(&self, channel: &str) -> Vec<ChannelCallback> {
        self.channels
            .lock()
            .get(channel)
            .map(|entry| entry.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    /// Whether the callback is still registered.
    pub fn contains(&self, channel: &str, id: CallbackId) -> bool {
        self.channels
            .lock()
            .get(channel)
            .map_or(false, |entry| entry.iter().any(|(existing, _)| *existing == id))
    }

    /// All channels with at least one subscriber.
    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    /// Number of callbacks registered on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, Vec::len)
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Re-issue a `subscribe` frame for every channel present.
    ///
    /// Returns how many frames were handed to `send`.
    pub fn replay(&self, mut send: impl FnMut(ClientFrame)) -> usize {
        let channels = self.channels.lock();
        for channel in channels.keys() {
            send(ClientFrame::subscribe(channel.clone()));
        }
        channels.len()
    }

    /// Get statistics about the registry
    pub fn stats(&self) -> RegistryStats {
        let channels = self.channels.lock();
        RegistryStats {
            total_channels: channels.len(),
            total_callbacks: channels.values().map(Vec::len).sum(),
            channel_breakdown: channels
                .iter()
                .map(|(name, entry)| (name.clone(), entry.len()))
                .collect(),
        }
    }
}

/// Statistics about the registry state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_channels: usize,
    pub total_callbacks: usize,
    pub channel_breakdown: BTreeMap<String, usize>,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Channel Registry:")?;
        writeln!(
            f,
            "  Channels: {}, callbacks: {}",
            self.total_channels, self.total_callbacks
        )?;
        for (channel, count) in &self.channel_breakdown {
            writeln!(f, "    {}: {}", channel, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> ChannelCallback {
        let counter = Arc::clone(counter);
        Arc::new(move |_payload: &Value| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_first_insert_creates_channel() {
        let registry = ChannelRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let (_, created) = registry.insert("system_metrics", counting_callback(&counter));
        assert!(created);
        let (_, created) = registry.insert("system_metrics", counting_callback(&counter));
        assert!(!created);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.subscriber_count("system_metrics"), 2);
    }

    #[test]
    fn test_remove_outcomes() {
        let registry = ChannelRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (first, _) = registry.insert("alerts", counting_callback(&counter));
        let (second, _) = registry.insert("alerts", counting_callback(&counter));

        assert_eq!(registry.remove("alerts", first), Removal::Removed);
        assert_eq!(registry.remove("alerts", first), Removal::NotFound);
        assert!(registry.contains("alerts", second));
        assert_eq!(registry.remove("alerts", second), Removal::ChannelEmptied);
        assert!(registry.is_empty());
        assert_eq!(registry.remove("alerts", second), Removal::NotFound);
    }

    #[test]
    fn test_callbacks_snapshot_in_registration_order() {
        let registry = ChannelRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            registry.insert(
                "metrics",
                Arc::new(move |_: &Value| order.lock().push(tag)),
            );
        }

        for callback in registry.callbacks("metrics") {
            callback(&Value::Null);
        }
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert!(registry.callbacks("unknown").is_empty());
    }

    #[test]
    fn test_replay_emits_one_subscribe_per_channel() {
        let registry = ChannelRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.insert("system_metrics", counting_callback(&counter));
        registry.insert("system_metrics", counting_callback(&counter));
        registry.insert("alerts", counting_callback(&counter));

        let mut sent = Vec::new();
        let count = registry.replay(|frame| sent.push(frame));

        assert_eq!(count, 2);
        assert_eq!(
            sent,
            vec![
                ClientFrame::subscribe("alerts"),
                ClientFrame::subscribe("system_metrics"),
            ]
        );
    }

    #[test]
    fn test_stats() {
        let registry = ChannelRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.insert("a", counting_callback(&counter));
        registry.insert("a", counting_callback(&counter));
        registry.insert("b", counting_callback(&counter));

        let stats = registry.stats();
        assert_eq!(stats.total_channels, 2);
        assert_eq!(stats.total_callbacks, 3);
        assert_eq!(stats.channel_breakdown.get("a"), Some(&2));
        assert!(stats.to_string().contains("Channels: 2"));
    }

    #[test]
    fn test_control_frames_follow_registry_changes() {
        let registry = ChannelRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut sent = Vec::new();

        let (first, _) =
            registry.insert_then("alerts", counting_callback(&counter), |f| sent.push(f));
        let (second, created) =
            registry.insert_then("alerts", counting_callback(&counter), |f| sent.push(f));
        assert!(!created);
        registry.remove_then("alerts", first, |f| sent.push(f));
        registry.remove_then("alerts", second, |f| sent.push(f));
        registry.remove_then("alerts", second, |f| sent.push(f));

        assert_eq!(
            sent,
            vec![
                ClientFrame::subscribe("alerts"),
                ClientFrame::unsubscribe("alerts"),
            ]
        );
    }

    #[test]
    fn test_racing_subscribe_and_unsubscribe_keep_wire_order() {
        // The last control frame on the wire must agree with whether the
        // channel is still registered, however the two threads interleave.
        let registry = Arc::new(ChannelRegistry::new());
        let wire = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..500 {
            let (old, _) = registry.insert_then("alerts", counting_callback(&counter), |f| {
                wire.lock().push(f)
            });
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let leaving = {
                let (registry, wire, barrier) =
                    (Arc::clone(&registry), Arc::clone(&wire), Arc::clone(&barrier));
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.remove_then("alerts", old, |f| wire.lock().push(f));
                })
            };
            let joining = {
                let (registry, wire, barrier) =
                    (Arc::clone(&registry), Arc::clone(&wire), Arc::clone(&barrier));
                let callback = counting_callback(&counter);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.insert_then("alerts", callback, |f| wire.lock().push(f)).0
                })
            };
            leaving.join().unwrap();
            let new = joining.join().unwrap();

            assert!(registry.contains("alerts", new));
            assert_eq!(wire.lock().last(), Some(&ClientFrame::subscribe("alerts")));

            registry.remove_then("alerts", new, |f| wire.lock().push(f));
            assert_eq!(wire.lock().last(), Some(&ClientFrame::unsubscribe("alerts")));
        }
    }

    #[test]
    fn test_concurrent_insert_and_remove() {
        let registry = Arc::new(ChannelRegistry::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let callback = counting_callback(&counter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let (id, _) = registry.insert("shared", Arc::clone(&callback));
                        assert_ne!(registry.remove("shared", id), Removal::NotFound);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
