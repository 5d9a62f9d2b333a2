//! Integration tests for the cdc-client crate.
//!
//! A CdcSubscriber runs against the in-memory stream transport and a fake
//! change feed, covering:
//! - Pushed events recorded as pending until acknowledged
//! - Delivery guarantees applied to pushed events
//! - At-least-once redelivery through the change feed after a reconnect

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdc_client::{
    CdcConfig, CdcError, CdcResult, CdcSubscriber, ChangeEvent, ChangeType, ChangesApi,
    ChangesPage, DeliveryGuarantee,
};
use parking_lot::Mutex;
use realtime_stream::transport::memory::{memory_transport, MemoryAcceptor, MemoryPeer};
use realtime_stream::{ConnectionState, EventHandlers};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(600);

#[derive(Default)]
struct FeedState {
    pages: VecDeque<ChangesPage>,
    acked: Vec<Uuid>,
    reject_acks: bool,
}

/// Change feed serving queued pages and recording acknowledgments.
#[derive(Clone, Default)]
struct FakeChangesApi {
    state: Arc<Mutex<FeedState>>,
}

impl FakeChangesApi {
    fn queue(&self, events: Vec<ChangeEvent>) {
        let count = events.len();
        self.state.lock().pages.push_back(ChangesPage {
            events,
            has_more: false,
            next_token: None,
            count,
        });
    }

    fn acked(&self) -> Vec<Uuid> {
        self.state.lock().acked.clone()
    }

    fn reject_acks(&self) {
        self.state.lock().reject_acks = true;
    }
}

#[async_trait]
impl ChangesApi for FakeChangesApi {
    async fn get_changes(
        &self,
        _subscription_id: Uuid,
        _limit: usize,
        _next_token: Option<String>,
    ) -> CdcResult<ChangesPage> {
        Ok(self.state.lock().pages.pop_front().unwrap_or_default())
    }

    async fn acknowledge_changes(
        &self,
        _subscription_id: Uuid,
        event_ids: &[Uuid],
    ) -> CdcResult<()> {
        let mut state = self.state.lock();
        if state.reject_acks {
            return Err(CdcError::Rejected("subscription paused".to_string()));
        }
        state.acked.extend_from_slice(event_ids);
        Ok(())
    }
}

struct Setup {
    subscriber: CdcSubscriber,
    api: FakeChangesApi,
    acceptor: MemoryAcceptor,
    states: mpsc::UnboundedReceiver<ConnectionState>,
    changes: mpsc::UnboundedReceiver<ChangeEvent>,
}

fn subscription() -> Uuid {
    Uuid::parse_str("0f2b1a9e-7c44-4e0e-9d5a-1c3b6a2f9e77").unwrap()
}

fn setup(guarantee: DeliveryGuarantee) -> Setup {
    let (connector, acceptor) = memory_transport();
    let api = FakeChangesApi::default();
    let (state_tx, states) = mpsc::unbounded_channel();
    let (change_tx, changes) = mpsc::unbounded_channel();

    let subscriber = CdcSubscriber::builder(
        CdcConfig::new(subscription()).with_guarantee(guarantee),
    )
    .connector(connector)
    .api(api.clone())
    .token("cdc-token")
    .handlers(EventHandlers::new().on_state_change(move |state| {
        let _ = state_tx.send(state);
    }))
    .on_change(move |event| {
        let _ = change_tx.send(event.clone());
    })
    .build()
    .expect("valid test config");

    Setup {
        subscriber,
        api,
        acceptor,
        states,
        changes,
    }
}

impl Setup {
    async fn wait_for(&mut self, target: ConnectionState) {
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

    async fn accept(&mut self) -> MemoryPeer {
        let peer = tokio::time::timeout(WAIT, self.acceptor.accept())
            .await
            .expect("timed out waiting for a connection")
            .expect("acceptor closed");
        self.wait_for(ConnectionState::Connected).await;
        peer
    }

    async fn next_change(&mut self) -> ChangeEvent {
        tokio::time::timeout(WAIT, self.changes.recv())
            .await
            .expect("timed out waiting for a change")
            .expect("change channel closed")
    }
}

fn change(table: &str) -> ChangeEvent {
    ChangeEvent::new(subscription(), table, ChangeType::Insert).with_after(json!({"id": 1}))
}

fn push(peer: &MemoryPeer, event: &ChangeEvent) {
    assert!(peer.push_json(&json!({"type": "change_event", "event": event})));
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_pushed_events_pending_until_acknowledged() {
    let mut s = setup(DeliveryGuarantee::AtLeastOnce);
    s.subscriber.connect();
    let peer = s.accept().await;

    assert_eq!(
        peer.url().path(),
        format!("/api/v1/ws/cdc/{}", subscription())
    );
    assert_eq!(peer.token().as_deref(), Some("cdc-token"));

    let orders = change("orders");
    let users = change("users");
    push(&peer, &orders);
    push(&peer, &users);

    assert_eq!(s.next_change().await.id, orders.id);
    assert_eq!(s.next_change().await.id, users.id);
    assert_eq!(s.subscriber.pending_count(), 2);

    assert_eq!(s.subscriber.acknowledge(&[orders.id]).await.unwrap(), 1);
    assert_eq!(s.api.acked(), vec![orders.id]);

    let pending = s.subscriber.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, users.id);
    assert_eq!(pending[0].payload.table_name, "users");
}

#[tokio::test]
async fn test_rejected_ack_keeps_events_pending() {
    let mut s = setup(DeliveryGuarantee::AtLeastOnce);
    s.subscriber.connect();
    let peer = s.accept().await;

    let event = change("orders");
    push(&peer, &event);
    s.next_change().await;

    s.api.reject_acks();
    let err = s.subscriber.acknowledge_pending().await.unwrap_err();
    assert!(matches!(err, CdcError::Rejected(_)));
    assert!(s.subscriber.tracker().is_pending(&event.id));
}

#[tokio::test]
async fn test_exactly_once_suppresses_pushed_duplicates() {
    let mut s = setup(DeliveryGuarantee::ExactlyOnce);
    s.subscriber.connect();
    let peer = s.accept().await;

    let event = change("orders");
    push(&peer, &event);
    push(&peer, &event);
    let marker = change("marker");
    push(&peer, &marker);

    assert_eq!(s.next_change().await.id, event.id);
    assert_eq!(s.next_change().await.id, marker.id);

    s.subscriber.acknowledge_pending().await.unwrap();
    push(&peer, &event);
    settle().await;

    assert!(s.changes.try_recv().is_err());
    assert_eq!(s.subscriber.pending_count(), 0);
}

#[tokio::test]
async fn test_events_for_other_subscriptions_are_ignored() {
    let mut s = setup(DeliveryGuarantee::AtLeastOnce);
    s.subscriber.connect();
    let peer = s.accept().await;

    let stray = ChangeEvent::new(Uuid::new_v4(), "orders", ChangeType::Delete);
    push(&peer, &stray);
    settle().await;

    assert!(s.changes.try_recv().is_err());
    assert_eq!(s.subscriber.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_at_least_once_redelivery_after_reconnect() {
    let mut s = setup(DeliveryGuarantee::AtLeastOnce);
    s.subscriber.connect();
    let peer = s.accept().await;

    let event = change("orders");
    push(&peer, &event);
    s.next_change().await;

    // dropped before the consumer acknowledged
    peer.close(1006, "connection lost");
    s.wait_for(ConnectionState::Reconnecting).await;
    let _peer = s.accept().await;
    assert!(s.subscriber.is_connected());

    // the server still holds the event and hands it out again
    s.api.queue(vec![event.clone()]);
    let recovered = s.subscriber.drain_changes().await.unwrap();
    assert_eq!(recovered, vec![event.clone()]);

    let pending = s.subscriber.tracker().get(&event.id).unwrap();
    assert_eq!(pending.delivery_count, 2);

    assert_eq!(s.subscriber.acknowledge_pending().await.unwrap(), 1);
    assert_eq!(s.api.acked(), vec![event.id]);
    assert_eq!(s.subscriber.pending_count(), 0);
}

#[tokio::test]
async fn test_at_most_once_poll_keeps_nothing_pending() {
    let s = setup(DeliveryGuarantee::AtMostOnce);
    let event = change("orders");
    s.api.queue(vec![event.clone()]);
    s.api.queue(vec![event.clone()]);

    let first = s.subscriber.poll_changes(10, None).await.unwrap();
    let second = s.subscriber.poll_changes(10, None).await.unwrap();

    assert_eq!(first.events.len(), 1);
    assert!(second.events.is_empty());
    assert_eq!(second.count, 1);
    assert_eq!(s.subscriber.pending_count(), 0);
}
