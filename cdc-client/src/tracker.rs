//! Acknowledgment tracking
//!
//! The [`AckTracker`] remembers every change event handed to the consumer
//! until the server confirms its acknowledgment. Events arrive from two
//! directions: pushed over the stream, and pulled through [`ChangesApi`].
//! Both paths go through [`AckTracker::record`], which also applies the
//! subscription's delivery guarantee:
//!
//! - `at_least_once`: always delivered; a redelivered id bumps its
//!   delivery count and stays pending
//! - `exactly_once`: an id already pending or recently acknowledged is
//!   suppressed
//! - `at_most_once`: an id already seen is suppressed, and nothing is kept
//!   pending

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use realtime_stream::{ChangeEvent, DeliveryGuarantee};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::{ChangesApi, ChangesPage};
use crate::error::CdcResult;

/// An event handed to the consumer and not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChangeEvent {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub payload: ChangeEvent,
    /// Last time the event was handed out
    pub delivered_at: DateTime<Utc>,
    /// How many times the event was handed out
    pub delivery_count: u32,
}

/// Bounded memory of event ids, oldest evicted first.
#[derive(Debug)]
struct IdWindow {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl IdWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    /// Returns false if the id was already present.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}

/// Tracks delivered-but-unacknowledged change events for one subscription.
pub struct AckTracker {
    api: Arc<dyn ChangesApi>,
    subscription_id: Uuid,
    guarantee: DeliveryGuarantee,
    pending: DashMap<Uuid, PendingChangeEvent>,
    /// Acknowledged ids (exactly-once) or delivered ids (at-most-once)
    seen: Mutex<IdWindow>,
}

impl std::fmt::Debug for AckTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckTracker")
            .field("subscription_id", &self.subscription_id)
            .field("guarantee", &self.guarantee)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl AckTracker {
    pub fn new(
        api: Arc<dyn ChangesApi>,
        subscription_id: Uuid,
        guarantee: DeliveryGuarantee,
        dedup_window: usize,
    ) -> Self {
        Self {
            api,
            subscription_id,
            guarantee,
            pending: DashMap::new(),
            seen: Mutex::new(IdWindow::new(dedup_window)),
        }
    }

    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    pub fn guarantee(&self) -> DeliveryGuarantee {
        self.guarantee
    }

    /// Note that `event` was received. Returns whether it should be handed
    /// to the consumer.
    pub fn record(&self, event: &ChangeEvent) -> bool {
        match self.guarantee {
            DeliveryGuarantee::AtLeastOnce => {
                self.track(event);
                true
            }
            DeliveryGuarantee::ExactlyOnce => {
                // held across the pending insert so an acknowledge cannot
                // slip between the check and the insert
                let seen = self.seen.lock();
                if seen.contains(&event.id) {
                    debug!(event_id = %event.id, "Suppressing already acknowledged event");
                    return false;
                }
                let first = self.track(event);
                drop(seen);
                if !first {
                    debug!(event_id = %event.id, "Suppressing redelivered pending event");
                }
                first
            }
            DeliveryGuarantee::AtMostOnce => {
                let first = self.seen.lock().insert(event.id);
                if !first {
                    debug!(event_id = %event.id, "Suppressing already delivered event");
                }
                first
            }
        }
    }

    /// Insert or bump the pending entry. Returns true for a new entry.
    fn track(&self, event: &ChangeEvent) -> bool {
        let now = Utc::now();
        let mut first = false;
        self.pending
            .entry(event.id)
            .and_modify(|pending| {
                pending.delivery_count += 1;
                pending.delivered_at = now;
            })
            .or_insert_with(|| {
                first = true;
                PendingChangeEvent {
                    id: event.id,
                    subscription_id: event.subscription_id,
                    payload: event.clone(),
                    delivered_at: now,
                    delivery_count: 1,
                }
            });
        first
    }

    /// Acknowledge `event_ids` with the server.
    ///
    /// On success the ids leave the pending set and the number removed is
    /// returned. On failure nothing changes and the error is returned.
    pub async fn acknowledge(&self, event_ids: &[Uuid]) -> CdcResult<usize> {
        if event_ids.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self
            .api
            .acknowledge_changes(self.subscription_id, event_ids)
            .await
        {
            warn!(
                subscription_id = %self.subscription_id,
                count = event_ids.len(),
                "Acknowledgment failed, events stay pending: {}", e
            );
            return Err(e);
        }

        let mut removed = 0;
        for id in event_ids {
            // an exactly-once id enters `seen` before it leaves `pending`
            let mut seen =
                (self.guarantee == DeliveryGuarantee::ExactlyOnce).then(|| self.seen.lock());
            if let Some(seen) = seen.as_mut() {
                seen.insert(*id);
            }
            if self.pending.remove(id).is_some() {
                removed += 1;
            }
        }
        debug!(subscription_id = %self.subscription_id, removed, "Events acknowledged");
        Ok(removed)
    }

    /// Acknowledge everything currently pending.
    pub async fn acknowledge_pending(&self) -> CdcResult<usize> {
        let ids = self.pending_ids();
        self.acknowledge(&ids).await
    }

    /// Pull one page of changes. Events the delivery guarantee suppresses
    /// are removed from the returned page; `count` stays as the server sent it.
    pub async fn poll_changes(
        &self,
        limit: usize,
        next_token: Option<String>,
    ) -> CdcResult<ChangesPage> {
        let mut page = self
            .api
            .get_changes(self.subscription_id, limit, next_token)
            .await?;

        let received = page.events.len();
        page.events.retain(|event| self.record(event));
        debug!(
            subscription_id = %self.subscription_id,
            received,
            delivered = page.events.len(),
            has_more = page.has_more,
            "Polled changes"
        );
        Ok(page)
    }

    /// Follow `next_token` until the server reports no more events.
    pub async fn drain_changes(&self, limit: usize) -> CdcResult<Vec<ChangeEvent>> {
        let mut events = Vec::new();
        let mut next_token = None;

        loop {
            let page = self.poll_changes(limit, next_token.take()).await?;
            events.extend(page.events);

            if !page.has_more {
                break;
            }
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => {
                    warn!("Server reported more changes without a continuation token");
                    break;
                }
            }
        }

        Ok(events)
    }

    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.pending.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot of the pending set, oldest delivery first.
    pub fn pending(&self) -> Vec<PendingChangeEvent> {
        let mut pending: Vec<_> = self.pending.iter().map(|entry| entry.value().clone()).collect();
        pending.sort_by_key(|p| p.delivered_at);
        pending
    }

    pub fn get(&self, id: &Uuid) -> Option<PendingChangeEvent> {
        self.pending.get(id).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockChangesApi;
    use crate::error::CdcError;
    use realtime_stream::ChangeType;
    use rstest::rstest;

    fn sub() -> Uuid {
        Uuid::parse_str("0f2b1a9e-7c44-4e0e-9d5a-1c3b6a2f9e77").unwrap()
    }

    fn event() -> ChangeEvent {
        ChangeEvent::new(sub(), "orders", ChangeType::Insert)
    }

    fn tracker(api: MockChangesApi, guarantee: DeliveryGuarantee) -> AckTracker {
        AckTracker::new(Arc::new(api), sub(), guarantee, 100)
    }

    #[test]
    fn test_id_window_evicts_oldest() {
        let mut window = IdWindow::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(window.insert(a));
        assert!(!window.insert(a));
        assert!(window.insert(b));
        assert!(window.insert(c));
        assert!(!window.contains(&a));
        assert!(window.contains(&b) && window.contains(&c));
    }

    #[rstest]
    #[case(DeliveryGuarantee::AtLeastOnce, [true, true], 1)]
    #[case(DeliveryGuarantee::ExactlyOnce, [true, false], 1)]
    #[case(DeliveryGuarantee::AtMostOnce, [true, false], 0)]
    fn test_redelivery_by_guarantee(
        #[case] guarantee: DeliveryGuarantee,
        #[case] delivered: [bool; 2],
        #[case] pending: usize,
    ) {
        let tracker = tracker(MockChangesApi::new(), guarantee);
        let event = event();

        assert_eq!([tracker.record(&event), tracker.record(&event)], delivered);
        assert_eq!(tracker.pending_count(), pending);
    }

    #[test]
    fn test_at_least_once_counts_deliveries() {
        let tracker = tracker(MockChangesApi::new(), DeliveryGuarantee::AtLeastOnce);
        let event = event();
        tracker.record(&event);
        tracker.record(&event);
        tracker.record(&event);

        let pending = tracker.get(&event.id).unwrap();
        assert_eq!(pending.delivery_count, 3);
        assert_eq!(pending.subscription_id, sub());
        assert_eq!(pending.payload, event);
    }

    #[tokio::test]
    async fn test_acknowledge_removes_pending() {
        let mut api = MockChangesApi::new();
        api.expect_acknowledge_changes()
            .withf(|subscription_id, ids| *subscription_id == sub() && ids.len() == 2)
            .times(1)
            .returning(|_, _| Ok(()));

        let tracker = tracker(api, DeliveryGuarantee::AtLeastOnce);
        let (a, b) = (event(), event());
        tracker.record(&a);
        tracker.record(&b);

        assert_eq!(tracker.acknowledge(&[a.id, b.id]).await.unwrap(), 2);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_acknowledge_keeps_pending() {
        let mut api = MockChangesApi::new();
        api.expect_acknowledge_changes()
            .times(1)
            .returning(|_, _| Err(CdcError::Rejected("try later".to_string())));

        let tracker = tracker(api, DeliveryGuarantee::AtLeastOnce);
        let event = event();
        tracker.record(&event);

        assert!(tracker.acknowledge(&[event.id]).await.is_err());
        assert!(tracker.is_pending(&event.id));
    }

    #[tokio::test]
    async fn test_empty_acknowledge_skips_server() {
        let tracker = tracker(MockChangesApi::new(), DeliveryGuarantee::AtLeastOnce);
        assert_eq!(tracker.acknowledge(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exactly_once_suppresses_acknowledged_ids() {
        let mut api = MockChangesApi::new();
        api.expect_acknowledge_changes().returning(|_, _| Ok(()));

        let tracker = tracker(api, DeliveryGuarantee::ExactlyOnce);
        let event = event();
        assert!(tracker.record(&event));
        tracker.acknowledge_pending().await.unwrap();

        assert!(!tracker.record(&event));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exactly_once_redelivery_racing_acknowledge() {
        for _ in 0..200 {
            let mut api = MockChangesApi::new();
            api.expect_acknowledge_changes().returning(|_, _| Ok(()));
            let tracker = Arc::new(tracker(api, DeliveryGuarantee::ExactlyOnce));
            let event = event();
            assert!(tracker.record(&event));

            let redelivery = {
                let (tracker, event) = (Arc::clone(&tracker), event.clone());
                tokio::task::spawn_blocking(move || tracker.record(&event))
            };
            assert_eq!(tracker.acknowledge(&[event.id]).await.unwrap(), 1);

            assert!(!redelivery.await.unwrap());
            assert!(!tracker.is_pending(&event.id));
        }
    }

    #[tokio::test]
    async fn test_poll_records_and_filters() {
        let first = event();
        let second = event();

        let mut api = MockChangesApi::new();
        let page = ChangesPage {
            events: vec![first.clone(), second.clone()],
            has_more: false,
            next_token: None,
            count: 2,
        };
        api.expect_get_changes()
            .withf(|_, limit, token| *limit == 10 && token.is_none())
            .times(2)
            .returning(move |_, _, _| Ok(page.clone()));

        let tracker = tracker(api, DeliveryGuarantee::ExactlyOnce);
        assert!(tracker.record(&first));

        let page = tracker.poll_changes(10, None).await.unwrap();
        assert_eq!(page.events, vec![second.clone()]);
        assert_eq!(page.count, 2);
        assert!(tracker.is_pending(&first.id) && tracker.is_pending(&second.id));

        let page = tracker.poll_changes(10, None).await.unwrap();
        assert!(page.events.is_empty());
    }

    #[tokio::test]
    async fn test_drain_follows_next_token() {
        let pages = vec![
            ChangesPage {
                events: vec![event()],
                has_more: true,
                next_token: Some("p2".to_string()),
                count: 1,
            },
            ChangesPage {
                events: vec![event(), event()],
                has_more: false,
                next_token: None,
                count: 2,
            },
        ];

        let mut api = MockChangesApi::new();
        let first = pages[0].clone();
        api.expect_get_changes()
            .withf(|_, _, token| token.is_none())
            .times(1)
            .returning(move |_, _, _| Ok(first.clone()));
        let second = pages[1].clone();
        api.expect_get_changes()
            .withf(|_, _, token| token.as_deref() == Some("p2"))
            .times(1)
            .returning(move |_, _, _| Ok(second.clone()));

        let tracker = tracker(api, DeliveryGuarantee::AtLeastOnce);
        let events = tracker.drain_changes(50).await.unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(tracker.pending_count(), 3);
    }

    #[tokio::test]
    async fn test_drain_stops_without_token() {
        let mut api = MockChangesApi::new();
        api.expect_get_changes().times(1).returning(|_, _, _| {
            Ok(ChangesPage {
                events: Vec::new(),
                has_more: true,
                next_token: None,
                count: 0,
            })
        });

        let tracker = tracker(api, DeliveryGuarantee::AtLeastOnce);
        assert!(tracker.drain_changes(10).await.unwrap().is_empty());
    }
}
