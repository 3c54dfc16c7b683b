//! Record store kept entirely in memory. Used for local runs and as the
//! reference implementation the SQLite backend is tested against.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::storage::{
    BroadcastStore, DbErrorGeneric, DbErrorWrite, DbPool, DbPoolCloseable, DeliveryLedger,
    EventSource, MarkOutcome, SubscriptionStore, UpsertSubscription,
};
use concepts::{
    BroadcastMessage, BusinessEvent, DeliveryRecord, DeviceId, Endpoint, EventId, EventKind,
    RecipientId, Subscription, TrackingKey,
};
use hashbrown::HashMap;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, instrument};

// std mutex because none of the functions block.
#[derive(Clone)]
pub struct InMemoryPool(Arc<std::sync::Mutex<DbHolder>>, Arc<AtomicBool>);

impl Default for InMemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPool {
    #[must_use]
    pub fn new() -> Self {
        Self(
            Arc::new(std::sync::Mutex::new(DbHolder::default())),
            Arc::new(AtomicBool::default()),
        )
    }

    fn connection(&self) -> InMemoryDbConnection {
        InMemoryDbConnection(self.0.clone(), self.1.clone())
    }

    /// Inserts or replaces a business event. Events are owned by an external
    /// collaborator, this exists to feed the engine in local runs and tests.
    pub fn upsert_event(&self, event: BusinessEvent) -> Result<(), DbErrorGeneric> {
        let conn = self.connection();
        let mut guard = conn.lock()?;
        guard.events.insert(event.id.clone(), event);
        Ok(())
    }

    /// Sets the `answered` flag, as the external collaborator would after the
    /// recipient responded.
    pub fn mark_event_answered(&self, event_id: &EventId) -> Result<bool, DbErrorGeneric> {
        let conn = self.connection();
        let mut guard = conn.lock()?;
        Ok(guard
            .events
            .get_mut(event_id)
            .map(|event| event.answered = true)
            .is_some())
    }

    /// Number of ledger rows, for asserting that racing writers produced one row.
    pub fn ledger_len(&self) -> Result<usize, DbErrorGeneric> {
        let conn = self.connection();
        let guard = conn.lock()?;
        Ok(guard.ledger.len())
    }
}

#[async_trait]
impl DbPoolCloseable for InMemoryPool {
    async fn close(self) {
        let was_open = self
            .1
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        debug!(was_open, "Closing in-memory pool");
    }
}

impl DbPool for InMemoryPool {
    fn subscriptions(&self) -> Arc<dyn SubscriptionStore> {
        Arc::new(self.connection())
    }

    fn ledger(&self) -> Arc<dyn DeliveryLedger> {
        Arc::new(self.connection())
    }

    fn events(&self) -> Arc<dyn EventSource> {
        Arc::new(self.connection())
    }

    fn broadcasts(&self) -> Arc<dyn BroadcastStore> {
        Arc::new(self.connection())
    }
}

#[derive(Default)]
struct DbHolder {
    // recipient -> endpoint -> subscription, insertion ordered
    subscriptions: IndexMap<RecipientId, IndexMap<Endpoint, Subscription>>,
    ledger: HashMap<TrackingKey, DeliveryRecord>,
    // Insertion order breaks ties between records sharing `sent_at`.
    ledger_order: Vec<TrackingKey>,
    events: HashMap<EventId, BusinessEvent>,
    // oldest first
    broadcasts: VecDeque<BroadcastMessage>,
}

struct InMemoryDbConnection(Arc<std::sync::Mutex<DbHolder>>, Arc<AtomicBool>);

impl InMemoryDbConnection {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DbHolder>, DbErrorGeneric> {
        if self.1.load(Ordering::Acquire) {
            return Err(DbErrorGeneric::Close);
        }
        self.0
            .lock()
            .map_err(|_poisoned| DbErrorGeneric::Uncategorized("mutex poisoned".into()))
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryDbConnection {
    #[instrument(level = "trace", skip(self))]
    async fn list_by_recipient(
        &self,
        recipient_id: &RecipientId,
    ) -> Result<Vec<Subscription>, DbErrorGeneric> {
        let guard = self.lock()?;
        Ok(guard
            .subscriptions
            .get(recipient_id)
            .map(|by_endpoint| by_endpoint.values().cloned().collect())
            .unwrap_or_default())
    }

    #[instrument(level = "trace", skip(self))]
    async fn list_by_recipients(
        &self,
        recipient_ids: &[RecipientId],
    ) -> Result<Vec<Subscription>, DbErrorGeneric> {
        let guard = self.lock()?;
        let mut seen = hashbrown::HashSet::new();
        Ok(recipient_ids
            .iter()
            .filter(|recipient_id| seen.insert(*recipient_id))
            .filter_map(|recipient_id| guard.subscriptions.get(recipient_id))
            .flat_map(|by_endpoint| by_endpoint.values().cloned())
            .collect())
    }

    #[instrument(level = "trace", skip(self))]
    async fn list_all(&self) -> Result<Vec<Subscription>, DbErrorGeneric> {
        let guard = self.lock()?;
        Ok(guard
            .subscriptions
            .values()
            .flat_map(|by_endpoint| by_endpoint.values().cloned())
            .collect())
    }

    #[instrument(level = "debug", skip_all, fields(recipient_id = %subscription.recipient_id, endpoint = %subscription.endpoint))]
    async fn upsert(&self, subscription: UpsertSubscription) -> Result<(), DbErrorWrite> {
        let mut guard = self.lock()?;
        // An endpoint belongs to exactly one recipient at a time.
        for (owner, by_endpoint) in &mut guard.subscriptions {
            if *owner != subscription.recipient_id {
                by_endpoint.shift_remove(&subscription.endpoint);
            }
        }
        guard.subscriptions.retain(|_, by_endpoint| !by_endpoint.is_empty());
        let by_endpoint = guard
            .subscriptions
            .entry(subscription.recipient_id.clone())
            .or_default();
        let created_at = by_endpoint
            .get(&subscription.endpoint)
            .map_or(subscription.created_at, |existing| existing.created_at);
        let endpoint = subscription.endpoint.clone();
        let mut subscription = Subscription::from(subscription);
        subscription.created_at = created_at;
        by_endpoint.insert(endpoint, subscription);
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn remove(
        &self,
        recipient_id: &RecipientId,
        endpoint: &Endpoint,
    ) -> Result<bool, DbErrorWrite> {
        let mut guard = self.lock()?;
        let Some(by_endpoint) = guard.subscriptions.get_mut(recipient_id) else {
            return Ok(false);
        };
        let removed = by_endpoint.shift_remove(endpoint).is_some();
        if by_endpoint.is_empty() {
            guard.subscriptions.shift_remove(recipient_id);
        }
        Ok(removed)
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryDbConnection {
    async fn is_marked(&self, tracking_key: &TrackingKey) -> Result<bool, DbErrorGeneric> {
        Ok(self.lock()?.ledger.contains_key(tracking_key))
    }

    #[instrument(level = "debug", skip(self))]
    async fn mark(
        &self,
        tracking_key: &TrackingKey,
        recipient_id: &RecipientId,
        device_id: Option<&DeviceId>,
        sent_at: DateTime<Utc>,
    ) -> Result<MarkOutcome, DbErrorWrite> {
        let mut guard = self.lock()?;
        if guard.ledger.contains_key(tracking_key) {
            return Ok(MarkOutcome::AlreadyMarked);
        }
        guard.ledger.insert(
            tracking_key.clone(),
            DeliveryRecord {
                tracking_key: tracking_key.clone(),
                recipient_id: recipient_id.clone(),
                sent_at,
                device_id: device_id.cloned(),
            },
        );
        guard.ledger_order.push(tracking_key.clone());
        Ok(MarkOutcome::Inserted)
    }

    async fn history(
        &self,
        recipient_id: &RecipientId,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>, DbErrorGeneric> {
        let guard = self.lock()?;
        let mut records: Vec<(usize, &DeliveryRecord)> = guard
            .ledger_order
            .iter()
            .enumerate()
            .filter_map(|(idx, key)| guard.ledger.get(key).map(|record| (idx, record)))
            .filter(|(_, record)| record.recipient_id == *recipient_id)
            .collect();
        records.sort_by(|(idx_a, a), (idx_b, b)| {
            b.sent_at.cmp(&a.sent_at).then_with(|| idx_b.cmp(idx_a))
        });
        Ok(records
            .into_iter()
            .take(limit as usize)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[async_trait]
impl EventSource for InMemoryDbConnection {
    #[instrument(level = "trace", skip(self))]
    async fn due_events(
        &self,
        kind: &EventKind,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<BusinessEvent>, DbErrorGeneric> {
        let guard = self.lock()?;
        let mut events: Vec<_> = guard
            .events
            .values()
            .filter(|event| {
                event.kind == *kind
                    && !event.answered
                    && event.end_time >= window_start
                    && event.end_time <= window_end
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| a.end_time.cmp(&b.end_time).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }
}

#[async_trait]
impl BroadcastStore for InMemoryDbConnection {
    #[instrument(level = "debug", skip_all, fields(id = %message.id))]
    async fn append(&self, message: BroadcastMessage, retain: u32) -> Result<(), DbErrorWrite> {
        let mut guard = self.lock()?;
        guard.broadcasts.push_back(message);
        while guard.broadcasts.len() > retain as usize {
            guard.broadcasts.pop_front();
        }
        Ok(())
    }

    async fn list(&self, limit: u32) -> Result<Vec<BroadcastMessage>, DbErrorGeneric> {
        let guard = self.lock()?;
        Ok(guard
            .broadcasts
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn upsert(recipient: &str, endpoint: &str) -> UpsertSubscription {
        UpsertSubscription {
            recipient_id: RecipientId::new_unchecked(recipient),
            endpoint: Endpoint::new_unchecked(endpoint),
            auth_secret: "auth".to_string(),
            encryption_key: "key".to_string(),
            created_at: at(0),
        }
    }

    #[tokio::test]
    async fn moving_endpoint_to_another_recipient() {
        let pool = InMemoryPool::new();
        let subscriptions = pool.subscriptions();
        subscriptions.upsert(upsert("alice", "https://push/1")).await.unwrap();
        subscriptions.upsert(upsert("bob", "https://push/1")).await.unwrap();
        let all = subscriptions.list_all().await.unwrap();
        assert_eq!(1, all.len());
        assert_eq!("bob", all[0].recipient_id.as_str());
    }

    #[tokio::test]
    async fn refresh_keeps_created_at() {
        let pool = InMemoryPool::new();
        let subscriptions = pool.subscriptions();
        subscriptions.upsert(upsert("alice", "https://push/1")).await.unwrap();
        let mut refreshed = upsert("alice", "https://push/1");
        refreshed.created_at = at(100);
        refreshed.auth_secret = "rotated".to_string();
        subscriptions.upsert(refreshed).await.unwrap();
        let list = subscriptions
            .list_by_recipient(&RecipientId::new_unchecked("alice"))
            .await
            .unwrap();
        assert_eq!(1, list.len());
        assert_eq!(at(0), list[0].created_at);
        assert_eq!("rotated", list[0].auth_secret);
    }

    #[tokio::test]
    async fn closed_pool_reports_close() {
        let pool = InMemoryPool::new();
        let ledger = pool.ledger();
        pool.clone().close().await;
        let key = TrackingKey::from_parts(&["k"]).unwrap();
        assert_matches!(ledger.is_marked(&key).await, Err(DbErrorGeneric::Close));
        assert_matches!(
            pool.upsert_event(BusinessEvent {
                id: EventId::new_unchecked("e1"),
                owner_id: RecipientId::new_unchecked("alice"),
                kind: EventKind::new_unchecked("appointment"),
                end_time: at(0),
                has_outcome: false,
                answered: false,
            }),
            Err(DbErrorGeneric::Close)
        );
    }

    #[tokio::test]
    async fn history_ties_are_broken_by_insertion_order() {
        let pool = InMemoryPool::new();
        let ledger = pool.ledger();
        let alice = RecipientId::new_unchecked("alice");
        for key in ["a", "b", "c"] {
            let key = TrackingKey::from_parts(&[key]).unwrap();
            ledger.mark(&key, &alice, None, at(5)).await.unwrap();
        }
        let history = ledger.history(&alice, 2).await.unwrap();
        let keys: Vec<_> = history.iter().map(|r| r.tracking_key.as_str()).collect();
        assert_eq!(vec!["c", "b"], keys);
    }
}
