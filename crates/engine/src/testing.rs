use crate::{
    dispatcher::{Dispatcher, DispatcherConfig},
    registry::SubscriptionRegistry,
    tracker::DeliveryTracker,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::{
    DeliveryRecord, DeviceId, Endpoint, RecipientId, TrackingKey,
    storage::{DbErrorGeneric, DbErrorWrite, DbPool, DeliveryLedger, MarkOutcome},
};
use db_mem::inmemory_dao::InMemoryPool;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use test_utils::{observer::RecordingObserver, sim_clock::SimClock, transport::ScriptedTransport};

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

pub(crate) async fn subscribe(registry: &SubscriptionRegistry, recipient: &str, endpoint: &str) {
    assert!(
        registry
            .upsert(
                RecipientId::new_unchecked(recipient),
                Endpoint::new_unchecked(endpoint),
                "auth".to_string(),
                "key".to_string(),
                at(0),
            )
            .await
    );
}

/// In-memory engine wired to a scripted transport.
pub(crate) struct Fixture {
    pub(crate) pool: InMemoryPool,
    pub(crate) transport: ScriptedTransport,
    pub(crate) observer: RecordingObserver,
    pub(crate) clock: SimClock,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) tracker: DeliveryTracker<SimClock>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self::with_ledger(None)
    }

    /// Uses `ledger` instead of the pool's ledger.
    pub(crate) fn with_ledger(ledger: Option<Arc<dyn DeliveryLedger>>) -> Self {
        let pool = InMemoryPool::new();
        let transport = ScriptedTransport::new();
        let observer = RecordingObserver::new();
        let clock = SimClock::new(at(0));
        let registry = SubscriptionRegistry::new(pool.subscriptions(), Arc::new(observer.clone()));
        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(transport.clone()),
            DispatcherConfig {
                send_timeout: Duration::from_secs(1),
                max_concurrent_sends: 4,
            },
            Arc::new(observer.clone()),
        );
        let tracker = DeliveryTracker::new(
            ledger.unwrap_or_else(|| pool.ledger()),
            clock.clone(),
            Arc::new(observer.clone()),
        );
        Self {
            pool,
            transport,
            observer,
            clock,
            dispatcher,
            tracker,
        }
    }
}

/// Ledger counting `mark` calls. Either forwards to an inner ledger or fails every call.
pub(crate) struct SpyLedger {
    inner: Option<Arc<dyn DeliveryLedger>>,
    marks: AtomicUsize,
}

impl SpyLedger {
    pub(crate) fn wrapping(inner: Arc<dyn DeliveryLedger>) -> Self {
        Self {
            inner: Some(inner),
            marks: AtomicUsize::default(),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            inner: None,
            marks: AtomicUsize::default(),
        }
    }

    pub(crate) fn marks(&self) -> usize {
        self.marks.load(Ordering::SeqCst)
    }

    fn inner(&self) -> Result<&Arc<dyn DeliveryLedger>, DbErrorGeneric> {
        self.inner
            .as_ref()
            .ok_or(DbErrorGeneric::Uncategorized("injected failure".into()))
    }
}

#[async_trait]
impl DeliveryLedger for SpyLedger {
    async fn is_marked(&self, tracking_key: &TrackingKey) -> Result<bool, DbErrorGeneric> {
        self.inner()?.is_marked(tracking_key).await
    }

    async fn mark(
        &self,
        tracking_key: &TrackingKey,
        recipient_id: &RecipientId,
        device_id: Option<&DeviceId>,
        sent_at: DateTime<Utc>,
    ) -> Result<MarkOutcome, DbErrorWrite> {
        self.marks.fetch_add(1, Ordering::SeqCst);
        self.inner()?
            .mark(tracking_key, recipient_id, device_id, sent_at)
            .await
    }

    async fn history(
        &self,
        recipient_id: &RecipientId,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>, DbErrorGeneric> {
        self.inner()?.history(recipient_id, limit).await
    }
}
