//! Idempotency ledger access. Sole writer of delivery records.
use concepts::{
    DeliveryRecord, DeviceId, RecipientId, TrackingKey,
    observer::{EngineEvent, Fallback, Observer, StoreOperation},
    storage::{DbErrorGeneric, DeliveryLedger, MarkOutcome},
    time::ClockFn,
};
use std::sync::Arc;
use tracing::{Level, debug, instrument, warn};

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

#[derive(Clone)]
pub struct DeliveryTracker<C: ClockFn> {
    ledger: Arc<dyn DeliveryLedger>,
    clock_fn: C,
    observer: Arc<dyn Observer>,
}

impl<C: ClockFn> DeliveryTracker<C> {
    #[must_use]
    pub fn new(ledger: Arc<dyn DeliveryLedger>, clock_fn: C, observer: Arc<dyn Observer>) -> Self {
        Self {
            ledger,
            clock_fn,
            observer,
        }
    }

    /// `true` iff the notification was already issued.
    /// Fails closed: a store error answers `true`.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn is_sent(&self, tracking_key: &TrackingKey) -> bool {
        match self.ledger.is_marked(tracking_key).await {
            Ok(sent) => sent,
            Err(err) => self.fail_closed(&err),
        }
    }

    fn fail_closed(&self, err: &DbErrorGeneric) -> bool {
        warn!("Cannot read the delivery ledger, assuming sent - {err:?}");
        self.observer.on_event(&EngineEvent::StoreFallback {
            operation: StoreOperation::IsSent,
            fallback: Fallback::AssumeSent,
        });
        true
    }

    /// Records the notification as issued. A key that was already marked counts
    /// as success. Returns `false` only when the store failed.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn mark_sent(
        &self,
        tracking_key: &TrackingKey,
        recipient_id: &RecipientId,
        device_id: Option<&DeviceId>,
    ) -> bool {
        match self
            .ledger
            .mark(tracking_key, recipient_id, device_id, self.clock_fn.now())
            .await
        {
            Ok(MarkOutcome::Inserted) => {
                self.observer.on_event(&EngineEvent::NotificationMarked {
                    tracking_key: tracking_key.clone(),
                    recipient_id: recipient_id.clone(),
                });
                true
            }
            Ok(MarkOutcome::AlreadyMarked) => {
                debug!("Already marked");
                true
            }
            Err(err) => {
                warn!("Cannot mark as sent - {err:?}");
                self.observer.on_event(&EngineEvent::StoreFallback {
                    operation: StoreOperation::MarkSent,
                    fallback: Fallback::ReportedFailure,
                });
                false
            }
        }
    }

    /// Newest first, at most `limit` records, [`DEFAULT_HISTORY_LIMIT`] if not set.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn history(&self, recipient_id: &RecipientId, limit: Option<u32>) -> Vec<DeliveryRecord> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        match self.ledger.history(recipient_id, limit).await {
            Ok(records) => records,
            Err(err) => {
                warn!("Cannot read the delivery history - {err:?}");
                self.observer.on_event(&EngineEvent::StoreFallback {
                    operation: StoreOperation::History,
                    fallback: Fallback::EmptyList,
                });
                Vec::new()
            }
        }
    }
}
