//! Sole writer of subscription rows.
use chrono::{DateTime, Utc};
use concepts::{
    Endpoint, RecipientId, Subscription,
    observer::{EngineEvent, Fallback, Observer, StoreOperation},
    storage::{SubscriptionStore, UpsertSubscription},
};
use std::sync::Arc;
use tracing::{Level, debug, instrument, warn};

#[derive(Clone)]
pub struct SubscriptionRegistry {
    store: Arc<dyn SubscriptionStore>,
    observer: Arc<dyn Observer>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn SubscriptionStore>, observer: Arc<dyn Observer>) -> Self {
        Self { store, observer }
    }

    /// Live subscriptions of the recipient. A store failure yields an empty list.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn list(&self, recipient_id: &RecipientId) -> Vec<Subscription> {
        match self.store.list_by_recipient(recipient_id).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                warn!("Cannot list subscriptions - {err:?}");
                self.fallback(StoreOperation::ListSubscriptions, Fallback::EmptyList);
                Vec::new()
            }
        }
    }

    /// Subscriptions of all listed recipients. A store failure yields an empty list.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn list_many(&self, recipient_ids: &[RecipientId]) -> Vec<Subscription> {
        match self.store.list_by_recipients(recipient_ids).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                warn!("Cannot list subscriptions - {err:?}");
                self.fallback(StoreOperation::ListSubscriptions, Fallback::EmptyList);
                Vec::new()
            }
        }
    }

    /// Every known subscription. A store failure yields an empty list.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn list_all(&self) -> Vec<Subscription> {
        match self.store.list_all().await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                warn!("Cannot list all subscriptions - {err:?}");
                self.fallback(StoreOperation::ListSubscriptions, Fallback::EmptyList);
                Vec::new()
            }
        }
    }

    /// Returns `false` only when the store failed. Removing a missing row succeeds.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn remove(&self, recipient_id: &RecipientId, endpoint: &Endpoint) -> bool {
        match self.store.remove(recipient_id, endpoint).await {
            Ok(existed) => {
                if existed {
                    self.observer.on_event(&EngineEvent::SubscriptionRemoved {
                        recipient_id: recipient_id.clone(),
                        endpoint: endpoint.clone(),
                    });
                } else {
                    debug!("Subscription was already gone");
                }
                true
            }
            Err(err) => {
                warn!("Cannot remove subscription - {err:?}");
                self.fallback(StoreOperation::RemoveSubscription, Fallback::ReportedFailure);
                false
            }
        }
    }

    /// Registers or refreshes the `(recipient_id, endpoint)` subscription.
    /// Returns `false` only when the store failed.
    #[instrument(level = Level::DEBUG, skip(self, auth_secret, encryption_key))]
    pub async fn upsert(
        &self,
        recipient_id: RecipientId,
        endpoint: Endpoint,
        auth_secret: String,
        encryption_key: String,
        now: DateTime<Utc>,
    ) -> bool {
        let subscription = UpsertSubscription {
            recipient_id,
            endpoint,
            auth_secret,
            encryption_key,
            created_at: now,
        };
        match self.store.upsert(subscription).await {
            Ok(()) => true,
            Err(err) => {
                warn!("Cannot upsert subscription - {err:?}");
                self.fallback(StoreOperation::UpsertSubscription, Fallback::ReportedFailure);
                false
            }
        }
    }

    fn fallback(&self, operation: StoreOperation, fallback: Fallback) {
        self.observer.on_event(&EngineEvent::StoreFallback {
            operation,
            fallback,
        });
    }
}
