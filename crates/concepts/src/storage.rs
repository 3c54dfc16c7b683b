//! Record store seams. Each entity is written through exactly one trait.
use crate::{
    BroadcastMessage, BusinessEvent, DeliveryRecord, DeviceId, Endpoint, EventKind, RecipientId,
    StrVariant, Subscription, TrackingKey,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum DbErrorGeneric {
    #[error("database error: {0}")]
    Uncategorized(StrVariant),
    #[error("database was closed")]
    Close,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum DbErrorWrite {
    #[error("validation failed: {0}")]
    ValidationFailed(StrVariant),
    #[error(transparent)]
    Generic(#[from] DbErrorGeneric),
}

/// Result of an idempotent ledger insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum MarkOutcome {
    Inserted,
    /// A row with the same tracking key already existed, nothing was written.
    AlreadyMarked,
}

#[derive(Debug, Clone)]
pub struct UpsertSubscription {
    pub recipient_id: RecipientId,
    pub endpoint: Endpoint,
    pub auth_secret: String,
    pub encryption_key: String,
    pub created_at: DateTime<Utc>,
}

impl From<UpsertSubscription> for Subscription {
    fn from(value: UpsertSubscription) -> Self {
        Subscription {
            recipient_id: value.recipient_id,
            endpoint: value.endpoint,
            auth_secret: value.auth_secret,
            encryption_key: value.encryption_key,
            created_at: value.created_at,
        }
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn list_by_recipient(
        &self,
        recipient_id: &RecipientId,
    ) -> Result<Vec<Subscription>, DbErrorGeneric>;

    async fn list_by_recipients(
        &self,
        recipient_ids: &[RecipientId],
    ) -> Result<Vec<Subscription>, DbErrorGeneric>;

    async fn list_all(&self) -> Result<Vec<Subscription>, DbErrorGeneric>;

    /// Registers or refreshes the subscription keyed by `(recipient_id, endpoint)`.
    /// An endpoint previously owned by another recipient is moved over.
    async fn upsert(&self, subscription: UpsertSubscription) -> Result<(), DbErrorWrite>;

    /// Returns `false` when there was nothing to delete.
    async fn remove(
        &self,
        recipient_id: &RecipientId,
        endpoint: &Endpoint,
    ) -> Result<bool, DbErrorWrite>;
}

#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    async fn is_marked(&self, tracking_key: &TrackingKey) -> Result<bool, DbErrorGeneric>;

    /// Insert-on-conflict-do-nothing keyed by `tracking_key`.
    async fn mark(
        &self,
        tracking_key: &TrackingKey,
        recipient_id: &RecipientId,
        device_id: Option<&DeviceId>,
        sent_at: DateTime<Utc>,
    ) -> Result<MarkOutcome, DbErrorWrite>;

    /// Newest first.
    async fn history(
        &self,
        recipient_id: &RecipientId,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>, DbErrorGeneric>;
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Unanswered events of `kind` with `window_start <= end_time <= window_end`.
    async fn due_events(
        &self,
        kind: &EventKind,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<BusinessEvent>, DbErrorGeneric>;
}

#[async_trait]
pub trait BroadcastStore: Send + Sync {
    /// Appends the message and drops everything but the `retain` newest entries.
    async fn append(&self, message: BroadcastMessage, retain: u32) -> Result<(), DbErrorWrite>;

    /// Newest first.
    async fn list(&self, limit: u32) -> Result<Vec<BroadcastMessage>, DbErrorGeneric>;
}

pub trait DbPool: Send + Sync {
    fn subscriptions(&self) -> Arc<dyn SubscriptionStore>;
    fn ledger(&self) -> Arc<dyn DeliveryLedger>;
    fn events(&self) -> Arc<dyn EventSource>;
    fn broadcasts(&self) -> Arc<dyn BroadcastStore>;
}

#[async_trait]
pub trait DbPoolCloseable {
    async fn close(self);
}
