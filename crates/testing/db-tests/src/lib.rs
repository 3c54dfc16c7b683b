use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::{
    BusinessEvent, EventId, EventKind, RecipientId,
    storage::{
        BroadcastStore, DbErrorGeneric, DbPool, DbPoolCloseable, DeliveryLedger, EventSource,
        SubscriptionStore, UpsertSubscription,
    },
};
use db_mem::inmemory_dao::InMemoryPool;
use db_sqlite::sqlite_dao::SqlitePool;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Fixed instant all contract tests count from.
#[must_use]
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("timestamp is in range")
}

#[must_use]
pub fn subscription(recipient_id: &str, endpoint: &str, secs: i64) -> UpsertSubscription {
    UpsertSubscription {
        recipient_id: RecipientId::new_unchecked(recipient_id),
        endpoint: concepts::Endpoint::new_unchecked(endpoint),
        auth_secret: format!("auth-{endpoint}"),
        encryption_key: format!("key-{endpoint}"),
        created_at: at(secs),
    }
}

#[must_use]
pub fn event(id: &str, owner: &str, kind: &str, end_secs: i64) -> BusinessEvent {
    BusinessEvent {
        id: EventId::new_unchecked(id),
        owner_id: RecipientId::new_unchecked(owner),
        kind: EventKind::new_unchecked(kind),
        end_time: at(end_secs),
        has_outcome: false,
        answered: false,
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Database {
    Memory,
    Sqlite,
}

pub enum DbGuard {
    Memory,
    Sqlite(Option<NamedTempFile>),
}

impl Database {
    pub async fn set_up(self) -> (DbGuard, DbPoolEnum) {
        match self {
            Database::Memory => (DbGuard::Memory, DbPoolEnum::Memory(InMemoryPool::new())),
            Database::Sqlite => {
                use db_sqlite::sqlite_dao::tempfile::sqlite_pool;
                let (db_pool, guard) = sqlite_pool().await;
                (DbGuard::Sqlite(guard), DbPoolEnum::Sqlite(db_pool))
            }
        }
    }
}

#[derive(Clone)]
pub enum DbPoolEnum {
    Memory(InMemoryPool),
    Sqlite(SqlitePool),
}

impl DbPoolEnum {
    /// Writes directly to the event table, standing in for the external event producer.
    pub async fn upsert_event(&self, event: BusinessEvent) -> Result<(), DbErrorGeneric> {
        match self {
            DbPoolEnum::Memory(pool) => pool.upsert_event(event),
            DbPoolEnum::Sqlite(pool) => pool.upsert_event(event).await.map_err(generic),
        }
    }

    pub async fn mark_event_answered(&self, event_id: &EventId) -> Result<bool, DbErrorGeneric> {
        match self {
            DbPoolEnum::Memory(pool) => pool.mark_event_answered(event_id),
            DbPoolEnum::Sqlite(pool) => pool.mark_event_answered(event_id).await.map_err(generic),
        }
    }

    pub async fn ledger_len(&self) -> Result<usize, DbErrorGeneric> {
        match self {
            DbPoolEnum::Memory(pool) => pool.ledger_len(),
            DbPoolEnum::Sqlite(pool) => pool.ledger_len().await,
        }
    }
}

fn generic(err: concepts::storage::DbErrorWrite) -> DbErrorGeneric {
    match err {
        concepts::storage::DbErrorWrite::Generic(err) => err,
        concepts::storage::DbErrorWrite::ValidationFailed(reason) => {
            DbErrorGeneric::Uncategorized(reason)
        }
    }
}

impl DbPool for DbPoolEnum {
    fn subscriptions(&self) -> Arc<dyn SubscriptionStore> {
        match self {
            DbPoolEnum::Memory(pool) => pool.subscriptions(),
            DbPoolEnum::Sqlite(pool) => pool.subscriptions(),
        }
    }

    fn ledger(&self) -> Arc<dyn DeliveryLedger> {
        match self {
            DbPoolEnum::Memory(pool) => pool.ledger(),
            DbPoolEnum::Sqlite(pool) => pool.ledger(),
        }
    }

    fn events(&self) -> Arc<dyn EventSource> {
        match self {
            DbPoolEnum::Memory(pool) => pool.events(),
            DbPoolEnum::Sqlite(pool) => pool.events(),
        }
    }

    fn broadcasts(&self) -> Arc<dyn BroadcastStore> {
        match self {
            DbPoolEnum::Memory(pool) => pool.broadcasts(),
            DbPoolEnum::Sqlite(pool) => pool.broadcasts(),
        }
    }
}

#[async_trait]
impl DbPoolCloseable for DbPoolEnum {
    async fn close(self) {
        match self {
            DbPoolEnum::Memory(pool) => pool.close().await,
            DbPoolEnum::Sqlite(pool) => pool.close().await,
        }
    }
}
