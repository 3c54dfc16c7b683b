use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::{
    BroadcastMessage, BusinessEvent, DeliveryRecord, DeviceId, Endpoint, EventId, EventKind,
    RecipientId, Subscription, TrackingKey,
    storage::{
        BroadcastStore, DbErrorGeneric, DbErrorWrite, DbPool, DbPoolCloseable, DeliveryLedger,
        EventSource, MarkOutcome, SubscriptionStore, UpsertSubscription,
    },
};
use conversions::{JsonWrapper, prepare_err_generic, result_err_generic};
use hashbrown::{HashMap, HashSet};
use rusqlite::{Connection, OpenFlags, Params, Row, Transaction, named_params};
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{Level, Span, debug, debug_span, error, info, instrument, trace, warn};

#[derive(Debug, thiserror::Error)]
#[error("initialization error")]
pub struct InitializationError;

/*
mmap_size = 128MB - Set the global memory map so all processes can share some data
https://www.sqlite.org/pragma.html#pragma_mmap_size
https://www.sqlite.org/mmap.html

journal_size_limit = 64 MB - limit on the WAL file to prevent unlimited growth
https://www.sqlite.org/pragma.html#pragma_journal_size_limit
*/
const PRAGMA: [[&str; 2]; 9] = [
    ["journal_mode", "wal"],
    ["synchronous", "FULL"],
    ["foreign_keys", "true"],
    ["busy_timeout", "1000"],
    ["cache_size", "10000"], // number of pages
    ["temp_store", "MEMORY"],
    ["mmap_size", "134217728"],
    ["journal_size_limit", "67108864"],
    ["integrity_check", ""],
];

// Append only
const CREATE_TABLE_T_METADATA: &str = r"
CREATE TABLE IF NOT EXISTS t_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schema_version INTEGER NOT NULL,
    created_at TEXT NOT NULL
) STRICT
";
const T_METADATA_EXPECTED_SCHEMA_VERSION: u32 = 1;

/// Push endpoints. Owned by the subscription registry.
/// An endpoint can belong to a single recipient only.
const CREATE_TABLE_T_SUBSCRIPTION: &str = r"
CREATE TABLE IF NOT EXISTS t_subscription (
    recipient_id TEXT NOT NULL,
    endpoint TEXT NOT NULL UNIQUE,
    auth_secret TEXT NOT NULL,
    encryption_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (recipient_id, endpoint)
) STRICT
";

/// Idempotency ledger. Rows are inserted once and never updated.
const CREATE_TABLE_T_DELIVERY_RECORD: &str = r"
CREATE TABLE IF NOT EXISTS t_delivery_record (
    tracking_key TEXT PRIMARY KEY NOT NULL,
    recipient_id TEXT NOT NULL,
    device_id TEXT,
    sent_at TEXT NOT NULL
) STRICT
";
// Used in `history`
const IDX_T_DELIVERY_RECORD_RECIPIENT_SENT_AT: &str = r"
CREATE INDEX IF NOT EXISTS idx_t_delivery_record_recipient_sent_at ON t_delivery_record (recipient_id, sent_at);
";

/// Business events are written by an external collaborator, the engine only reads them.
const CREATE_TABLE_T_BUSINESS_EVENT: &str = r"
CREATE TABLE IF NOT EXISTS t_business_event (
    id TEXT PRIMARY KEY NOT NULL,
    owner_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    end_time TEXT NOT NULL,
    has_outcome INTEGER NOT NULL,
    answered INTEGER NOT NULL
) STRICT
";
// Used in `due_events`
const IDX_T_BUSINESS_EVENT_KIND_END_TIME: &str = r"
CREATE INDEX IF NOT EXISTS idx_t_business_event_kind_end_time ON t_business_event (kind, end_time) WHERE answered = 0;
";

/// Audit log of manual broadcasts, trimmed on every append.
const CREATE_TABLE_T_BROADCAST: &str = r"
CREATE TABLE IF NOT EXISTS t_broadcast (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    broadcast_id TEXT NOT NULL UNIQUE,
    text TEXT NOT NULL,
    recipient_selector TEXT NOT NULL,
    sent_count INTEGER NOT NULL,
    failed_count INTEGER NOT NULL,
    total_targeted INTEGER NOT NULL,
    issued_by TEXT NOT NULL,
    issued_at TEXT NOT NULL
) STRICT
";

mod conversions {

    use concepts::storage::DbErrorGeneric;
    use rusqlite::types::{FromSql, FromSqlError};
    use std::fmt::Debug;
    use tracing::error;

    #[expect(clippy::needless_pass_by_value)]
    pub(crate) fn prepare_err_generic(err: rusqlite::Error) -> DbErrorGeneric {
        error!(backtrace = %std::backtrace::Backtrace::capture(), "Sqlite error {err:?}");
        DbErrorGeneric::Uncategorized(err.to_string().into())
    }
    #[expect(clippy::needless_pass_by_value)]
    pub(crate) fn result_err_generic(err: rusqlite::Error) -> DbErrorGeneric {
        error!(backtrace = %std::backtrace::Backtrace::capture(), "Sqlite error {err:?}");
        DbErrorGeneric::Uncategorized(err.to_string().into())
    }

    pub(crate) struct JsonWrapper<T>(pub(crate) T);
    impl<T: serde::de::DeserializeOwned + 'static + Debug> FromSql for JsonWrapper<T> {
        fn column_result(
            value: rusqlite::types::ValueRef<'_>,
        ) -> rusqlite::types::FromSqlResult<Self> {
            let value = match value {
                rusqlite::types::ValueRef::Text(value) | rusqlite::types::ValueRef::Blob(value) => {
                    Ok(value)
                }
                other => {
                    error!(
                        "Unexpected type when conveting to JSON - expected Text or Blob, got type `{other:?}`",
                    );
                    Err(FromSqlError::InvalidType)
                }
            }?;
            let value = serde_json::from_slice::<T>(value).map_err(|err| {
                error!(
                    "Cannot convert JSON value `{value:?}` to type:`{type}` - {err:?}",
                    r#type = std::any::type_name::<T>()
                );
                FromSqlError::InvalidType
            })?;
            Ok(Self(value))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandPriority {
    // Write, Shutdown
    High,
    // Read
    Medium,
    // Event scan
    Low,
}

#[derive(derive_more::Debug)]
enum ThreadCommand {
    Func {
        #[debug(skip)]
        func: Box<dyn FnOnce(&mut Connection) + Send>,
        priority: CommandPriority,
        sent_at: Instant,
        name: &'static str,
    },
    Shutdown,
    Dummy,
}

#[derive(Clone)]
pub struct SqlitePool(SqlitePoolInner);

#[derive(Clone)]
struct SqlitePoolInner {
    shutdown_requested: Arc<AtomicBool>,
    shutdown_finished: Arc<AtomicBool>,
    command_tx: tokio::sync::mpsc::Sender<ThreadCommand>,
    join_handle: Option<Arc<std::thread::JoinHandle<()>>>, // always Some, Optional for swapping in drop.
}

#[async_trait]
impl DbPoolCloseable for SqlitePool {
    async fn close(self) {
        self.0.shutdown_requested.store(true, Ordering::Release);
        // Unblock the thread's blocking_recv. If the capacity is reached, the next processed message will trigger shutdown.
        let _ = self.0.command_tx.try_send(ThreadCommand::Shutdown);
        while !self.0.shutdown_finished.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl DbPool for SqlitePool {
    fn subscriptions(&self) -> Arc<dyn SubscriptionStore> {
        Arc::new(self.clone())
    }

    fn ledger(&self) -> Arc<dyn DeliveryLedger> {
        Arc::new(self.clone())
    }

    fn events(&self) -> Arc<dyn EventSource> {
        Arc::new(self.clone())
    }

    fn broadcasts(&self) -> Arc<dyn BroadcastStore> {
        Arc::new(self.clone())
    }
}

impl Drop for SqlitePool {
    fn drop(&mut self) {
        let Some(arc) = self.0.join_handle.take() else {
            return;
        };
        if let Ok(join_handle) = Arc::try_unwrap(arc) {
            // Last holder
            if !join_handle.is_finished() && !self.0.shutdown_finished.load(Ordering::Acquire) {
                // Best effort to shut down the sqlite thread.
                warn!("SqlitePool was not closed properly");
                self.0.shutdown_requested.store(true, Ordering::Release);
                let _ = self.0.command_tx.try_send(ThreadCommand::Shutdown);
                // Not joining the thread, drop might be called from async context.
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub queue_capacity: usize,
    /// Event scans are skipped in a batch that already processed this many commands.
    pub low_prio_threshold: usize,
    pub pragma_override: Option<HashMap<String, String>>,
}
impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            low_prio_threshold: 100,
            pragma_override: None,
        }
    }
}

impl SqlitePool {
    fn init_thread(
        path: &Path,
        mut pragma_override: HashMap<String, String>,
    ) -> Result<Connection, InitializationError> {
        fn execute<P: Params>(
            conn: &Connection,
            sql: &str,
            params: P,
        ) -> Result<(), InitializationError> {
            conn.execute(sql, params).map(|_| ()).map_err(|err| {
                error!("Cannot run `{sql}` - {err:?}");
                InitializationError
            })
        }
        fn pragma_update(
            conn: &Connection,
            name: &str,
            value: &str,
        ) -> Result<(), InitializationError> {
            if value.is_empty() {
                debug!("Querying PRAGMA {name}");
                conn.pragma_query(None, name, |row| {
                    debug!("{row:?}");
                    Ok(())
                })
                .map_err(|err| {
                    error!("cannot query pragma `{name}` - {err:?}");
                    InitializationError
                })
            } else {
                debug!("Setting PRAGMA {name}={value}");
                conn.pragma_update(None, name, value).map_err(|err| {
                    error!("cannot update pragma `{name}`=`{value}` - {err:?}");
                    InitializationError
                })
            }
        }

        let conn = Connection::open_with_flags(path, OpenFlags::default()).map_err(|err| {
            error!("cannot open the connection - {err:?}");
            InitializationError
        })?;

        for [pragma_name, default_value] in PRAGMA {
            let pragma_value = pragma_override
                .remove(pragma_name)
                .unwrap_or_else(|| default_value.to_string());
            pragma_update(&conn, pragma_name, &pragma_value)?;
        }
        // drain the rest overrides
        for (pragma_name, pragma_value) in pragma_override.drain() {
            pragma_update(&conn, &pragma_name, &pragma_value)?;
        }

        // t_metadata
        execute(&conn, CREATE_TABLE_T_METADATA, [])?;
        // Insert row if not exists.
        execute(
            &conn,
            &format!(
                "INSERT INTO t_metadata (schema_version, created_at)
                SELECT {T_METADATA_EXPECTED_SCHEMA_VERSION}, ? WHERE NOT EXISTS (SELECT 1 FROM t_metadata)"
            ),
            [Utc::now()],
        )?;
        // Fail on unexpected `schema_version`.
        let actual_version = conn
            .prepare("SELECT schema_version FROM t_metadata ORDER BY id DESC LIMIT 1")
            .map_err(|err| {
                error!("cannot select schema version - {err:?}");
                InitializationError
            })?
            .query_row([], |row| row.get::<_, u32>("schema_version"))
            .map_err(|err| {
                error!("Cannot read the schema version - {err:?}");
                InitializationError
            })?;
        if actual_version != T_METADATA_EXPECTED_SCHEMA_VERSION {
            error!(
                "wrong schema version, expected {T_METADATA_EXPECTED_SCHEMA_VERSION}, got {actual_version}"
            );
            return Err(InitializationError);
        }

        execute(&conn, CREATE_TABLE_T_SUBSCRIPTION, [])?;
        execute(&conn, CREATE_TABLE_T_DELIVERY_RECORD, [])?;
        execute(&conn, IDX_T_DELIVERY_RECORD_RECIPIENT_SENT_AT, [])?;
        execute(&conn, CREATE_TABLE_T_BUSINESS_EVENT, [])?;
        execute(&conn, IDX_T_BUSINESS_EVENT_KIND_END_TIME, [])?;
        execute(&conn, CREATE_TABLE_T_BROADCAST, [])?;
        Ok(conn)
    }

    fn connection_rpc(
        mut conn: Connection,
        shutdown_requested: &AtomicBool,
        shutdown_finished: &AtomicBool,
        mut command_rx: mpsc::Receiver<ThreadCommand>,
        queue_capacity: usize,
        low_prio_threshold: usize,
    ) {
        let mut vec: Vec<ThreadCommand> = Vec::with_capacity(queue_capacity);
        loop {
            vec.clear();
            if let Some(item) = command_rx.blocking_recv() {
                vec.push(item);
            } else {
                debug!("command_rx was closed");
                break;
            }
            while let Ok(more) = command_rx.try_recv() {
                vec.push(more);
            }
            // Did we receive Shutdown in the batch?
            let shutdown_found = vec
                .iter()
                .any(|item| matches!(item, ThreadCommand::Shutdown));
            if shutdown_found || shutdown_requested.load(Ordering::Acquire) {
                debug!("Received shutdown before processing the batch");
                break;
            }

            let mut execute = |expected: CommandPriority| {
                let mut processed = 0;
                for item in &mut vec {
                    if matches!(item, ThreadCommand::Func { priority, .. } if *priority == expected )
                    {
                        let item = std::mem::replace(item, ThreadCommand::Dummy); // get owned item
                        let (func, sent_at, name) = assert_matches!(item, ThreadCommand::Func{func, sent_at, name, ..} => (func, sent_at, name));
                        let started_at = Instant::now();
                        func(&mut conn);
                        trace!(
                            name,
                            queued = ?started_at.duration_since(sent_at),
                            took = ?started_at.elapsed(),
                            "Command processed"
                        );
                        processed += 1;
                    }
                    if shutdown_requested.load(Ordering::Acquire) {
                        // recheck after every function
                        debug!("Received shutdown during processing of the batch");
                        break;
                    }
                }
                processed
            };
            let processed = execute(CommandPriority::High) + execute(CommandPriority::Medium);
            if processed < low_prio_threshold {
                execute(CommandPriority::Low);
            }
        } // Loop until shutdown is set to true.
        debug!("Closing command thread");
        shutdown_finished.store(true, Ordering::Release);
    }

    #[instrument(level = Level::DEBUG, skip_all, name = "sqlite_new")]
    pub async fn new<P: AsRef<Path>>(
        path: P,
        config: SqliteConfig,
    ) -> Result<Self, InitializationError> {
        let path = path.as_ref().to_owned();

        let shutdown_requested = Arc::new(AtomicBool::new(false));
        let shutdown_finished = Arc::new(AtomicBool::new(false));

        let (command_tx, command_rx) = tokio::sync::mpsc::channel(config.queue_capacity);
        info!("Sqlite database location: {path:?}");
        let join_handle = {
            // Initialize the `Connection`.
            let init_task = {
                tokio::task::spawn_blocking(move || {
                    Self::init_thread(&path, config.pragma_override.unwrap_or_default())
                })
                .await
            };
            let conn = match init_task {
                Ok(res) => res?,
                Err(join_err) => {
                    error!("Initialization panic - {join_err:?}");
                    return Err(InitializationError);
                }
            };
            let shutdown_requested = shutdown_requested.clone();
            let shutdown_finished = shutdown_finished.clone();
            // Start the RPC thread.
            std::thread::spawn(move || {
                Self::connection_rpc(
                    conn,
                    &shutdown_requested,
                    &shutdown_finished,
                    command_rx,
                    config.queue_capacity,
                    config.low_prio_threshold,
                );
            })
        };
        Ok(SqlitePool(SqlitePoolInner {
            shutdown_requested,
            shutdown_finished,
            command_tx,
            join_handle: Some(Arc::new(join_handle)),
        }))
    }

    #[instrument(level = Level::TRACE, skip_all, fields(name))]
    pub async fn transaction_write<F, T, E>(
        &self,
        func: F,
        name: &'static str,
    ) -> Result<Result<T, E>, DbErrorGeneric /* only close variant */>
    where
        F: FnOnce(&mut rusqlite::Transaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbErrorGeneric> + Send + 'static,
    {
        self.transaction(func, true, name).await
    }

    #[instrument(level = Level::TRACE, skip_all, fields(name))]
    pub async fn transaction_read<F, T, E>(
        &self,
        func: F,
        name: &'static str,
    ) -> Result<Result<T, E>, DbErrorGeneric /* only close variant */>
    where
        F: FnOnce(&mut rusqlite::Transaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbErrorGeneric> + Send + 'static,
    {
        self.transaction(func, false, name).await
    }

    /// Invokes the provided function wrapping a new [`rusqlite::Transaction`] that is committed automatically.
    async fn transaction<F, T, E>(
        &self,
        func: F,
        write: bool,
        name: &'static str,
    ) -> Result<Result<T, E>, DbErrorGeneric /* only close variant */>
    where
        F: FnOnce(&mut rusqlite::Transaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbErrorGeneric> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let parent_span = Span::current();

        self.0
            .command_tx
            .send(ThreadCommand::Func {
                priority: if write {
                    CommandPriority::High
                } else {
                    CommandPriority::Medium
                },
                func: Box::new(move |conn| {
                    let tx_begin =
                        debug_span!(parent: &parent_span, "tx_begin", name).in_scope(|| {
                            conn.transaction_with_behavior(if write {
                                rusqlite::TransactionBehavior::Immediate
                            } else {
                                rusqlite::TransactionBehavior::Deferred
                            })
                            .map_err(result_err_generic)
                            .map_err(E::from)
                        });
                    let tx_apply = tx_begin.and_then(|mut transaction| {
                        parent_span.in_scope(|| func(&mut transaction).map(|ok| (ok, transaction)))
                    });
                    let tx_commit = tx_apply.and_then(|(ok, transaction)| {
                        debug_span!(parent: &parent_span, "tx_commit", name).in_scope(|| {
                            transaction
                                .commit()
                                .map(|()| ok)
                                .map_err(result_err_generic)
                                .map_err(E::from)
                        })
                    });
                    // The caller may have been cancelled, e.g. by a send timeout.
                    let _ = tx.send(tx_commit);
                }),
                sent_at: Instant::now(),
                name,
            })
            .await
            .map_err(|_send_err| DbErrorGeneric::Close)?;
        rx.await.map_err(|_recv_err| DbErrorGeneric::Close)
    }

    #[instrument(level = Level::TRACE, skip_all, fields(name))]
    async fn conn_low_prio<F, T>(&self, func: F, name: &'static str) -> Result<T, DbErrorGeneric>
    where
        F: FnOnce(&Connection) -> Result<T, DbErrorGeneric> + Send + 'static,
        T: Send + 'static + Default,
    {
        let (tx, rx) = oneshot::channel();
        let span = tracing::trace_span!("tx_function");
        self.0
            .command_tx
            .send(ThreadCommand::Func {
                priority: CommandPriority::Low,
                func: Box::new(move |conn| {
                    let _ = tx.send(span.in_scope(|| func(conn)));
                }),
                sent_at: Instant::now(),
                name,
            })
            .await
            .map_err(|_send_err| DbErrorGeneric::Close)?;
        match rx.await {
            Ok(res) => res,
            Err(_recv_err) => Ok(T::default()), // Dropped computation because of other priorities..
        }
    }

    fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<Subscription> {
        Ok(Subscription {
            recipient_id: row.get("recipient_id")?,
            endpoint: row.get("endpoint")?,
            auth_secret: row.get("auth_secret")?,
            encryption_key: row.get("encryption_key")?,
            created_at: row.get("created_at")?,
        })
    }

    fn list_subscriptions_of(
        tx: &Transaction,
        recipient_id: &RecipientId,
    ) -> Result<Vec<Subscription>, DbErrorGeneric> {
        let mut stmt = tx
            .prepare_cached(
                "SELECT recipient_id, endpoint, auth_secret, encryption_key, created_at \
                FROM t_subscription WHERE recipient_id = :recipient_id ORDER BY created_at, endpoint",
            )
            .map_err(prepare_err_generic)?;
        stmt.query_map(
            named_params! {":recipient_id": recipient_id},
            Self::subscription_from_row,
        )
        .map_err(result_err_generic)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(result_err_generic)
    }

    fn upsert_subscription(
        tx: &Transaction,
        subscription: &UpsertSubscription,
    ) -> Result<(), DbErrorWrite> {
        // Move the endpoint away from a previous owner.
        let moved = tx
            .prepare_cached(
                "DELETE FROM t_subscription WHERE endpoint = :endpoint AND recipient_id != :recipient_id",
            )
            .map_err(prepare_err_generic)?
            .execute(named_params! {
                ":endpoint": subscription.endpoint,
                ":recipient_id": subscription.recipient_id,
            })
            .map_err(result_err_generic)?;
        if moved > 0 {
            debug!("Endpoint moved from another recipient");
        }
        tx.prepare_cached(
            r"
            INSERT INTO t_subscription
                (recipient_id, endpoint, auth_secret, encryption_key, created_at, updated_at)
            VALUES
                (:recipient_id, :endpoint, :auth_secret, :encryption_key, :created_at, :created_at)
            ON CONFLICT (recipient_id, endpoint) DO UPDATE SET
                auth_secret = excluded.auth_secret,
                encryption_key = excluded.encryption_key,
                updated_at = excluded.updated_at
            ",
        )
        .map_err(prepare_err_generic)?
        .execute(named_params! {
            ":recipient_id": subscription.recipient_id,
            ":endpoint": subscription.endpoint,
            ":auth_secret": subscription.auth_secret,
            ":encryption_key": subscription.encryption_key,
            ":created_at": subscription.created_at,
        })
        .map_err(result_err_generic)?;
        Ok(())
    }

    fn delivery_record_from_row(row: &Row<'_>) -> rusqlite::Result<DeliveryRecord> {
        Ok(DeliveryRecord {
            tracking_key: row.get("tracking_key")?,
            recipient_id: row.get("recipient_id")?,
            sent_at: row.get("sent_at")?,
            device_id: row.get::<_, Option<DeviceId>>("device_id")?,
        })
    }

    fn business_event_from_row(row: &Row<'_>) -> rusqlite::Result<BusinessEvent> {
        Ok(BusinessEvent {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            kind: row.get("kind")?,
            end_time: row.get("end_time")?,
            has_outcome: row.get("has_outcome")?,
            answered: row.get("answered")?,
        })
    }

    fn broadcast_from_row(row: &Row<'_>) -> rusqlite::Result<BroadcastMessage> {
        Ok(BroadcastMessage {
            id: row.get("broadcast_id")?,
            text: row.get("text")?,
            recipient_selector: row
                .get::<_, JsonWrapper<concepts::RecipientSelector>>("recipient_selector")?
                .0,
            sent_count: row.get("sent_count")?,
            failed_count: row.get("failed_count")?,
            total_targeted: row.get("total_targeted")?,
            issued_by: row.get("issued_by")?,
            issued_at: row.get("issued_at")?,
        })
    }

    /// Inserts or replaces a business event. The table is owned by an external
    /// collaborator, this is used for seeding local runs and tests.
    #[instrument(level = Level::DEBUG, skip_all, fields(event_id = %event.id))]
    pub async fn upsert_event(&self, event: BusinessEvent) -> Result<(), DbErrorWrite> {
        self.transaction_write(
            move |tx| {
                tx.prepare_cached(
                    r"
                    INSERT INTO t_business_event (id, owner_id, kind, end_time, has_outcome, answered)
                    VALUES (:id, :owner_id, :kind, :end_time, :has_outcome, :answered)
                    ON CONFLICT (id) DO UPDATE SET
                        owner_id = excluded.owner_id,
                        kind = excluded.kind,
                        end_time = excluded.end_time,
                        has_outcome = excluded.has_outcome,
                        answered = excluded.answered
                    ",
                )
                .map_err(prepare_err_generic)?
                .execute(named_params! {
                    ":id": event.id,
                    ":owner_id": event.owner_id,
                    ":kind": event.kind,
                    ":end_time": event.end_time,
                    ":has_outcome": event.has_outcome,
                    ":answered": event.answered,
                })
                .map_err(result_err_generic)?;
                Ok::<_, DbErrorWrite>(())
            },
            "upsert_event",
        )
        .await?
    }

    /// Sets the `answered` flag, as the external collaborator would after the
    /// recipient responded.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn mark_event_answered(&self, event_id: &EventId) -> Result<bool, DbErrorWrite> {
        let event_id = event_id.clone();
        self.transaction_write(
            move |tx| {
                let updated = tx
                    .prepare_cached("UPDATE t_business_event SET answered = 1 WHERE id = :id")
                    .map_err(prepare_err_generic)?
                    .execute(named_params! {":id": event_id})
                    .map_err(result_err_generic)?;
                Ok::<_, DbErrorWrite>(updated > 0)
            },
            "mark_event_answered",
        )
        .await?
    }

    /// Number of ledger rows, for asserting that racing writers produced one row.
    pub async fn ledger_len(&self) -> Result<usize, DbErrorGeneric> {
        self.transaction_read(
            |tx| {
                tx.query_row("SELECT COUNT(*) FROM t_delivery_record", [], |row| {
                    row.get::<_, usize>(0)
                })
                .map_err(result_err_generic)
            },
            "ledger_len",
        )
        .await?
    }
}

#[async_trait]
impl SubscriptionStore for SqlitePool {
    #[instrument(level = Level::TRACE, skip(self))]
    async fn list_by_recipient(
        &self,
        recipient_id: &RecipientId,
    ) -> Result<Vec<Subscription>, DbErrorGeneric> {
        let recipient_id = recipient_id.clone();
        self.transaction_read(
            move |tx| Self::list_subscriptions_of(tx, &recipient_id),
            "list_by_recipient",
        )
        .await?
    }

    #[instrument(level = Level::TRACE, skip(self))]
    async fn list_by_recipients(
        &self,
        recipient_ids: &[RecipientId],
    ) -> Result<Vec<Subscription>, DbErrorGeneric> {
        let recipient_ids = recipient_ids.to_vec();
        self.transaction_read(
            move |tx| {
                let mut seen = HashSet::new();
                let mut subscriptions = Vec::new();
                for recipient_id in &recipient_ids {
                    if seen.insert(recipient_id) {
                        subscriptions.extend(Self::list_subscriptions_of(tx, recipient_id)?);
                    }
                }
                Ok::<_, DbErrorGeneric>(subscriptions)
            },
            "list_by_recipients",
        )
        .await?
    }

    #[instrument(level = Level::TRACE, skip(self))]
    async fn list_all(&self) -> Result<Vec<Subscription>, DbErrorGeneric> {
        self.transaction_read(
            |tx| {
                let mut stmt = tx
                    .prepare_cached(
                        "SELECT recipient_id, endpoint, auth_secret, encryption_key, created_at \
                        FROM t_subscription ORDER BY recipient_id, created_at, endpoint",
                    )
                    .map_err(prepare_err_generic)?;
                stmt.query_map([], Self::subscription_from_row)
                    .map_err(result_err_generic)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(result_err_generic)
            },
            "list_all",
        )
        .await?
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(recipient_id = %subscription.recipient_id, endpoint = %subscription.endpoint))]
    async fn upsert(&self, subscription: UpsertSubscription) -> Result<(), DbErrorWrite> {
        self.transaction_write(
            move |tx| Self::upsert_subscription(tx, &subscription),
            "upsert_subscription",
        )
        .await?
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn remove(
        &self,
        recipient_id: &RecipientId,
        endpoint: &Endpoint,
    ) -> Result<bool, DbErrorWrite> {
        let recipient_id = recipient_id.clone();
        let endpoint = endpoint.clone();
        self.transaction_write(
            move |tx| {
                let deleted = tx
                    .prepare_cached(
                        "DELETE FROM t_subscription WHERE recipient_id = :recipient_id AND endpoint = :endpoint",
                    )
                    .map_err(prepare_err_generic)?
                    .execute(named_params! {
                        ":recipient_id": recipient_id,
                        ":endpoint": endpoint,
                    })
                    .map_err(result_err_generic)?;
                Ok::<_, DbErrorWrite>(deleted > 0)
            },
            "remove_subscription",
        )
        .await?
    }
}

#[async_trait]
impl DeliveryLedger for SqlitePool {
    #[instrument(level = Level::TRACE, skip(self))]
    async fn is_marked(&self, tracking_key: &TrackingKey) -> Result<bool, DbErrorGeneric> {
        let tracking_key = tracking_key.clone();
        self.transaction_read(
            move |tx| {
                tx.prepare_cached(
                    "SELECT EXISTS(SELECT 1 FROM t_delivery_record WHERE tracking_key = :tracking_key)",
                )
                .map_err(prepare_err_generic)?
                .query_row(named_params! {":tracking_key": tracking_key}, |row| {
                    row.get::<_, bool>(0)
                })
                .map_err(result_err_generic)
            },
            "is_marked",
        )
        .await?
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn mark(
        &self,
        tracking_key: &TrackingKey,
        recipient_id: &RecipientId,
        device_id: Option<&DeviceId>,
        sent_at: DateTime<Utc>,
    ) -> Result<MarkOutcome, DbErrorWrite> {
        let tracking_key = tracking_key.clone();
        let recipient_id = recipient_id.clone();
        let device_id = device_id.cloned();
        self.transaction_write(
            move |tx| {
                let inserted = tx
                    .prepare_cached(
                        r"
                        INSERT INTO t_delivery_record (tracking_key, recipient_id, device_id, sent_at)
                        VALUES (:tracking_key, :recipient_id, :device_id, :sent_at)
                        ON CONFLICT (tracking_key) DO NOTHING
                        ",
                    )
                    .map_err(prepare_err_generic)?
                    .execute(named_params! {
                        ":tracking_key": tracking_key,
                        ":recipient_id": recipient_id,
                        ":device_id": device_id,
                        ":sent_at": sent_at,
                    })
                    .map_err(result_err_generic)?;
                Ok::<_, DbErrorWrite>(if inserted == 1 {
                    MarkOutcome::Inserted
                } else {
                    MarkOutcome::AlreadyMarked
                })
            },
            "mark",
        )
        .await?
    }

    #[instrument(level = Level::TRACE, skip(self))]
    async fn history(
        &self,
        recipient_id: &RecipientId,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>, DbErrorGeneric> {
        let recipient_id = recipient_id.clone();
        self.transaction_read(
            move |tx| {
                let mut stmt = tx
                    .prepare_cached(
                        "SELECT tracking_key, recipient_id, device_id, sent_at FROM t_delivery_record \
                        WHERE recipient_id = :recipient_id ORDER BY sent_at DESC, rowid DESC LIMIT :limit",
                    )
                    .map_err(prepare_err_generic)?;
                stmt.query_map(
                    named_params! {
                        ":recipient_id": recipient_id,
                        ":limit": limit,
                    },
                    Self::delivery_record_from_row,
                )
                .map_err(result_err_generic)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(result_err_generic)
            },
            "history",
        )
        .await?
    }
}

#[async_trait]
impl EventSource for SqlitePool {
    #[instrument(level = Level::TRACE, skip(self))]
    async fn due_events(
        &self,
        kind: &EventKind,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<BusinessEvent>, DbErrorGeneric> {
        let kind = kind.clone();
        self.conn_low_prio(
            move |conn| {
                let mut stmt = conn
                    .prepare_cached(
                        r"
                        SELECT id, owner_id, kind, end_time, has_outcome, answered FROM t_business_event
                        WHERE kind = :kind AND answered = 0
                            AND end_time >= :window_start AND end_time <= :window_end
                        ORDER BY end_time, id
                        ",
                    )
                    .map_err(prepare_err_generic)?;
                stmt.query_map(
                    named_params! {
                        ":kind": kind,
                        ":window_start": window_start,
                        ":window_end": window_end,
                    },
                    Self::business_event_from_row,
                )
                .map_err(result_err_generic)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(result_err_generic)
            },
            "due_events",
        )
        .await
    }
}

#[async_trait]
impl BroadcastStore for SqlitePool {
    #[instrument(level = Level::DEBUG, skip_all, fields(id = %message.id))]
    async fn append(&self, message: BroadcastMessage, retain: u32) -> Result<(), DbErrorWrite> {
        let recipient_selector = serde_json::to_string(&message.recipient_selector)
            .map_err(|err| DbErrorWrite::ValidationFailed(err.to_string().into()))?;
        self.transaction_write(
            move |tx| {
                tx.prepare_cached(
                    r"
                    INSERT INTO t_broadcast
                        (broadcast_id, text, recipient_selector, sent_count, failed_count, total_targeted, issued_by, issued_at)
                    VALUES
                        (:broadcast_id, :text, :recipient_selector, :sent_count, :failed_count, :total_targeted, :issued_by, :issued_at)
                    ",
                )
                .map_err(prepare_err_generic)?
                .execute(named_params! {
                    ":broadcast_id": message.id,
                    ":text": message.text,
                    ":recipient_selector": recipient_selector,
                    ":sent_count": message.sent_count,
                    ":failed_count": message.failed_count,
                    ":total_targeted": message.total_targeted,
                    ":issued_by": message.issued_by,
                    ":issued_at": message.issued_at,
                })
                .map_err(result_err_generic)?;
                let trimmed = tx
                    .prepare_cached(
                        "DELETE FROM t_broadcast WHERE id NOT IN \
                        (SELECT id FROM t_broadcast ORDER BY id DESC LIMIT :retain)",
                    )
                    .map_err(prepare_err_generic)?
                    .execute(named_params! {":retain": retain})
                    .map_err(result_err_generic)?;
                trace!(trimmed, "Broadcast log trimmed");
                Ok::<_, DbErrorWrite>(())
            },
            "append_broadcast",
        )
        .await?
    }

    #[instrument(level = Level::TRACE, skip(self))]
    async fn list(&self, limit: u32) -> Result<Vec<BroadcastMessage>, DbErrorGeneric> {
        self.transaction_read(
            move |tx| {
                let mut stmt = tx
                    .prepare_cached(
                        "SELECT broadcast_id, text, recipient_selector, sent_count, failed_count, \
                        total_targeted, issued_by, issued_at FROM t_broadcast ORDER BY id DESC LIMIT :limit",
                    )
                    .map_err(prepare_err_generic)?;
                stmt.query_map(named_params! {":limit": limit}, Self::broadcast_from_row)
                    .map_err(result_err_generic)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(result_err_generic)
            },
            "list_broadcasts",
        )
        .await?
    }
}

#[cfg(any(test, feature = "tempfile"))]
pub mod tempfile {
    use super::{SqliteConfig, SqlitePool};
    use tempfile::NamedTempFile;

    pub async fn sqlite_pool() -> (SqlitePool, Option<NamedTempFile>) {
        if let Ok(path) = std::env::var("SQLITE_FILE") {
            (
                SqlitePool::new(path, SqliteConfig::default())
                    .await
                    .unwrap(),
                None,
            )
        } else {
            let file = NamedTempFile::new().unwrap();
            let path = file.path();
            (
                SqlitePool::new(path, SqliteConfig::default())
                    .await
                    .unwrap(),
                Some(file),
            )
        }
    }
}
