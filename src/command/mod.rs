pub(crate) mod broadcast;
pub(crate) mod ledger;
pub(crate) mod server;
pub(crate) mod subscription;

use crate::{
    args::Operator,
    config::{config_holder::ConfigHolder, toml::ConfigToml},
};
use anyhow::Context as _;
use concepts::{observer::TracingObserver, time::Now};
use db_sqlite::sqlite_dao::SqlitePool;
use engine::engine::Engine;
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};

/// Prints the value as a single line of JSON.
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), anyhow::Error> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) async fn sqlite_file(
    config: &ConfigToml,
    config_holder: &ConfigHolder,
) -> Result<PathBuf, anyhow::Error> {
    let has_project_dirs = config_holder.path_prefixes.project_dirs.is_some();
    config_holder
        .path_prefixes
        .replace_file_prefix_mkdir_parent(config.sqlite.get_sqlite_file(has_project_dirs))
        .await
}

/// Store and engine for the one-shot operator commands.
pub(crate) struct Opened {
    pub(crate) db_pool: SqlitePool,
    pub(crate) engine: Engine<Now>,
}

impl Opened {
    pub(crate) async fn new(config_holder: &ConfigHolder) -> Result<Self, anyhow::Error> {
        let config = config_holder.load_config().await?;
        let transport = config.transport.build()?;
        let db_file = sqlite_file(&config, config_holder).await?;
        let db_pool = SqlitePool::new(&db_file, config.sqlite.as_config())
            .await
            .with_context(|| format!("cannot open sqlite file {db_file:?}"))?;
        let engine = Engine::new(
            &db_pool,
            transport,
            Now,
            Arc::new(TracingObserver),
            config.engine_config()?,
        );
        Ok(Self { db_pool, engine })
    }

    pub(crate) async fn close(self) {
        use concepts::storage::DbPoolCloseable as _;
        drop(self.engine);
        self.db_pool.close().await;
    }
}

pub(crate) async fn operator(opened: &Opened, command: Operator) -> Result<(), anyhow::Error> {
    match command {
        Operator::Subscription(command) => subscription::subscription(opened, command).await,
        Operator::Ledger(command) => ledger::ledger(opened, command).await,
        Operator::Broadcast(command) => broadcast::broadcast(opened, command).await,
        Operator::Sweep => subscription::sweep(opened).await,
    }
}
