use super::sqlite_file;
use crate::{
    config::{config_holder::ConfigHolder, toml::ConfigToml},
    init,
};
use anyhow::Context as _;
use concepts::{
    observer::TracingObserver, storage::DbPoolCloseable as _, time::Now,
    transport::PushTransport,
};
use db_sqlite::sqlite_dao::{SqliteConfig, SqlitePool};
use engine::{
    engine::{Engine, EngineConfig},
    scanner::{self, ScannerConfig},
    sweeper::{self, SweeperConfig},
    task::TaskHandle,
};
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info, instrument, warn};

pub(crate) async fn run(config_holder: ConfigHolder) -> anyhow::Result<()> {
    let mut config = config_holder.load_config().await?;
    let _guard = init::init(&mut config.log, &config_holder.path_prefixes).await?;
    let verified = verify_internal(config, &config_holder).await?;
    let server = ServerInit::spawn(verified).await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for SIGINT event")?;
    warn!("Received SIGINT, shutting down");
    server.close().await;
    Ok(())
}

pub(crate) async fn verify(config_holder: ConfigHolder) -> anyhow::Result<()> {
    let mut config = config_holder.load_config().await?;
    let _guard = init::init(&mut config.log, &config_holder.path_prefixes).await?;
    let verified = verify_internal(config, &config_holder).await?;
    let db_pool = SqlitePool::new(&verified.db_file, verified.sqlite_config)
        .await
        .with_context(|| format!("cannot open sqlite file {:?}", verified.db_file))?;
    db_pool.close().await;
    info!("Server configuration was verified");
    Ok(())
}

struct ServerVerified {
    db_file: PathBuf,
    sqlite_config: SqliteConfig,
    transport: Arc<dyn PushTransport>,
    engine_config: EngineConfig,
    scanner_config: Option<ScannerConfig>,
    sweeper_config: Option<SweeperConfig>,
}

#[instrument(skip_all, name = "verify")]
async fn verify_internal(
    config: ConfigToml,
    config_holder: &ConfigHolder,
) -> Result<ServerVerified, anyhow::Error> {
    debug!("Using toml config: {config:#?}");
    let db_file = sqlite_file(&config, config_holder).await?;
    let scanner_config = if config.scanner.enabled {
        Some(config.scanner.as_config()?)
    } else {
        info!("Event scanner is disabled");
        None
    };
    let sweeper_config = config
        .sweeper
        .enabled
        .then(|| config.sweeper.as_config());
    Ok(ServerVerified {
        db_file,
        sqlite_config: config.sqlite.as_config(),
        transport: config.transport.build()?,
        engine_config: config.engine_config()?,
        scanner_config,
        sweeper_config,
    })
}

struct ServerInit {
    db_pool: SqlitePool,
    task_handles: Vec<TaskHandle>,
}

impl ServerInit {
    async fn spawn(verified: ServerVerified) -> Result<Self, anyhow::Error> {
        let db_pool = SqlitePool::new(&verified.db_file, verified.sqlite_config)
            .await
            .with_context(|| format!("cannot open sqlite file {:?}", verified.db_file))?;
        let engine = Engine::new(
            &db_pool,
            verified.transport,
            Now,
            Arc::new(TracingObserver),
            verified.engine_config,
        );
        let mut task_handles = Vec::new();
        if let Some(scanner_config) = verified.scanner_config {
            info!(
                event_kind = %scanner_config.event_kind,
                lookback = %scanner_config.lookback,
                "Starting the event scanner"
            );
            task_handles.push(scanner::spawn_new(engine.scanner(scanner_config)));
        }
        if let Some(sweeper_config) = verified.sweeper_config {
            info!("Starting the subscription sweeper");
            task_handles.push(sweeper::spawn_new(
                engine.dispatcher.clone(),
                sweeper_config,
            ));
        }
        Ok(ServerInit {
            db_pool,
            task_handles,
        })
    }

    async fn close(self) {
        info!("Server is closing");
        for task_handle in self.task_handles {
            task_handle.close().await;
        }
        self.db_pool.close().await;
    }
}
