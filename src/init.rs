use crate::config::{
    config_holder::PathPrefixes,
    toml::log::{AppenderCommon, LoggingConfig, LoggingStyle},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

// Code repetition because of https://github.com/tokio-rs/tracing/issues/575
fn fmt_layer<W>(common: &mut AppenderCommon, style: LoggingStyle, writer: W) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    // EnvFilter missing Clone
    let env_filter = std::mem::take(&mut common.level).0;
    match style {
        LoggingStyle::Plain => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_target(common.target)
            .with_span_events(common.span.into())
            .with_filter(env_filter)
            .boxed(),
        LoggingStyle::PlainCompact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(writer)
            .with_target(common.target)
            .with_span_events(common.span.into())
            .with_filter(env_filter)
            .boxed(),
        LoggingStyle::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(common.target)
            .with_span_events(common.span.into())
            .with_filter(env_filter)
            .boxed(),
    }
}

/// Installs the subscriber described by the `[log]` table.
pub(crate) async fn init(
    log: &mut LoggingConfig,
    path_prefixes: &PathPrefixes,
) -> Result<Guard, anyhow::Error> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    if let Some(stdout) = &mut log.stdout
        && stdout.enabled
    {
        layers.push(fmt_layer(&mut stdout.common, stdout.style, std::io::stdout));
    }
    let file_guard = if let Some(file) = &mut log.file {
        let directory = path_prefixes
            .replace_path_prefix_mkdir(&file.directory)
            .await?;
        let appender = tracing_appender::rolling::RollingFileAppender::new(
            file.rotation.into(),
            directory,
            &file.prefix,
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(&mut file.common, file.style, non_blocking));
        Some(guard)
    } else {
        None
    };
    tracing_subscriber::registry().with(layers).init();
    std::panic::set_hook(Box::new(utils::tracing_panic_hook));
    Ok(Guard {
        _file_guard: file_guard,
    })
}

/// Operator commands print their results to stdout, logs go to stderr.
pub(crate) fn init_cli() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(tracing::level_filters::LevelFilter::WARN.into())
                        .from_env_lossy(),
                ),
        )
        .init();
    std::panic::set_hook(Box::new(utils::tracing_panic_hook));
}

pub(crate) struct Guard {
    _file_guard: Option<WorkerGuard>,
}
