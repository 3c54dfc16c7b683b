use anyhow::Context as _;
use chrono::TimeDelta;
use concepts::{EventKind, NotificationKind, transport::PushTransport};
use db_sqlite::sqlite_dao::SqliteConfig;
use engine::{
    broadcast::{BroadcastConfig, DEFAULT_RETAIN},
    dispatcher::DispatcherConfig,
    engine::EngineConfig,
    scanner::{PromptTemplate, ScannerConfig},
    sweeper::SweeperConfig,
    tracker::DEFAULT_HISTORY_LIMIT,
};
use log::{LoggingConfig, LoggingStyle};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use transport_http::{DryRunTransport, GatewayConfig, GatewayTransport, Urgency};

pub(crate) const DATA_DIR_PREFIX: &str = "${DATA_DIR}/";
const DEFAULT_SQLITE_FILE_IF_PROJECT_DIRS: &str =
    const_format::formatcp!("{}herald.sqlite", DATA_DIR_PREFIX);
const DEFAULT_SQLITE_FILE: &str = "herald.sqlite";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConfigToml {
    #[serde(default)]
    pub(crate) sqlite: SqliteConfigToml,
    #[serde(default)]
    pub(crate) transport: TransportConfigToml,
    #[serde(default)]
    pub(crate) dispatcher: DispatcherConfigToml,
    #[serde(default)]
    pub(crate) scanner: ScannerConfigToml,
    #[serde(default)]
    pub(crate) sweeper: SweeperConfigToml,
    #[serde(default)]
    pub(crate) broadcast: BroadcastConfigToml,
    #[serde(default)]
    pub(crate) ledger: LedgerConfigToml,
    #[serde(default)]
    pub(crate) log: LoggingConfig,
}

impl ConfigToml {
    pub(crate) fn engine_config(&self) -> Result<EngineConfig, anyhow::Error> {
        Ok(EngineConfig {
            dispatcher: self.dispatcher.as_config(),
            broadcast: self.broadcast.as_config()?,
            history_limit: self.ledger.history_limit,
        })
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct SqliteConfigToml {
    #[serde(default)]
    file: Option<String>,
    queue_capacity: Option<usize>,
    low_prio_threshold: Option<usize>,
}

impl SqliteConfigToml {
    pub(crate) fn get_sqlite_file(&self, has_project_dirs: bool) -> &str {
        self.file.as_deref().unwrap_or(if has_project_dirs {
            DEFAULT_SQLITE_FILE_IF_PROJECT_DIRS
        } else {
            DEFAULT_SQLITE_FILE
        })
    }

    pub(crate) fn as_config(&self) -> SqliteConfig {
        let def = SqliteConfig::default();
        SqliteConfig {
            queue_capacity: self.queue_capacity.unwrap_or(def.queue_capacity),
            low_prio_threshold: self.low_prio_threshold.unwrap_or(def.low_prio_threshold),
            pragma_override: def.pragma_override,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum TransportConfigToml {
    #[default]
    DryRun,
    Gateway {
        url: String,
        #[serde(default = "default_request_timeout")]
        request_timeout: DurationConfig,
        #[serde(default = "default_ttl_secs")]
        ttl_secs: u64,
        #[serde(default)]
        urgency: Urgency,
    },
}

impl TransportConfigToml {
    pub(crate) fn build(&self) -> Result<Arc<dyn PushTransport>, anyhow::Error> {
        Ok(match self {
            TransportConfigToml::DryRun => Arc::new(DryRunTransport),
            TransportConfigToml::Gateway {
                url,
                request_timeout,
                ttl_secs,
                urgency,
            } => {
                let url = url::Url::parse(url)
                    .with_context(|| format!("cannot parse transport url `{url}`"))?;
                Arc::new(
                    GatewayTransport::new(GatewayConfig {
                        url,
                        request_timeout: Duration::from(*request_timeout),
                        ttl: Duration::from_secs(*ttl_secs),
                        urgency: *urgency,
                    })
                    .context("cannot create the gateway client")?,
                )
            }
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DispatcherConfigToml {
    #[serde(default = "default_send_timeout")]
    send_timeout: DurationConfig,
    #[serde(default = "default_max_concurrent_sends")]
    max_concurrent_sends: usize,
}

impl Default for DispatcherConfigToml {
    fn default() -> Self {
        Self {
            send_timeout: default_send_timeout(),
            max_concurrent_sends: default_max_concurrent_sends(),
        }
    }
}

impl DispatcherConfigToml {
    fn as_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            send_timeout: self.send_timeout.into(),
            max_concurrent_sends: self.max_concurrent_sends,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ScannerConfigToml {
    #[serde(default = "default_true")]
    pub(crate) enabled: bool,
    #[serde(default = "default_scanner_tick_sleep")]
    tick_sleep: DurationConfig,
    #[serde(default = "default_lookback")]
    lookback: DurationConfig,
    #[serde(default = "default_event_kind")]
    event_kind: String,
    #[serde(default = "default_with_outcome")]
    with_outcome: PromptToml,
    #[serde(default = "default_without_outcome")]
    without_outcome: PromptToml,
}

impl Default for ScannerConfigToml {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_sleep: default_scanner_tick_sleep(),
            lookback: default_lookback(),
            event_kind: default_event_kind(),
            with_outcome: default_with_outcome(),
            without_outcome: default_without_outcome(),
        }
    }
}

impl ScannerConfigToml {
    pub(crate) fn as_config(&self) -> Result<ScannerConfig, anyhow::Error> {
        let lookback = TimeDelta::from_std(self.lookback.into())
            .context("`scanner.lookback` is out of range")?;
        Ok(ScannerConfig {
            tick_sleep: self.tick_sleep.into(),
            lookback,
            event_kind: EventKind::new(self.event_kind.clone())
                .context("invalid `scanner.event_kind`")?,
            with_outcome: self
                .with_outcome
                .as_template()
                .context("invalid `scanner.with_outcome`")?,
            without_outcome: self
                .without_outcome
                .as_template()
                .context("invalid `scanner.without_outcome`")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PromptToml {
    kind: String,
    title: String,
    body: String,
    #[serde(default)]
    url: Option<String>,
}

impl PromptToml {
    fn as_template(&self) -> Result<PromptTemplate, anyhow::Error> {
        Ok(PromptTemplate {
            kind: NotificationKind::new(self.kind.clone())?,
            title: self.title.clone(),
            body: self.body.clone(),
            url: self.url.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SweeperConfigToml {
    #[serde(default)]
    pub(crate) enabled: bool,
    #[serde(default = "default_sweep_interval")]
    interval: DurationConfig,
}

impl Default for SweeperConfigToml {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_sweep_interval(),
        }
    }
}

impl SweeperConfigToml {
    pub(crate) fn as_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: self.interval.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BroadcastConfigToml {
    #[serde(default = "default_retain")]
    retain: u32,
    #[serde(default = "default_broadcast_title")]
    title: String,
}

impl Default for BroadcastConfigToml {
    fn default() -> Self {
        Self {
            retain: default_retain(),
            title: default_broadcast_title(),
        }
    }
}

impl BroadcastConfigToml {
    fn as_config(&self) -> Result<BroadcastConfig, anyhow::Error> {
        anyhow::ensure!(
            self.retain >= 1,
            "`broadcast.retain` must keep at least one entry"
        );
        Ok(BroadcastConfig {
            retain: self.retain,
            title: self.title.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LedgerConfigToml {
    #[serde(default = "default_history_limit")]
    pub(crate) history_limit: u32,
}

impl Default for LedgerConfigToml {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DurationConfig {
    Secs(u64),
    Millis(u64),
}

impl From<DurationConfig> for Duration {
    fn from(value: DurationConfig) -> Self {
        match value {
            DurationConfig::Millis(millis) => Duration::from_millis(millis),
            DurationConfig::Secs(secs) => Duration::from_secs(secs),
        }
    }
}

pub(crate) mod log {
    use super::{Deserialize, default_out_style};
    use std::str::FromStr;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(crate) struct LoggingConfig {
        #[serde(default)]
        pub(crate) file: Option<AppenderRollingFile>,
        #[serde(default)]
        pub(crate) stdout: Option<AppenderOut>,
    }

    impl Default for LoggingConfig {
        fn default() -> Self {
            Self {
                file: None,
                stdout: Some(AppenderOut {
                    enabled: true,
                    common: AppenderCommon::default(),
                    style: default_out_style(),
                }),
            }
        }
    }

    #[derive(Debug, Deserialize, Default, Copy, Clone)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum SpanConfig {
        /// spans are ignored (this is the default)
        #[default]
        None,
        /// one event when span is created
        New,
        /// one event per enter of a span
        Enter,
        /// one event per exit of a span
        Exit,
        /// one event when the span is dropped
        Close,
        /// one event per enter/exit of a span
        Active,
        /// events at all points (new, enter, exit, drop)
        Full,
    }

    impl From<SpanConfig> for tracing_subscriber::fmt::format::FmtSpan {
        fn from(value: SpanConfig) -> Self {
            match value {
                SpanConfig::None => Self::NONE,
                SpanConfig::New => Self::NEW,
                SpanConfig::Enter => Self::ENTER,
                SpanConfig::Exit => Self::EXIT,
                SpanConfig::Close => Self::CLOSE,
                SpanConfig::Active => Self::ACTIVE,
                SpanConfig::Full => Self::FULL,
            }
        }
    }

    #[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum LoggingStyle {
        #[default]
        Plain,
        PlainCompact,
        Json,
    }

    #[derive(Debug, Deserialize, Default)]
    pub(crate) struct AppenderCommon {
        #[serde(default)]
        pub(crate) level: EnvFilter,
        #[serde(default)]
        pub(crate) span: SpanConfig,
        #[serde(default)]
        pub(crate) target: bool,
    }

    #[derive(Debug, serde_with::DeserializeFromStr)]
    pub(crate) struct EnvFilter(pub(crate) tracing_subscriber::EnvFilter);
    impl FromStr for EnvFilter {
        type Err = tracing_subscriber::filter::ParseError;

        fn from_str(directives: &str) -> Result<Self, Self::Err> {
            tracing_subscriber::EnvFilter::builder()
                .parse(directives)
                .map(Self)
        }
    }
    impl Default for EnvFilter {
        fn default() -> Self {
            Self::from_str("info").expect("`info` must parse")
        }
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct AppenderOut {
        pub(crate) enabled: bool,
        #[serde(flatten, default)]
        pub(crate) common: AppenderCommon,
        #[serde(default = "default_out_style")]
        pub(crate) style: LoggingStyle,
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct AppenderRollingFile {
        #[serde(flatten, default)]
        pub(crate) common: AppenderCommon,
        pub(crate) directory: String,
        pub(crate) prefix: String,
        pub(crate) rotation: Rotation,
        #[serde(default)]
        pub(crate) style: LoggingStyle,
    }

    #[derive(Debug, Deserialize, Clone, Copy)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum Rotation {
        Minutely,
        Hourly,
        Daily,
        Never,
    }
    impl From<Rotation> for tracing_appender::rolling::Rotation {
        fn from(value: Rotation) -> Self {
            match value {
                Rotation::Minutely => Self::MINUTELY,
                Rotation::Hourly => Self::HOURLY,
                Rotation::Daily => Self::DAILY,
                Rotation::Never => Self::NEVER,
            }
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_request_timeout() -> DurationConfig {
    DurationConfig::Secs(5)
}

const fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

const fn default_send_timeout() -> DurationConfig {
    DurationConfig::Secs(10)
}

const fn default_max_concurrent_sends() -> usize {
    8
}

const fn default_scanner_tick_sleep() -> DurationConfig {
    DurationConfig::Secs(60)
}

const fn default_lookback() -> DurationConfig {
    DurationConfig::Secs(2 * 60 * 60)
}

fn default_event_kind() -> String {
    "appointment".to_string()
}

fn default_with_outcome() -> PromptToml {
    PromptToml {
        kind: "post_sale".to_string(),
        title: "How did it go?".to_string(),
        body: "Record the sale for your last appointment.".to_string(),
        url: None,
    }
}

fn default_without_outcome() -> PromptToml {
    PromptToml {
        kind: "post_visit".to_string(),
        title: "How did it go?".to_string(),
        body: "Record the outcome of your last appointment.".to_string(),
        url: None,
    }
}

const fn default_sweep_interval() -> DurationConfig {
    DurationConfig::Secs(24 * 60 * 60)
}

const fn default_retain() -> u32 {
    DEFAULT_RETAIN
}

fn default_broadcast_title() -> String {
    BroadcastConfig::default().title
}

const fn default_history_limit() -> u32 {
    DEFAULT_HISTORY_LIMIT
}

fn default_out_style() -> LoggingStyle {
    LoggingStyle::PlainCompact
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse(toml: &str) -> ConfigToml {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("");
        assert_matches!(config.transport, TransportConfigToml::DryRun);
        assert!(config.scanner.enabled);
        assert!(!config.sweeper.enabled);
        let engine_config = config.engine_config().unwrap();
        assert_eq!(Duration::from_secs(10), engine_config.dispatcher.send_timeout);
        assert_eq!(8, engine_config.dispatcher.max_concurrent_sends);
        assert_eq!(100, engine_config.broadcast.retain);
        assert_eq!(50, engine_config.history_limit);
        let scanner = config.scanner.as_config().unwrap();
        assert_eq!(TimeDelta::hours(2), scanner.lookback);
        assert_eq!("post_sale", scanner.with_outcome.kind.as_str());
        assert_eq!("post_visit", scanner.without_outcome.kind.as_str());
    }

    #[test]
    fn gateway_transport() {
        let config = parse(
            r#"
            [transport]
            kind = "gateway"
            url = "http://127.0.0.1:8080/push"
            request_timeout.millis = 1500
            urgency = "high"
            "#,
        );
        assert_matches!(
            &config.transport,
            TransportConfigToml::Gateway {
                request_timeout: DurationConfig::Millis(1500),
                ttl_secs: 86400,
                urgency: Urgency::High,
                ..
            }
        );
        config.transport.build().unwrap();
    }

    #[test]
    fn invalid_gateway_url_is_rejected() {
        let config = parse(
            r#"
            [transport]
            kind = "gateway"
            url = "not a url"
            "#,
        );
        assert!(config.transport.build().is_err());
    }

    #[test]
    fn zero_broadcast_retention_is_rejected() {
        let config = parse(
            r"
            [broadcast]
            retain = 0
            ",
        );
        assert!(config.engine_config().is_err());
    }

    #[test]
    fn empty_event_kind_is_rejected() {
        let config = parse(
            r#"
            [scanner]
            event_kind = ""
            "#,
        );
        assert!(config.scanner.as_config().is_err());
    }

    #[test]
    fn unknown_table_is_rejected() {
        let res = config::Config::builder()
            .add_source(config::File::from_str(
                "[scanner_typo]\nenabled = true",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize::<ConfigToml>();
        assert!(res.is_err());
    }
}
