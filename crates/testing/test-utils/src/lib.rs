use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{
    FmtContext, FormattedFields,
    format::{self, FormatEvent, FormatFields},
};
use tracing_subscriber::registry::LookupSpan;

pub mod observer;
pub mod sim_clock;
pub mod transport;

static INIT: std::sync::Once = std::sync::Once::new();

/// `<time> <level> <fields> Target(<target>) <span>{<fields>}: ...`
struct MessageFirstFormatter;

impl<S, N> FormatEvent<S, N> for MessageFirstFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            &mut writer,
            "{} {: <5} ",
            chrono::Utc::now().format(":%M:%S%.3f"),
            metadata.level(),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        write!(&mut writer, " Target({}) ", metadata.target())?;
        for span in ctx.event_scope().into_iter().flat_map(|scope| scope.from_root()) {
            write!(writer, "{}", span.name())?;
            let ext = span.extensions();
            if let Some(fields) = ext.get::<FormattedFields<N>>()
                && !fields.is_empty()
            {
                write!(writer, "{{{fields}}}")?;
            }
            write!(writer, ": ")?;
        }
        writeln!(writer)
    }
}

/// Installs the panic hook and a test writer filtered by `RUST_LOG`. Safe to call from every test.
pub fn set_up() {
    INIT.call_once(|| {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        std::panic::set_hook(Box::new(utils::tracing_panic_hook));

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .event_format(MessageFirstFormatter);

        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    });
}
