use std::fmt;
use std::thread;

use ansi_term::Colour;
use chrono::Utc;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::CommunicatorConfig;

/// Overrides the configured log level, e.g. `RDMA_COMM_LOG=rdma_comm=trace`.
pub const LOG_ENV: &str = "RDMA_COMM_LOG";

/// Right-aligned to five columns.
fn level_label(level: &Level) -> (&'static str, Colour) {
    match *level {
        Level::TRACE => ("TRACE", Colour::Purple),
        Level::DEBUG => ("DEBUG", Colour::Blue),
        Level::INFO => (" INFO", Colour::Green),
        Level::WARN => (" WARN", Colour::Yellow),
        Level::ERROR => ("ERROR", Colour::Red),
    }
}

/// `[<UTC time> <LEVEL> <thread> <file>:<line>] <fields>`
struct CommFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for CommFormatter
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
        let (label, colour) = level_label(metadata.level());
        let time = Utc::now().format("%Y-%m-%d %H:%M:%S%.6f");
        if self.ansi && writer.has_ansi_escapes() {
            write!(writer, "[{} {}", time, colour.paint(label))?;
        } else {
            write!(writer, "[{} {}", time, label)?;
        }
        let current = thread::current();
        write!(
            writer,
            " {} {}:{}] ",
            current.name().unwrap_or("-"),
            metadata.file().unwrap_or("<unnamed>"),
            metadata.line().unwrap_or(0),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber.
///
/// `default_level` is a filter directive such as `"info"`, used unless [`LOG_ENV`] is set.
/// Fails if the directive does not parse or a global subscriber is already installed.
pub fn init_log(default_level: &str, ansi: bool) -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.parse()?)
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(CommFormatter { ansi })
        .with_filter(env_filter);

    tracing_subscriber::registry().with(fmt_layer).try_init()?;
    tracing::debug!("logging initialized at {}", default_level);
    Ok(())
}

/// [`init_log`] at the level of `config`.
pub fn init_log_with(config: &CommunicatorConfig, ansi: bool) -> anyhow::Result<()> {
    init_log(&config.log_level, ansi)
}
