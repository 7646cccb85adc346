use std::{fs::File, path::Path};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Holds the background writer of the JSON log file.
///
/// Dropping it flushes the remaining lines, so keep it alive until the debugger exits.
pub struct LogFileGuard<'a> {
    _writer: WorkerGuard,
    path: &'a Path,
}

impl<'a> LogFileGuard<'a> {
    fn new(writer: WorkerGuard, path: &'a Path) -> Self {
        // The subscriber is installed by now, so this line lands in the file too.
        tracing::info!("Logging session to {:?}", path);

        Self {
            _writer: writer,
            path,
        }
    }
}

impl Drop for LogFileGuard<'_> {
    fn drop(&mut self) {
        tracing::info!("Session log written to {:?}", self.path);
    }
}

/// Verbosity accepted by `--log-level` and the `general.log_level` config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[clap(rename_all = "UPPER")]
#[serde(rename_all = "UPPERCASE")]
pub enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LevelFilter> for tracing::level_filters::LevelFilter {
    fn from(level: LevelFilter) -> Self {
        match level {
            LevelFilter::Off => Self::OFF,
            LevelFilter::Error => Self::ERROR,
            LevelFilter::Warn => Self::WARN,
            LevelFilter::Info => Self::INFO,
            LevelFilter::Debug => Self::DEBUG,
            LevelFilter::Trace => Self::TRACE,
        }
    }
}

/// An explicit level overrides `RUST_LOG`; without one, `RUST_LOG` applies on top of WARN.
fn terminal_filter(level: Option<LevelFilter>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::builder()
            .with_default_directive(tracing::level_filters::LevelFilter::from(level).into())
            .parse_lossy(""),
        None => EnvFilter::builder()
            .with_default_directive(tracing::level_filters::LevelFilter::WARN.into())
            .from_env_lossy(),
    }
}

/// Installs the global subscriber for `hf2-dbg`.
///
/// Human readable lines go to stderr because stdout is reserved for the JSON messages of
/// the debug session. With a `log_path`, every event is also written to that file as JSON,
/// including span enter and exit, and the returned guard must outlive the session.
pub fn setup_logging(
    log_path: Option<&Path>,
    level: Option<LevelFilter>,
) -> anyhow::Result<Option<LogFileGuard<'_>>> {
    let terminal = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter(level));

    let Some(log_path) = log_path else {
        tracing_subscriber::registry().with(terminal).init();
        return Ok(None);
    };

    let (writer, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .buffered_lines_limit(128 * 1024)
        .finish(File::create(log_path)?);

    let json = tracing_subscriber::fmt::layer()
        .json()
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::FULL)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(terminal)
        .with(json)
        .init();

    Ok(Some(LogFileGuard::new(guard, log_path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(LevelFilter::Off, tracing::level_filters::LevelFilter::OFF)]
    #[test_case(LevelFilter::Warn, tracing::level_filters::LevelFilter::WARN)]
    #[test_case(LevelFilter::Trace, tracing::level_filters::LevelFilter::TRACE)]
    fn level_maps_to_tracing(level: LevelFilter, expected: tracing::level_filters::LevelFilter) {
        assert_eq!(tracing::level_filters::LevelFilter::from(level), expected);
    }

    #[test]
    fn explicit_level_sets_the_terminal_filter() {
        assert_eq!(
            terminal_filter(Some(LevelFilter::Debug)).max_level_hint(),
            Some(tracing::level_filters::LevelFilter::DEBUG)
        );
    }
}
