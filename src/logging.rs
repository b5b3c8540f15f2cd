use eyre::{eyre, Result};
use std::path::Path;

use time::macros::format_description;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Console-only logging. `RUST_LOG` overrides the default `info` level.
///
/// Fails if a global subscriber is already installed.
pub fn initialize_logging() -> Result<()> {
    let timer = UtcTime::new(format_description!(
        "[hour]:[minute]:[second].[subsecond digits:6]"
    ));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_timer(timer))
        .try_init()
        .map_err(|e| eyre!("Installing the log subscriber: {}", e))
}

/// Console logging plus a daily rolling file in `dir`.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the program.
pub fn initialize_file_and_console_logging(dir: &Path) -> Result<WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(dir, "servo-bench.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console_timer = UtcTime::new(format_description!(
        "[hour]:[minute]:[second].[subsecond digits:6]"
    ));
    let file_timer = UtcTime::new(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
    ));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_timer(console_timer))
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_timer(file_timer)
                .with_ansi(false),
        )
        .try_init()
        .map_err(|e| eyre!("Installing the log subscriber: {}", e))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialization_is_reported() {
        // Whichever call installs the subscriber, the next one must fail.
        let _ = initialize_logging();
        let err = initialize_logging().unwrap_err();
        assert!(err.to_string().contains("log subscriber"));

        let dir = tempfile::tempdir().unwrap();
        assert!(initialize_file_and_console_logging(dir.path()).is_err());
    }
}
