//! Logging for the daemon
//!
//! Logs go to a daily-rotated file under `$XDG_STATE_HOME/kegerator/` and,
//! unless `[logging] stderr = false`, to stderr for service supervisors.
//! `RUST_LOG` overrides the configured level.

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped, so hold it until
/// the daemon exits.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => level_filter(&config.level)?,
    };

    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "kegerator.log");
    // Pulse consumers log on the hot path and must never wait on disk
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer(config))
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {e}")))?;

    tracing::info!(
        file = %Config::log_path().display(),
        level = %config.level,
        stderr = config.stderr,
        "logging initialized"
    );
    Ok(guard)
}

/// Filter for the configured level, rejecting directives that do not parse
fn level_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| Error::Config(format!("invalid logging level {level:?}: {e}")))
}

/// Compact stderr output, or nothing when disabled
fn stderr_layer<S>(config: &LoggingConfig) -> Option<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    config.stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::Registry;

    #[test]
    fn test_stderr_layer_follows_config() {
        let mut config = LoggingConfig::default();
        assert!(stderr_layer::<Registry>(&config).is_some());

        config.stderr = false;
        assert!(stderr_layer::<Registry>(&config).is_none());
    }

    #[test]
    fn test_level_filter_accepts_directives() {
        assert!(level_filter("debug").is_ok());
        assert!(level_filter("info,kegerator_core::flow=trace").is_ok());
    }

    #[test]
    fn test_level_filter_rejects_garbage() {
        let err = level_filter("kegerator_core=loud").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("loud"));
    }
}
