//! Logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! Console output is always on (human-readable or JSON). When a log directory
//! is configured, JSON lines are also written to `postal-scan.log.YYYY-MM-DD`
//! with daily rotation.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Keeps the non-blocking file writer alive. Dropping it flushes pending lines.
pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

/// Initialise logging. `RUST_LOG` controls the filter (default: `info`).
pub fn init(log_dir: Option<&Path>, json_console: bool) -> std::io::Result<LoggingGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "postal-scan.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (console_json, console_text) = if json_console {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_json)
        .with(console_text)
        .init();

    Ok(LoggingGuard { _guard: guard })
}
