// src/logging.rs
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber: `RUST_LOG` filter (default `info`), a
/// daily rolling file in `log_dir` and, unless the dashboard owns the
/// terminal, console output.
///
/// Keep the returned guard alive until shutdown or buffered lines are lost.
pub fn init(log_dir: &Path, console: bool) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "trader.log"));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = console.then(|| fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(guard)
}
