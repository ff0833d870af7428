use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// File name prefix of the daily-rotated log (`<dir>/catalog_ingest.log.<date>`).
pub const LOG_FILE_PREFIX: &str = "catalog_ingest.log";

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Sets up the global tracing subscriber: a stdout layer plus, when `log_dir`
/// is given, a daily-rotating non-blocking file layer.
///
/// `RUST_LOG` overrides `default_filter`. Keep the returned guard alive until
/// exit or buffered file lines are lost.
pub fn init_tracing(
    default_filter: &str,
    log_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>, anyhow::Error> {
    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_filter(env_filter(default_filter));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true)
                .with_filter(env_filter(default_filter));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))?;
    Ok(guard)
}
