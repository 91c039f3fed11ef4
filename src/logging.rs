use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when RUST_LOG is not set
const DEFAULT_FILTER: &str = "spsync=info";

/// Install the global tracing subscriber.
///
/// Logs go to stderr, or to `log_file` when given. Keep the returned guard
/// alive until exit so buffered lines are flushed.
pub fn init(log_file: Option<&Path>) -> Result<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  let (writer, guard) = match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name))
    }
    None => tracing_appender::non_blocking(std::io::stderr()),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(log_file.is_none()))
    .with(filter)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
