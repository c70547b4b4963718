//! Tracing setup for the CLI.
//!
//! Logs go to a daily rolling file so stdout stays reserved for command output.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "chatsync=info";

/// Default log directory: `<data dir>/chatsync/logs`.
pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|dir| dir.join("chatsync").join("logs"))
}

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered lines are flushed.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "chatsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
