//! Logging bootstrap for the CLI and daemon.

use foldex_core::default_data_dir;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn env_filter(verbose: bool) -> EnvFilter {
  let default_directive = if verbose { "debug" } else { "info" };
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Console logging for one-shot commands.
pub fn init(verbose: bool) {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter(verbose))
    .with_target(false)
    .with_writer(std::io::stderr)
    .init();
}

/// File logging for the long-running daemon. The returned guard must be
/// held for the process lifetime or buffered lines are dropped.
pub fn init_daemon(verbose: bool) -> std::io::Result<WorkerGuard> {
  let log_dir = default_data_dir().join("logs");
  std::fs::create_dir_all(&log_dir)?;

  let appender = tracing_appender::rolling::daily(log_dir, "foldex.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter(verbose))
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
