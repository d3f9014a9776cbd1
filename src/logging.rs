use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Install the global subscriber: warnings to stderr, everything enabled by
/// the filter to a daily rotated file.
///
/// `RUST_LOG` overrides the configured level. Keep the returned guard alive
/// for the life of the process or buffered file lines are lost.
pub fn init(config: &LogConfig) -> Result<WorkerGuard> {
  let directory = config.directory();
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("zonesync={}", config.level)));
  let appender = RollingFileAppender::new(Rotation::DAILY, directory, "zonesync.log");
  let (file_writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr.with_max_level(tracing::Level::WARN)),
    )
    .with(
      fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(false)
        .with_writer(file_writer),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

  Ok(guard)
}
