//! Tracing subscriber setup for the binary.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
  fmt,
  layer::{Layer, SubscriberExt},
  util::SubscriberInitExt,
  EnvFilter,
};

use crate::config::LoggingConfig;

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr, or to a daily rolling file when a directory is set. The
/// returned guard flushes the file writer and must be held until exit.
pub fn init(logging: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
  let env_filter = filter(logging, verbose)?;

  let (fmt_layer, guard) = match &logging.directory {
    Some(directory) => {
      let appender = tracing_appender::rolling::daily(directory, "querycache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .boxed();
      (layer, Some(guard))
    }
    None => (
      fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed(),
      None,
    ),
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(fmt_layer)
    .try_init()
    .map_err(|e| eyre!("failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

/// RUST_LOG wins over the configured level; `--verbose` raises the crate to
/// debug.
fn filter(logging: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
  if let Ok(filter) = EnvFilter::try_from_default_env() {
    return Ok(filter);
  }

  let mut directives = logging.level.clone();
  if verbose {
    directives.push_str(",querycache=debug");
  }
  EnvFilter::try_new(&directives).map_err(|e| eyre!("invalid log level `{}`: {}", logging.level, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_invalid_level_is_rejected() {
    let logging = LoggingConfig {
      level: "querycache=bogus".to_string(),
      directory: None,
    };
    if std::env::var("RUST_LOG").is_err() {
      assert!(filter(&logging, false).is_err());
    }
  }

  #[test]
  fn test_verbose_adds_crate_directive() {
    let logging = LoggingConfig::default();
    if std::env::var("RUST_LOG").is_err() {
      let filter = filter(&logging, true).unwrap();
      assert!(filter.to_string().contains("querycache=debug"));
    }
  }
}
