//! File-based logging.
//!
//! Progress lines go to the terminal through the ui channel; tracing output
//! goes to a per-cluster log file so a failed bootstrap leaves a trail.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the tracing subscriber per configuration.
///
/// The configured path may contain a `{cluster_name}` placeholder.
pub fn init_logging(config: &LoggingConfig, cluster_name: &str) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let log_file = config.file.replace("{cluster_name}", cluster_name);
    let log_path = PathBuf::from(&log_file);

    let log_dir = log_path
        .parent()
        .context("Invalid log file path")?
        .to_path_buf();
    let log_filename = log_path
        .file_name()
        .context("Invalid log filename")?
        .to_str()
        .context("Invalid UTF-8 in log filename")?;

    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(log_filename)
        .build(log_dir)
        .context("Failed to create log file appender")?;

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_timer(fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .with_target(false)
        .with_level(true);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    tracing::info!(
        cluster_name = %cluster_name,
        log_file = %log_file,
        "Logging initialized"
    );

    Ok(())
}
