//! Configuration module
//!
//! Handles links, devices, polling and logging settings

mod settings;

pub use settings::{
    AppConfig, ConfigError, DeviceConfig, LinkConfig, LoggingConfig, PollingConfig,
};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Configuration file name
pub const CONFIG_FILE: &str = "fieldpoll.toml";

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "fieldpoll", "fieldpoll").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "fieldpoll", "fieldpoll").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Default configuration file path
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(CONFIG_FILE))
}

/// Get the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}

/// Initialize logging.
///
/// `RUST_LOG` overrides the configured level. The returned guard flushes the
/// log file and must be held until exit.
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, ConfigError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "fieldpoll.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(config.json.then(|| fmt::layer().json()))
        .with((!config.json).then(fmt::layer))
        .with(file_layer)
        .try_init()
        .map_err(|e| ConfigError::Invalid(format!("Failed to init logging: {e}")))?;

    Ok(guard)
}
