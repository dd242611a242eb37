//! Tracing initialisation
//!
//! Sets up the global subscriber with either console output or daily-rotated
//! files under a log directory.

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;
use crate::error::BleResult;

/// Initialize the global logger
///
/// With `console` set, logs go to stderr with ANSI colors; otherwise to a
/// daily-rotated `<service_name>.log` under `log_dir`. Call once at startup.
pub fn init_logger(
    log_dir: impl AsRef<Path>,
    service_name: &str,
    level: &str,
    console: bool,
) -> BleResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), level)));

    if console {
        fmt().with_env_filter(filter).init();
    } else {
        std::fs::create_dir_all(&log_dir)?;
        let appender = RollingFileAppender::new(
            Rotation::DAILY,
            log_dir,
            format!("{service_name}.log"),
        );
        fmt()
            .with_env_filter(filter)
            .with_writer(appender)
            .with_ansi(false)
            .init();
    }

    tracing::info!("logger initialized for {service_name}");
    Ok(())
}

/// Initialize from a [`LogConfig`]
pub fn init_from_config(config: &LogConfig, service_name: &str) -> BleResult<()> {
    init_logger(&config.dir, service_name, &config.level, config.console)
}
