//! Logging configuration module
//! Provides structured logging configuration with console and rolling file outputs

use serde::{Deserialize, Serialize};
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_NAME: &str = "shepherd.log";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `shepherd_api=debug,tower_http=info`
    pub level: String,
    /// Directory for rotated log files, console only when unset
    pub log_dir: Option<String>,
    pub rotation: LogRotation,
    /// JSON lines on the console as well as in files
    pub json_format: bool,
}

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            rotation: LogRotation::Daily,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Build the env filter; `RUST_LOG` wins over the configured level
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    /// Install the global subscriber.
    ///
    /// The returned guard flushes the file writer and must be held for the
    /// lifetime of the process.
    pub fn init(&self) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
        let console_layer = if self.json_format {
            fmt::layer()
                .with_target(true)
                .with_writer(io::stdout)
                .json()
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_ansi(true)
                .with_writer(io::stdout)
                .boxed()
        };

        let mut guard = None;
        let file_layer = match &self.log_dir {
            Some(dir) => {
                let file_appender = match self.rotation {
                    LogRotation::Hourly => rolling::hourly(dir, LOG_FILE_NAME),
                    LogRotation::Daily => rolling::daily(dir, LOG_FILE_NAME),
                    LogRotation::Never => rolling::never(dir, LOG_FILE_NAME),
                };
                let (writer, file_guard) = non_blocking(file_appender);
                guard = Some(file_guard);

                Some(
                    fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_thread_ids(true)
                        .with_ansi(false)
                        .json()
                        .with_writer(writer),
                )
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(self.env_filter())
            .with(console_layer)
            .with(file_layer)
            .try_init()?;

        tracing::info!(level = %self.level, log_dir = ?self.log_dir, "Logging initialized");

        Ok(guard)
    }
}
