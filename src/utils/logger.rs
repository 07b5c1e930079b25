use anyhow::Context;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Log output configuration: level plus an optional rolling file target.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    pub level: String,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
    pub rotation: Option<String>,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_max_files() -> usize {
    3
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: None,
            rotation: Some("daily".to_string()),
            max_files: default_max_files(),
        }
    }
}

impl LoggerConfig {
    /// Read the configuration from `DAQ_LOG_LEVEL`, `DAQ_LOG_DIR`,
    /// `DAQ_LOG_PREFIX` and `DAQ_LOG_ROTATION`, defaulting unset values.
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("DAQ_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            file_dir: std::env::var("DAQ_LOG_DIR").ok(),
            file_prefix: std::env::var("DAQ_LOG_PREFIX").ok(),
            rotation: std::env::var("DAQ_LOG_ROTATION").ok(),
            max_files: default_max_files(),
        }
    }

    /// Install a global `tracing` subscriber. Returns the appender guard
    /// that must stay alive for file output to be flushed.
    pub fn init(&self) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        if let Some(dir) = self.file_dir.as_deref() {
            let rotation = match self.rotation.as_deref() {
                Some("hourly") => Rotation::HOURLY,
                Some("minutely") => Rotation::MINUTELY,
                _ => Rotation::DAILY,
            };

            let appender: RollingFileAppender = RollingFileAppender::builder()
                .rotation(rotation)
                .max_log_files(self.max_files)
                .filename_prefix(self.file_prefix.as_deref().unwrap_or(""))
                .build(dir)
                .with_context(|| format!("failed to create rolling appender in {dir}"))?;

            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(writer)
                .try_init();

            Ok(Some(guard))
        } else {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
            Ok(None)
        }
    }
}
