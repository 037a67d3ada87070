//! Logging initialisation for nodehost.
//!
//! Stderr always gets formatted output filtered by `RUST_LOG`, falling back
//! to the level the caller asks for. Setting `NODEHOST_LOG=1` adds a plain
//! text copy in [`crate::paths::log_dir`] as `nodehost.log` and raises the
//! fallback level to at least `info`, so the file is worth reading.
//!
//! The returned guard must outlive every log call: dropping it flushes and
//! stops the file writer.

use std::path::PathBuf;

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_NAME: &str = "nodehost.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Where logs go and how verbose they are when `RUST_LOG` is unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub default_level: Level,
    pub file_dir: Option<PathBuf>,
}

impl LogConfig {
    /// Config for `default_level`, given the value of `NODEHOST_LOG`.
    pub fn new(default_level: Level, nodehost_log: Option<&str>) -> Self {
        if nodehost_log != Some("1") {
            return Self { default_level, file_dir: None };
        }
        Self {
            default_level: default_level.max(Level::INFO),
            file_dir: Some(crate::paths::log_dir().unwrap_or_else(std::env::temp_dir)),
        }
    }

    pub fn from_env(default_level: Level) -> Self {
        Self::new(default_level, std::env::var("NODEHOST_LOG").ok().as_deref())
    }
}

/// Install the global subscriber described by `config`.
///
/// Call once from `main` and keep the guard in a local.
pub fn init(config: &LogConfig) -> LogGuard {
    let (file_layer, file_guard) = match &config.file_dir {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.as_str().to_ascii_lowercase()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    LogGuard { _file_guard: file_guard }
}
