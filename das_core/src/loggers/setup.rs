use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, prelude::*, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// # Logging Options
///
/// Where and how verbosely the process logs.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Filter directive used when `RUST_LOG` is not set, e.g. `"info"`.
    pub level: String,
    /// Directory for JSON log files. Console-only when `None`.
    pub log_dir: Option<PathBuf>,
    /// Prefix of the log file names.
    pub app_name: String,
    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            app_name: "das".to_string(),
            ansi: true,
        }
    }
}

/// Installs the global subscriber: console output plus an optional JSON file.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the lifetime of the process.
pub fn setup_logging(options: &LoggingOptions) -> Result<Option<WorkerGuard>, LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .map_err(|e| LoggingError::Filter {
            filter: options.level.clone(),
            reason: e.to_string(),
        })?;

    let console_layer = fmt::layer().with_target(true).with_ansi(options.ansi);

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            let path = new_log_file(dir, &options.app_name)?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{}.log", options.app_name));
            let (writer, guard) = non_blocking(rolling::never(dir, file_name));
            let layer = fmt::layer().with_ansi(false).with_writer(writer).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(level = %options.level, "logging initialized");
    Ok(guard)
}

/// Prepares `dir` and returns the path for a fresh timestamped log file.
fn new_log_file(dir: &Path, app_name: &str) -> Result<PathBuf, LoggingError> {
    fs::create_dir_all(dir)?;
    cleanup_old_logs(dir, app_name)?;
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    Ok(dir.join(format!("{}-{}.log", app_name, stamp)))
}

/// Deletes all but the newest `<app_name>-*.log` file in `dir`.
///
/// Returns the number of files removed.
pub fn cleanup_old_logs(dir: &Path, app_name: &str) -> Result<usize, LoggingError> {
    let pattern = format!("{}/{}-*.log", dir.display(), app_name);
    let mut log_files: Vec<PathBuf> = match glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            eprintln!("Invalid log file pattern {}: {}", pattern, e);
            return Ok(0);
        }
    };

    // Timestamped names sort chronologically; newest first.
    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for old_file in log_files.iter().skip(1) {
        match fs::remove_file(old_file) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Error deleting old log file {}: {}", old_file.display(), e),
        }
    }
    Ok(removed)
}
