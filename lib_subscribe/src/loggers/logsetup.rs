//! # Logging Setup
//!
//! Installs the global `tracing` subscriber used by the subscription binaries:
//! a human readable stdout layer, and optionally a plain-text file layer
//! written through a non-blocking appender. Each run writes a fresh,
//! timestamped file; older files of the same application are rotated away.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;
use glob::glob;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::configs::SubscribeConfig;

/// # Log Options
///
/// Where and how much to log.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Prefix of the log file names.
    pub app_name: String,
    /// Filter directive, e.g. `info` or `lib_subscribe=debug`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Directory for log files; stdout only when `None`.
    pub log_dir: Option<PathBuf>,
}

impl LogOptions {
    /// Options derived from a resolved configuration.
    pub fn from_config(app_name: &str, config: &SubscribeConfig) -> Self {
        Self {
            app_name: app_name.to_string(),
            level: config.log_level.clone(),
            log_dir: config.log_dir.clone(),
        }
    }
}

/// Installs the global subscriber.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the lifetime of the program.
pub fn init_logging(options: &LogOptions) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let mut guard = None;
    let file_layer = match &options.log_dir {
        Some(log_dir) => {
            fs::create_dir_all(log_dir)
                .with_context(|| format!("creating log directory {}", log_dir.display()))?;
            rotate_logs(&options.app_name, log_dir);

            let file_name = format!(
                "{}-{}.log",
                options.app_name,
                Local::now().format("%Y%m%d_%H%M%S")
            );
            let appender = tracing_appender::rolling::never(log_dir, file_name);
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);
            Some(fmt::layer().with_ansi(false).with_writer(writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()
        .context("installing the global tracing subscriber")?;

    Ok(guard)
}

/// Keeps only the newest `<app_name>-*.log` file in `log_dir`.
fn rotate_logs(app_name: &str, log_dir: &Path) {
    let pattern = format!("{}/{}-*.log", log_dir.display(), app_name);
    let mut log_files: Vec<PathBuf> = match glob(&pattern) {
        Ok(paths) => paths.filter_map(|entry| entry.ok()).collect(),
        Err(e) => {
            eprintln!("Invalid log rotation pattern {}: {}", pattern, e);
            return;
        }
    };

    // Timestamped names sort chronologically; newest first.
    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    for old_file in log_files.iter().skip(1) {
        if let Err(e) = fs::remove_file(old_file) {
            eprintln!("Error deleting old log file {}: {}", old_file.display(), e);
        }
    }
}
