//! Process-wide tracing subscriber setup: an env-filtered compact stdout layer plus an optional
//! rolling JSON file layer behind a guard the caller must keep alive for the process lifetime.
//!
//! # Log targets
//! - `token` - session/config store and refresh policy
//! - `retry` - the HTTP retry wrapper's state machine
//! - `upload` - single-file streaming and resumable uploads
//! - `download` - single-file ranged downloads
//! - `sync` - directory transporter flow
//! - `cache` - the SQLite-backed request cache
//! - `crypto` - per-chunk encryption and key sealing

use std::path::PathBuf;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Where (and whether) file logging writes, on top of the always-on stdout layer.
pub struct LogConfig {
    /// Directory rolling log files are written under. `None` disables file logging.
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: dirs::data_local_dir().map(|d| d.join("tacl").join("logs")),
            file_prefix: "tacl".to_string(),
        }
    }
}

/// Resolve the effective filter directive: `RUST_LOG` wins; the legacy `DEBUG` toggle
/// maps to `debug` level only when `RUST_LOG` is unset; otherwise `info`.
fn resolve_env_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    if std::env::var_os("DEBUG").is_some() {
        return EnvFilter::new("debug");
    }
    EnvFilter::new("info")
}

/// Initialize the global subscriber. Returns a guard that must be held until process exit for
/// buffered file writes to flush.
pub fn init_logging(config: LogConfig) -> anyhow::Result<LogGuard> {
    let stdout_layer = fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true)
        .with_filter(resolve_env_filter());

    let file_guard = match config.log_dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(&config.file_prefix)
                .filename_suffix("log")
                .max_log_files(5)
                .build(dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_filter(resolve_env_filter());

            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stdout_layer).init();
            None
        }
    };

    tracing::info!(target: "main", "logging initialized");
    Ok(LogGuard {
        _worker_guard: file_guard,
    })
}

/// Must be kept alive for the process lifetime; dropping it flushes and stops the file writer.
pub struct LogGuard {
    _worker_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}
