//! Logging system with file output and log rotation.
//!
//! Console and file output share one filter. Files rotate daily and files
//! older than the retention period are removed at startup.

use std::fs;
use std::io;
use std::path::Path;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Base name of the log files.
const LOG_FILE_NAME: &str = "tsrec-recorder.log";

/// Initialize console and file logging.
///
/// `RUST_LOG` takes precedence over `level`; `verbose` forces `debug`.
/// Log output stops once the returned guard is dropped.
pub fn init_logging(
    log_dir: &Path,
    retention_days: u64,
    verbose: bool,
    level: &str,
) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    fs::create_dir_all(log_dir)?;
    clean_old_logs(log_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { level };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(io::stdout)
                .with_target(true)
                .with_level(true)
                .with_timer(LocalTimeTimer),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_timer(LocalTimeTimer),
        );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set default subscriber: {}", e))?;

    // Route log:: records from the library into tracing
    tracing_log::LogTracer::init().map_err(|e| format!("Failed to initialize LogTracer: {}", e))?;

    Ok(guard)
}

/// Remove log files not modified within `retention_days`.
///
/// Returns the number of files removed.
pub fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains(LOG_FILE_NAME));
        if !is_log {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        let modified: chrono::DateTime<Local> = modified.into();
        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("Failed to remove old log file {:?}: {}", path, e),
            }
        }
    }

    Ok(removed)
}

/// Local time with microseconds.
#[derive(Debug, Clone, Copy)]
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}
