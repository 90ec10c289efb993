use std::env;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

pub struct TimeUtility;
pub struct FileUtility;

impl TimeUtility {
    /// Wall-clock seconds since the Unix epoch, the unit of every timestamp log line.
    pub fn now_secs() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl FileUtility {
    pub const LOG_DIR_ENV: &'static str = "TENSORSTREAM_LOG_DIR";

    /// Directory holding the timestamp logs, `$TENSORSTREAM_LOG_DIR` or the working directory.
    pub fn get_log_dir() -> PathBuf {
        let dir = env::var_os(Self::LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        debug!("Using log directory {}", dir.display());
        dir
    }
}

/// Installs env_logger with an `info` default, overridable through `RUST_LOG`.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
