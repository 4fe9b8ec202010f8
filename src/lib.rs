//! Corruption repair and portable backups for SQLite database files.
//!
//! A [`snapshot::MasterSnapshot`] of a healthy database's schema is saved
//! ahead of time. When the file later gets damaged, a
//! [`repair::CorruptionScanner`] reads whatever pages are still intact and
//! copies the surviving rows into a fresh database. A
//! [`backup::BackupSession`] streams a live database into a framed backup
//! file that [`backup::restore`] replays.

pub mod backup;
pub mod cancel;
pub mod cipher;
pub mod config;
pub mod db;
mod error;
pub mod logging;
pub mod repair;
pub mod snapshot;

pub use cancel::CancelToken;
pub use error::{AppError, AppResult, ErrorKind};

/// Installs the global tracing subscriber. Keep the returned guard alive
/// for as long as the file sink should receive events.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    match logging::init() {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("repairkit: logging disabled: {err:#}");
            None
        }
    }
}
