//! Utility modules for the blueprint watcher.

pub mod errors;
pub mod fs;
pub mod logger;

pub use errors::{ApiError, BackupError, PersistenceError, Result, TransferError, WatcherError};
