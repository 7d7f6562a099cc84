//! Blueprint Watcher Library
//!
//! Watches Apstra blueprints for new revisions, runs the backup program when
//! one appears and ships the artifact to remote storage over scp, sftp or ftp.

pub mod api;
pub mod backup;
pub mod config;
pub mod daemon;
pub mod inventory;
pub mod orchestrator;
pub mod state;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use utils::errors::{Result, WatcherError};
