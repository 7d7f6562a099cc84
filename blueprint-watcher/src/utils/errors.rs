//! Error types for the blueprint watcher.
//!
//! Each pipeline stage has its own error enum so the orchestrator can decide
//! what a failure means for the resource (retry next poll, surface, abort the
//! commit) without string matching.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the Apstra API (discovery and revision polling).
#[derive(Error, Debug)]
pub enum ApiError {
    /// Network failure, timeout, non-2xx status or malformed body.
    /// Retried at the next scheduled cycle, never immediately.
    #[error("Transient API error: {0}")]
    Transient(String),

    /// Login refused, or a 401 that survived one re-authentication.
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("No revisions reported for blueprint {0}")]
    NoRevisions(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Transient(e.to_string())
    }
}

/// Failures running the external backup program.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Failed to spawn backup program {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup program exited with code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Backup program timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backup program output did not contain any of the markers {0:?}")]
    MissingMarker(Vec<String>),

    #[error("Backup marker {0:?} was not followed by a path")]
    EmptyMarker(String),
}

/// Failures shipping an artifact to remote storage.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Transfer configuration error: {0}")]
    Config(String),

    #[error("Connection to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("FTP error: {0}")]
    Ftp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transfer failed after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        last: Box<TransferError>,
    },
}

impl From<suppaftp::FtpError> for TransferError {
    fn from(e: suppaftp::FtpError) -> Self {
        TransferError::Ftp(e.to_string())
    }
}

/// Failures writing or reading durable state (state file, inventory document).
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode {path}: {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("Failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type Result<T> = std::result::Result<T, WatcherError>;
