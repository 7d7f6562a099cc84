//! Artifact delivery to remote storage.
//!
//! One [`Uploader`] per protocol, chosen from configuration when the
//! [`TransferClient`] is built. The client owns the retry policy: the remote
//! directory is created once before the first attempt, then each attempt is a
//! fresh connection and a full upload (no resume).

pub mod ftp;
pub mod scp;
pub mod sftp;
mod ssh;

use crate::backup::Artifact;
use crate::config::{RemoteCredentials, TransferConfig, TransferMethod};
use crate::utils::errors::TransferError;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use ftp::FtpUploader;
pub use scp::ScpUploader;
pub use sftp::SftpUploader;

/// A single protocol able to place a local file on the remote host.
///
/// Implementations are blocking and are driven from a blocking thread.
pub trait Uploader: Send + Sync {
    fn protocol(&self) -> &'static str;

    /// Make sure the target directory exists.
    fn create_remote_dir(&self) -> Result<(), TransferError>;

    /// Upload `local` as `remote_name` inside the target directory and return
    /// the remote path.
    fn upload(&self, local: &Path, remote_name: &str) -> Result<String, TransferError>;
}

/// Connection parameters shared by every protocol.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub directory: String,
    pub credentials: RemoteCredentials,
    pub timeout: Duration,
}

impl RemoteTarget {
    pub fn from_config(config: &TransferConfig, credentials: &RemoteCredentials) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port(),
            directory: config.remote_directory.trim().to_string(),
            credentials: credentials.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// True when files go straight into the login directory.
    pub fn is_login_dir(&self) -> bool {
        matches!(self.directory.as_str(), "" | ".")
    }

    pub fn remote_path(&self, name: &str) -> String {
        if self.is_login_dir() {
            name.to_string()
        } else {
            format!("{}/{}", self.directory.trim_end_matches('/'), name)
        }
    }

    pub(crate) fn username(&self) -> Result<&str, TransferError> {
        self.credentials
            .username
            .as_deref()
            .ok_or_else(|| TransferError::Config("REMOTE_USERNAME is not set".into()))
    }
}

/// Every ancestor of `dir`, outermost first: `/srv/a` gives `["/srv", "/srv/a"]`.
pub fn dir_prefixes(dir: &str) -> Vec<String> {
    let absolute = dir.starts_with('/');
    let mut current = String::new();
    let mut prefixes = Vec::new();
    for part in dir.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if !current.is_empty() || absolute {
            current.push('/');
        }
        current.push_str(part);
        prefixes.push(current.clone());
    }
    prefixes
}

/// Destination file name: `{label}-{timestamp}-{original file name}`.
///
/// The timestamp carries milliseconds so two backups of one blueprint in the
/// same second still get distinct names.
pub fn remote_file_name(label: &str, local_path: &Path, at: DateTime<Utc>) -> String {
    let suffix = local_path
        .file_name()
        .map(|n| sanitize(&n.to_string_lossy()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "backup".to_string());
    format!("{}-{}-{}", sanitize(label), at.format("%Y%m%d-%H%M%S%.3f"), suffix)
}

fn sanitize(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct TransferClient {
    uploader: Box<dyn Uploader>,
    retry_attempts: u32,
    retry_delay: Duration,
    create_remote_dir: bool,
    keep_local: bool,
    timeout: Duration,
}

impl TransferClient {
    pub fn new(uploader: Box<dyn Uploader>, config: &TransferConfig) -> Self {
        Self {
            uploader,
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_seconds),
            create_remote_dir: config.create_remote_directory,
            keep_local: config.keep_local,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// Build the client for the configured protocol. Missing credentials are
    /// reported here rather than on the first upload.
    pub fn from_config(
        config: &TransferConfig,
        credentials: &RemoteCredentials,
    ) -> Result<Self, TransferError> {
        let target = RemoteTarget::from_config(config, credentials);
        let uploader: Box<dyn Uploader> = match config.method {
            TransferMethod::Scp => Box::new(ScpUploader::new(target)?),
            TransferMethod::Sftp => Box::new(SftpUploader::new(target)?),
            TransferMethod::Ftp => Box::new(FtpUploader::new(target)?),
        };
        info!(
            "Transfer via {} to {}:{} ({})",
            uploader.protocol(),
            config.host,
            config.port(),
            config.remote_directory
        );
        Ok(Self::new(uploader, config))
    }

    pub fn protocol(&self) -> &'static str {
        self.uploader.protocol()
    }

    /// Upload with the configured retry policy. Blocks the calling thread.
    ///
    /// `cancel` is checked before every attempt and during the retry delay.
    /// The local artifact is left in place; see [`Self::transfer`].
    pub fn transfer_blocking(
        &self,
        artifact: &Artifact,
        remote_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, TransferError> {
        let local = &artifact.local_path;
        if !local.is_file() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("backup artifact {} does not exist", local.display()),
            )));
        }

        if self.create_remote_dir {
            if let Err(e) = self.uploader.create_remote_dir() {
                warn!("Could not create remote directory: {}", e);
            }
        }

        let mut last_error = None;
        for attempt in 1..=self.retry_attempts {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            match self.uploader.upload(local, remote_name) {
                Ok(remote_path) => {
                    info!(
                        "Transferred {} to {} via {} (attempt {}/{})",
                        local.display(),
                        remote_path,
                        self.uploader.protocol(),
                        attempt,
                        self.retry_attempts
                    );
                    return Ok(remote_path);
                }
                Err(e) => {
                    warn!(
                        "Transfer attempt {}/{} failed: {}",
                        attempt, self.retry_attempts, e
                    );
                    last_error = Some(e);
                    if attempt < self.retry_attempts
                        && !sleep_unless_cancelled(self.retry_delay, cancel)
                    {
                        return Err(TransferError::Cancelled);
                    }
                }
            }
        }

        Err(TransferError::Exhausted {
            attempts: self.retry_attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| TransferError::Config("no attempt was made".into())),
            ),
        })
    }

    /// Run [`Self::transfer_blocking`] on a blocking thread, bounded by the
    /// transfer timeout (which covers every retry).
    ///
    /// On timeout the blocking thread is cancelled and abandoned. The local
    /// artifact is removed (unless `keep_local`) only after a success that
    /// arrived within the timeout.
    pub async fn transfer(
        self: &Arc<Self>,
        artifact: Artifact,
        remote_name: String,
    ) -> Result<String, TransferError> {
        let client = Arc::clone(self);
        let cancel = CancellationToken::new();
        let local = artifact.local_path.clone();
        let task = tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            move || client.transfer_blocking(&artifact, &remote_name, &cancel)
        });

        let remote_path = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => {
                return Err(TransferError::Io(std::io::Error::other(format!(
                    "transfer task failed: {}",
                    e
                ))))
            }
            Err(_) => {
                cancel.cancel();
                return Err(TransferError::Timeout(self.timeout));
            }
        };

        if !self.keep_local {
            match tokio::fs::remove_file(&local).await {
                Ok(()) => info!("Removed local artifact {}", local.display()),
                Err(e) => warn!("Failed to remove {}: {}", local.display(), e),
            }
        }
        Ok(remote_path)
    }
}

/// Sleep for `delay` in short steps. Returns `false` if cancelled meanwhile.
fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    const STEP: Duration = Duration::from_millis(100);
    let mut remaining = delay;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let step = remaining.min(STEP);
        std::thread::sleep(step);
        remaining -= step;
    }
    !cancel.is_cancelled()
}
