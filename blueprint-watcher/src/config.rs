//! Configuration management for the blueprint watcher.
//!
//! Loads the TOML document that also carries the reconciled blueprint
//! inventory. Credentials never live in the document: they are read from the
//! environment (optionally seeded from a `.env` file) and are skipped when the
//! document is written back.

use crate::inventory::Resource;
use crate::utils::errors::WatcherError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    pub transfer: TransferConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(skip)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Apstra server, either a bare host (`https` assumed) or a full URL
    pub server: String,

    /// Seconds between revision poll cycles
    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: u64,

    /// Seconds between blueprint discovery refreshes
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_seconds: u64,

    /// Consecutive discovery cycles a blueprint must be missing before removal
    #[serde(default = "default_removal_threshold")]
    pub removal_threshold: u32,

    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Accept self-signed certificates (Apstra ships with one)
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Blueprints polled and backed up concurrently (1 = sequential)
    #[serde(default = "default_max_parallel")]
    pub max_parallel_resources: usize,

    /// Reconciled inventory, rewritten by discovery
    #[serde(default)]
    pub blueprints: Vec<Resource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackupScope {
    /// One backup per changed blueprint, invoked with the blueprint id
    #[default]
    PerBlueprint,
    /// One backup of the whole system whenever any blueprint changed
    FullSystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_script_path")]
    pub script_path: PathBuf,

    #[serde(default)]
    pub parameters: Vec<String>,

    /// Flag placed before the blueprint id on the command line
    #[serde(default = "default_blueprint_flag")]
    pub blueprint_flag: String,

    #[serde(default)]
    pub scope: BackupScope,

    #[serde(default = "default_backup_timeout")]
    pub timeout_seconds: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Output prefixes announcing the produced artifact, e.g. `BACKUP_FILE:`
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,

    /// Base directory for marker values that are not absolute paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<PathBuf>,

    /// File inside a snapshot directory that holds the actual archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMethod {
    Scp,
    Sftp,
    Ftp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub method: TransferMethod,

    pub host: String,

    /// Defaults to 22 for scp/sftp and 21 for ftp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default = "default_remote_directory")]
    pub remote_directory: String,

    #[serde(default = "default_true")]
    pub create_remote_directory: bool,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,

    /// Keep the local artifact after a successful upload
    #[serde(default = "default_true")]
    pub keep_local: bool,

    /// Wall-clock limit for one whole transfer including retries
    #[serde(default = "default_transfer_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub file_path: PathBuf,

    /// Rotated copies of the state file to keep (0 disables)
    #[serde(default = "default_state_backups")]
    pub max_backups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Secrets supplied through the environment.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_username: String,
    pub api_password: String,
    pub remote: RemoteCredentials,
}

#[derive(Clone, Default)]
pub struct RemoteCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
    pub ssh_key_passphrase: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_username", &self.api_username)
            .field("api_password", &"***")
            .field("remote", &self.remote)
            .finish()
    }
}

impl std::fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("ssh_key_path", &self.ssh_key_path)
            .finish()
    }
}

// Default values
fn default_polling_interval() -> u64 {
    30
}

fn default_discovery_interval() -> u64 {
    300
}

fn default_removal_threshold() -> u32 {
    2
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_parallel() -> usize {
    1
}

fn default_script_path() -> PathBuf {
    PathBuf::from("/usr/sbin/aos_backup")
}

fn default_blueprint_flag() -> String {
    "--blueprint".to_string()
}

fn default_backup_timeout() -> u64 {
    1800
}

pub fn default_markers() -> Vec<String> {
    vec![
        "BACKUP_FILE:".to_string(),
        "New AOS snapshot:".to_string(),
        "New snapshot:".to_string(),
    ]
}

fn default_remote_directory() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    10
}

fn default_transfer_timeout() -> u64 {
    600
}

fn default_state_path() -> PathBuf {
    PathBuf::from("data/backup_state.json")
}

fn default_state_backups() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            script_path: default_script_path(),
            parameters: Vec::new(),
            blueprint_flag: default_blueprint_flag(),
            scope: BackupScope::default(),
            timeout_seconds: default_backup_timeout(),
            working_dir: None,
            env: BTreeMap::new(),
            markers: default_markers(),
            snapshot_dir: None,
            artifact_name: None,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            file_path: default_state_path(),
            max_backups: default_state_backups(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            file: None,
        }
    }
}

impl ApiConfig {
    /// Base URL with scheme and without a trailing slash
    pub fn base_url(&self) -> String {
        let server = self.server.trim_end_matches('/');
        if server.starts_with("http://") || server.starts_with("https://") {
            server.to_string()
        } else {
            format!("https://{}", server)
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_seconds)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl TransferConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.method {
            TransferMethod::Ftp => 21,
            TransferMethod::Scp | TransferMethod::Sftp => 22,
        })
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, WatcherError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WatcherError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, WatcherError> {
        toml::from_str(content).map_err(|e| WatcherError::Config(e.to_string()))
    }

    /// Check values that would make the service misbehave rather than fail fast
    pub fn validate(&self) -> Result<(), WatcherError> {
        let invalid = |msg: &str| Err(WatcherError::Config(msg.to_string()));

        if self.api.server.trim().is_empty() {
            return invalid("api.server must not be empty");
        }
        if self.api.polling_interval_seconds == 0 || self.api.discovery_interval_seconds == 0 {
            return invalid("api polling and discovery intervals must be positive");
        }
        if self.api.removal_threshold == 0 {
            return invalid("api.removal_threshold must be at least 1");
        }
        if self.api.max_parallel_resources == 0 {
            return invalid("api.max_parallel_resources must be at least 1");
        }
        if self.backup.markers.iter().all(|m| m.trim().is_empty()) {
            return invalid("backup.markers must contain at least one marker");
        }
        if self.backup.timeout_seconds == 0 {
            return invalid("backup.timeout_seconds must be positive");
        }
        if self.transfer.host.trim().is_empty() {
            return invalid("transfer.host must not be empty");
        }
        if self.transfer.retry_attempts == 0 {
            return invalid("transfer.retry_attempts must be at least 1");
        }
        Ok(())
    }
}

impl Credentials {
    /// Read credentials from the process environment, loading `env_file` (or a
    /// `.env` in the working directory) first when present.
    pub fn from_env(env_file: Option<&Path>) -> Result<Self, WatcherError> {
        match env_file {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| {
                    WatcherError::Config(format!("cannot load {}: {}", path.display(), e))
                })?;
                tracing::info!("Loaded environment from {}", path.display());
            }
            None => {
                if let Ok(path) = dotenvy::dotenv() {
                    tracing::info!("Loaded environment from {}", path.display());
                }
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build credentials from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WatcherError> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let missing: Vec<&str> = ["APSTRA_USERNAME", "APSTRA_PASSWORD"]
            .into_iter()
            .filter(|k| get(k).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(WatcherError::Config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        Ok(Credentials {
            api_username: get("APSTRA_USERNAME").unwrap_or_default(),
            api_password: get("APSTRA_PASSWORD").unwrap_or_default(),
            remote: RemoteCredentials {
                username: get("REMOTE_USERNAME"),
                password: get("REMOTE_PASSWORD"),
                ssh_key_path: get("SSH_KEY_PATH").map(PathBuf::from),
                ssh_key_passphrase: get("SSH_KEY_PASSPHRASE"),
            },
        })
    }
}
