//! Backup invocation - runs the external backup program for a blueprint.

pub mod marker;

use crate::config::BackupConfig;
use crate::utils::errors::BackupError;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Backup file produced for one change-handling cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub local_path: PathBuf,
    /// Blueprint id, or `None` for a full-system backup
    pub resource_id: Option<String>,
    pub produced_at: DateTime<Utc>,
}

pub struct BackupInvoker {
    config: BackupConfig,
}

impl BackupInvoker {
    pub fn new(config: BackupConfig) -> Self {
        Self { config }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    /// Arguments for one run. A blueprint run appends `<flag> <id>` unless the
    /// configured parameters already carry the flag; a full-system run drops
    /// a bare flag from the parameters.
    pub fn arguments(&self, resource_id: Option<&str>) -> Vec<String> {
        let flag = self.config.blueprint_flag.as_str();
        let mut args = self.config.parameters.clone();
        match resource_id {
            Some(id) => {
                if flag.is_empty() {
                    args.push(id.to_string());
                } else if !args.iter().any(|a| a == flag) {
                    args.push(flag.to_string());
                    args.push(id.to_string());
                }
            }
            None => args.retain(|a| flag.is_empty() || a != flag),
        }
        args
    }

    /// Run the backup program and return the artifact it announced.
    ///
    /// Fails on spawn error, non-zero exit, timeout (the process is killed)
    /// or stdout without a marker line.
    pub async fn invoke(&self, resource_id: Option<&str>) -> Result<Artifact, BackupError> {
        let program = self.config.script_path.display().to_string();
        let args = self.arguments(resource_id);
        let timeout = self.timeout();

        info!(blueprint_id = ?resource_id, "Executing backup program: {} {}", program, args.join(" "));

        let mut command = Command::new(&self.config.script_path);
        command
            .args(&args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| BackupError::Spawn {
            program: program.clone(),
            source,
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| BackupError::Spawn {
                program: program.clone(),
                source,
            })?,
            Err(_) => {
                warn!(blueprint_id = ?resource_id, "Backup program timed out after {:?}", timeout);
                return Err(BackupError::Timeout(timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("Backup program output: {}", stdout.trim_end());
        if !stderr.trim().is_empty() {
            warn!("Backup program error output: {}", stderr.trim_end());
        }

        if !output.status.success() {
            return Err(BackupError::NonZeroExit {
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        let location = marker::extract_location(&stdout, &self.config.markers)?;
        let local_path = marker::resolve_artifact_path(
            &location,
            self.config.snapshot_dir.as_deref(),
            self.config.artifact_name.as_deref(),
        );
        info!(blueprint_id = ?resource_id, "Backup produced {}", local_path.display());

        Ok(Artifact {
            local_path,
            resource_id: resource_id.map(str::to_string),
            produced_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Invoker that runs `script` through `/bin/sh -c`; the blueprint flag and
    /// id arrive as `$1` and `$2`.
    fn shell(script: &str, timeout_seconds: u64) -> BackupInvoker {
        BackupInvoker::new(BackupConfig {
            script_path: PathBuf::from("/bin/sh"),
            parameters: vec!["-c".into(), script.into(), "aos_backup".into()],
            timeout_seconds,
            ..BackupConfig::default()
        })
    }

    #[test]
    fn test_arguments_append_blueprint() {
        let invoker = BackupInvoker::new(BackupConfig {
            parameters: vec!["--verbose".into()],
            ..BackupConfig::default()
        });
        assert_eq!(invoker.arguments(Some("bp-1")), vec!["--verbose", "--blueprint", "bp-1"]);
        assert_eq!(invoker.arguments(None), vec!["--verbose"]);
    }

    #[test]
    fn test_arguments_respect_existing_flag() {
        let invoker = BackupInvoker::new(BackupConfig {
            parameters: vec!["--blueprint".into(), "fixed".into()],
            ..BackupConfig::default()
        });
        assert_eq!(invoker.arguments(Some("bp-1")), vec!["--blueprint", "fixed"]);
        assert_eq!(invoker.arguments(None), vec!["fixed"]);
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let invoker = shell("echo working; echo \"BACKUP_FILE: /tmp/$2.tar.gz\"", 10);
        let artifact = invoker.invoke(Some("A")).await.unwrap();
        assert_eq!(artifact.local_path, PathBuf::from("/tmp/A.tar.gz"));
        assert_eq!(artifact.resource_id.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_invoke_missing_marker() {
        let invoker = shell("echo backup done", 10);
        let err = invoker.invoke(Some("A")).await.unwrap_err();
        assert!(matches!(err, BackupError::MissingMarker(_)));
    }

    #[tokio::test]
    async fn test_invoke_nonzero_exit() {
        let invoker = shell("echo 'BACKUP_FILE: /tmp/x'; echo disk full >&2; exit 3", 10);
        let err = invoker.invoke(Some("A")).await.unwrap_err();
        match err {
            BackupError::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "disk full");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let invoker = shell("sleep 5; echo 'BACKUP_FILE: /tmp/x'", 1);
        let started = std::time::Instant::now();
        let err = invoker.invoke(Some("A")).await.unwrap_err();
        assert!(matches!(err, BackupError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_invoke_missing_program() {
        let invoker = BackupInvoker::new(BackupConfig {
            script_path: PathBuf::from("/nonexistent/aos_backup"),
            ..BackupConfig::default()
        });
        let err = invoker.invoke(Some("A")).await.unwrap_err();
        assert!(matches!(err, BackupError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_invoke_uses_env_and_snapshot_dir() {
        let mut config = BackupConfig {
            script_path: PathBuf::from("/bin/sh"),
            parameters: vec!["-c".into(), "echo \"New AOS snapshot: $SNAP\"".into()],
            snapshot_dir: Some(PathBuf::from("/var/lib/aos/snapshot")),
            artifact_name: Some("aos.data.tar.gz".into()),
            ..BackupConfig::default()
        };
        config.env.insert("SNAP".into(), "2025-05-08_19-51-35".into());

        let artifact = BackupInvoker::new(config).invoke(None).await.unwrap();
        assert_eq!(
            artifact.local_path,
            PathBuf::from("/var/lib/aos/snapshot/2025-05-08_19-51-35/aos.data.tar.gz")
        );
        assert!(artifact.resource_id.is_none());
    }
}
