//! Output contract of the backup program.
//!
//! On success the program prints, anywhere in stdout, a line containing one
//! of the configured markers followed by the artifact location:
//!
//! ```text
//! BACKUP_FILE: /var/backups/dc1.tar.gz
//! New AOS snapshot: 2025-05-08_19-51-35
//! ```
//!
//! The marker may appear mid-line (after a log prefix). When several lines
//! match, the last one wins. No other output shape is accepted.

use crate::utils::errors::BackupError;
use std::path::{Path, PathBuf};

/// Find the location announced by the backup program.
pub fn extract_location(stdout: &str, markers: &[String]) -> Result<String, BackupError> {
    let markers: Vec<&str> = markers
        .iter()
        .map(|m| m.as_str())
        .filter(|m| !m.trim().is_empty())
        .collect();

    let mut found: Option<(&str, &str)> = None;
    for line in stdout.lines() {
        for marker in &markers {
            if let Some(pos) = line.find(marker) {
                let value = line[pos + marker.len()..].trim();
                found = Some((marker, value));
                break;
            }
        }
    }

    match found {
        Some((marker, "")) => Err(BackupError::EmptyMarker(marker.to_string())),
        Some((_, value)) => Ok(value.trim_matches(|c| c == '"' || c == '\'').to_string()),
        None => Err(BackupError::MissingMarker(
            markers.iter().map(|m| m.to_string()).collect(),
        )),
    }
}

/// Turn a marker value into the artifact path.
///
/// Relative values (snapshot ids) are joined onto `snapshot_dir`, then
/// `artifact_name` is appended when set. Purely textual: the path is not
/// checked for existence.
pub fn resolve_artifact_path(
    location: &str,
    snapshot_dir: Option<&Path>,
    artifact_name: Option<&str>,
) -> PathBuf {
    let location = Path::new(location);
    let base = match snapshot_dir {
        Some(dir) if location.is_relative() => dir.join(location),
        _ => location.to_path_buf(),
    };
    match artifact_name.filter(|n| !n.is_empty()) {
        Some(name) => base.join(name),
        None => base,
    }
}
