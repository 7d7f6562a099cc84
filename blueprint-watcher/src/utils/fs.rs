//! Crash-safe file replacement and backup rotation.

use crate::utils::errors::PersistenceError;
use std::path::{Path, PathBuf};

/// Replace `path` with `body` via a sibling temp file and a rename, so a
/// crash mid-write leaves either the old or the new content on disk.
pub fn atomic_write(path: &Path, body: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));

    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
        file.write_all(body).map_err(|e| PersistenceError::io(&tmp, e))?;
        file.sync_all().map_err(|e| PersistenceError::io(&tmp, e))?;
    }

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(PersistenceError::io(path, e));
    }

    Ok(())
}

/// Copy `path` to `<path>.bak`, overwriting the previous copy.
/// Does nothing when `path` does not exist yet.
pub fn single_backup(path: &Path) -> Result<Option<PathBuf>, PersistenceError> {
    if !path.exists() {
        return Ok(None);
    }
    let backup = sibling(path, "bak");
    std::fs::copy(path, &backup).map_err(|e| PersistenceError::io(&backup, e))?;
    Ok(Some(backup))
}

/// Copy `path` to a timestamped sibling and delete the oldest copies beyond
/// `max_backups`. `max_backups == 0` disables rotation.
pub fn rotating_backup(path: &Path, max_backups: usize) -> Result<(), PersistenceError> {
    if max_backups == 0 || !path.exists() {
        return Ok(());
    }

    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string();
    let backup = sibling(path, &format!("{}.bak", stamp));
    std::fs::copy(path, &backup).map_err(|e| PersistenceError::io(&backup, e))?;

    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(d) => d.to_path_buf(),
        None => PathBuf::from("."),
    };
    let prefix = format!(
        "{}.",
        path.file_name().unwrap_or_default().to_string_lossy()
    );

    // Timestamps sort lexically, so the newest copies come first after reversing.
    let mut backups: Vec<_> = std::fs::read_dir(&dir)
        .map_err(|e| PersistenceError::io(&dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.starts_with(&prefix) && name.ends_with(".bak") && name != format!("{}bak", prefix)
        })
        .collect();
    backups.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    for old in backups.into_iter().skip(max_backups) {
        if let Err(e) = std::fs::remove_file(old.path()) {
            tracing::warn!("Failed to remove old state backup {}: {}", old.path().display(), e);
        } else {
            tracing::debug!("Removed old state backup {}", old.file_name().to_string_lossy());
        }
    }

    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
