//! Persists the inventory as part of the configuration document.

use super::Inventory;
use crate::config::Config;
use crate::utils::errors::PersistenceError;
use crate::utils::fs::{atomic_write, single_backup};
use std::path::{Path, PathBuf};

/// Writes the configuration document back to disk with the reconciled
/// inventory in `[[api.blueprints]]`.
///
/// A write happens only when the serialized document differs from what is on
/// disk; the previous file is kept as `<path>.bak` (one copy).
pub struct InventoryStore {
    path: PathBuf,
    document: Config,
}

impl InventoryStore {
    /// `document` supplies every non-inventory section of the written file.
    pub fn new(path: impl Into<PathBuf>, document: Config) -> Self {
        Self {
            path: path.into(),
            document,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inventory recorded in the document at load time.
    pub fn initial_inventory(&self) -> Inventory {
        Inventory::from_resources(self.document.api.blueprints.iter().cloned())
    }

    /// Render the document for `inventory` exactly as it would be written.
    pub fn render(&self, inventory: &Inventory) -> Result<String, PersistenceError> {
        let mut document = self.document.clone();
        document.api.blueprints = inventory.to_vec();
        toml::to_string_pretty(&document).map_err(|e| PersistenceError::Encode {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Persist `inventory`. Returns whether the file was rewritten.
    pub fn persist(&self, inventory: &Inventory) -> Result<bool, PersistenceError> {
        let rendered = self.render(inventory)?;

        match std::fs::read(&self.path) {
            Ok(existing) if existing == rendered.as_bytes() => {
                tracing::debug!("Inventory unchanged, skipping write of {}", self.path.display());
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        }

        if let Some(backup) = single_backup(&self.path)? {
            tracing::debug!("Saved previous configuration to {}", backup.display());
        }
        atomic_write(&self.path, rendered.as_bytes())?;
        tracing::info!(
            "Configuration {} updated with {} blueprint(s)",
            self.path.display(),
            inventory.len()
        );
        Ok(true)
    }
}
