//! Blueprint inventory: the reconciled set of tracked resources.
//!
//! Discovery results are merged into the inventory by [`reconcile`] (pure,
//! no I/O) and the result is persisted by [`InventoryStore`] only when the
//! serialized document actually changes.

pub mod reconcile;
pub mod store;

pub use reconcile::{reconcile, Reconciliation};
pub use store::InventoryStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A remotely managed blueprint whose revision is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Stable, unique identity
    pub id: String,

    /// Display label; may change without an identity change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Revision endpoint, always derived from `id`
    #[serde(default)]
    pub endpoint: String,

    /// Consecutive discovery cycles this blueprint has been absent from
    #[serde(default, skip_serializing_if = "is_zero")]
    pub missed_discoveries: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Revision endpoint for a blueprint id.
pub fn endpoint_for(id: &str) -> String {
    format!("/api/blueprints/{}/revisions", id)
}

impl Resource {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        let id = id.into();
        Resource {
            endpoint: endpoint_for(&id),
            id,
            name,
            missed_discoveries: 0,
        }
    }

    /// Name used in logs and remote file names
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(&self.id)
    }
}

/// Set of tracked resources keyed by id. Iteration order is by id, so the
/// serialized form is stable regardless of discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    resources: BTreeMap<String, Resource>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted entries. Duplicate ids keep the last entry and
    /// endpoints are re-derived, so a hand-edited document cannot break the
    /// inventory invariants.
    pub fn from_resources(resources: impl IntoIterator<Item = Resource>) -> Self {
        let mut inventory = Inventory::new();
        for mut resource in resources {
            if resource.id.is_empty() {
                tracing::warn!("Ignoring inventory entry without an id");
                continue;
            }
            resource.endpoint = endpoint_for(&resource.id);
            inventory.insert(resource);
        }
        inventory
    }

    pub fn insert(&mut self, resource: Resource) {
        self.resources.insert(resource.id.clone(), resource);
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Resource> {
        self.resources.values().cloned().collect()
    }
}
