//! Merge a discovery result into the current inventory.

use super::{Inventory, Resource};
use std::collections::BTreeSet;

/// Outcome of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub inventory: Inventory,
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    /// Ids missing from this discovery but still below the removal threshold
    pub pending_removal: BTreeSet<String>,
}

impl Reconciliation {
    pub fn has_membership_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Set difference on `id` between `discovered` and `current`.
///
/// - new ids are inserted with their discovered name
/// - ids in both keep identity and endpoint but take the discovered name,
///   and their missed-discovery counter resets
/// - ids only in `current` have their counter bumped; once it reaches
///   `removal_threshold` they are dropped and reported in `removed`
///
/// A threshold of 1 removes on the first miss.
pub fn reconcile(
    discovered: &[Resource],
    current: &Inventory,
    removal_threshold: u32,
) -> Reconciliation {
    let threshold = removal_threshold.max(1);
    let mut inventory = Inventory::new();
    let mut added = BTreeSet::new();
    let mut removed = BTreeSet::new();
    let mut pending_removal = BTreeSet::new();

    let mut seen = BTreeSet::new();
    for found in discovered {
        if found.id.is_empty() || !seen.insert(found.id.clone()) {
            continue;
        }
        let mut entry = match current.get(&found.id) {
            Some(existing) => existing.clone(),
            None => {
                added.insert(found.id.clone());
                Resource::new(found.id.clone(), None)
            }
        };
        entry.name = found.name.clone();
        entry.missed_discoveries = 0;
        inventory.insert(entry);
    }

    for existing in current.iter().filter(|r| !seen.contains(&r.id)) {
        let missed = existing.missed_discoveries.saturating_add(1);
        if missed >= threshold {
            removed.insert(existing.id.clone());
        } else {
            let mut entry = existing.clone();
            entry.missed_discoveries = missed;
            pending_removal.insert(entry.id.clone());
            inventory.insert(entry);
        }
    }

    Reconciliation {
        inventory,
        added,
        removed,
        pending_removal,
    }
}
