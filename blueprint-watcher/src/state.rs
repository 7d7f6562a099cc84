//! Durable revision state.
//!
//! The state file records, per blueprint, the last revision that was fully
//! backed up and delivered. [`StateStore::commit`] is the only way a revision
//! advances, commits are serialized by one lock, and the in-memory copy is
//! updated only after the file has been replaced on disk.

use crate::utils::errors::PersistenceError;
use crate::utils::fs::{atomic_write, rotating_backup};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Per-blueprint revision record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionState {
    #[serde(rename = "last_revision_id")]
    pub last_revision: String,

    #[serde(default)]
    pub last_poll_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_change_time: Option<DateTime<Utc>>,

    pub blueprint_id: String,

    #[serde(default)]
    pub blueprint_name: Option<String>,
}

/// On-disk document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub last_poll_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(default, alias = "blueprints")]
    pub resources: BTreeMap<String, RevisionState>,
}

/// A revision to record for one blueprint.
#[derive(Debug, Clone)]
pub struct RevisionUpdate {
    pub resource_id: String,
    pub resource_name: Option<String>,
    pub revision: String,
    pub polled_at: DateTime<Utc>,
    /// True when this commit follows a delivered backup, false when it only
    /// establishes the first-seen revision
    pub changed: bool,
}

/// Poll times of blueprints found unchanged since the last write.
#[derive(Debug, Default)]
struct PollLog {
    last: Option<DateTime<Utc>>,
    by_resource: BTreeMap<String, DateTime<Utc>>,
}

pub struct StateStore {
    path: PathBuf,
    max_backups: usize,
    state: Mutex<StateFile>,
    polls: Mutex<PollLog>,
}

impl StateStore {
    /// Open the state file, starting empty when it does not exist yet.
    /// A file that exists but cannot be parsed is an error rather than a
    /// silent reset, since a reset would re-baseline every blueprint.
    pub fn open(path: impl Into<PathBuf>, max_backups: usize) -> Result<Self, PersistenceError> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| PersistenceError::Decode {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("State file {} does not exist, starting fresh", path.display());
                StateFile::default()
            }
            Err(e) => return Err(PersistenceError::io(&path, e)),
        };

        Ok(Self {
            path,
            max_backups,
            state: Mutex::new(state),
            polls: Mutex::new(PollLog::default()),
        })
    }

    pub async fn get(&self, resource_id: &str) -> Option<RevisionState> {
        self.state.lock().await.resources.get(resource_id).cloned()
    }

    /// Note a successful poll that found nothing new. The time is held
    /// outside the state document and folded into it by the next commit; it
    /// never affects change detection.
    pub async fn record_poll(&self, resource_id: &str, polled_at: DateTime<Utc>) {
        let mut polls = self.polls.lock().await;
        polls.last = polls.last.max(Some(polled_at));
        let entry = polls
            .by_resource
            .entry(resource_id.to_string())
            .or_insert(polled_at);
        *entry = (*entry).max(polled_at);
    }

    pub async fn commit(&self, update: RevisionUpdate) -> Result<(), PersistenceError> {
        self.commit_many(vec![update]).await
    }

    /// Record several revisions in one atomic write. Either all of them
    /// become durable and visible, or none do.
    pub async fn commit_many(&self, updates: Vec<RevisionUpdate>) -> Result<(), PersistenceError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let mut polls = self.polls.lock().await;
        let mut next = state.clone();
        let now = Utc::now();

        for (id, polled_at) in &polls.by_resource {
            if let Some(entry) = next.resources.get_mut(id) {
                entry.last_poll_time = entry.last_poll_time.max(Some(*polled_at));
            }
        }
        next.last_poll_time = next.last_poll_time.max(polls.last);

        for update in updates {
            let previous_change = next
                .resources
                .get(&update.resource_id)
                .and_then(|s| s.last_change_time);
            next.resources.insert(
                update.resource_id.clone(),
                RevisionState {
                    last_revision: update.revision,
                    last_poll_time: Some(update.polled_at),
                    last_change_time: if update.changed {
                        Some(update.polled_at)
                    } else {
                        previous_change
                    },
                    blueprint_id: update.resource_id,
                    blueprint_name: update.resource_name,
                },
            );
            next.last_poll_time = next.last_poll_time.max(Some(update.polled_at));
        }
        next.last_updated = Some(now);

        self.write(&next)?;
        *state = next;
        *polls = PollLog::default();
        Ok(())
    }

    /// Drop entries whose id fails `keep`. Returns the dropped ids; writes
    /// only when something was dropped.
    pub async fn retain<F>(&self, keep: F) -> Result<Vec<String>, PersistenceError>
    where
        F: Fn(&str) -> bool,
    {
        let mut state = self.state.lock().await;
        let dropped: Vec<String> = state
            .resources
            .keys()
            .filter(|id| !keep(id))
            .cloned()
            .collect();
        if dropped.is_empty() {
            return Ok(dropped);
        }

        let mut next = state.clone();
        for id in &dropped {
            next.resources.remove(id);
        }
        next.last_updated = Some(Utc::now());

        self.write(&next)?;
        *state = next;
        tracing::info!(?dropped, "Pruned revision state for removed blueprints");
        Ok(dropped)
    }

    fn write(&self, state: &StateFile) -> Result<(), PersistenceError> {
        let body = serde_json::to_string_pretty(state).map_err(|e| PersistenceError::Encode {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        rotating_backup(&self.path, self.max_backups)?;
        atomic_write(&self.path, body.as_bytes())?;
        tracing::debug!("State saved to {}", self.path.display());
        Ok(())
    }
}
