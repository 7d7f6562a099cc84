//! Per-blueprint change handling.
//!
//! ```text
//! poll -> (no state)        -> baseline commit, no backup
//!      -> (same revision)   -> nothing recorded but the poll time
//!      -> (new revision)    -> backup -> transfer -> commit
//! ```
//!
//! Any failure before the commit leaves the stored revision alone, so the
//! next poll sees the same change again.

use super::Orchestrator;
use crate::api::{Discovery, RevisionSource};
use crate::inventory::Resource;
use crate::state::RevisionUpdate;
use crate::transfer::remote_file_name;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const FULL_SYSTEM_LABEL: &str = "full-system";

/// What one poll cycle did for one blueprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    /// First revision seen for this blueprint, stored without a backup
    Baseline { revision: String },
    Committed { revision: String, remote_path: String },
    PollFailed(String),
    BackupFailed(String),
    TransferFailed(String),
    CommitFailed(String),
    /// Dropped from the inventory before its commit
    Removed,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::PollFailed(_)
                | Outcome::BackupFailed(_)
                | Outcome::TransferFailed(_)
                | Outcome::CommitFailed(_)
        )
    }
}

enum Detection {
    Settled(Outcome),
    Changed {
        resource: Resource,
        revision: String,
        polled_at: DateTime<Utc>,
    },
}

impl<D: Discovery, R: RevisionSource> Orchestrator<D, R> {
    pub(super) async fn process_resource(&self, resource: &Resource) -> Outcome {
        match self.detect(resource).await {
            Detection::Settled(outcome) => outcome,
            Detection::Changed {
                resource,
                revision,
                polled_at,
            } => self.handle_change(&resource, revision, polled_at).await,
        }
    }

    /// Poll one blueprint and classify the result. Baselines are committed
    /// here since they need no backup.
    async fn detect(&self, resource: &Resource) -> Detection {
        let id = &resource.id;
        let polled_at = Utc::now();

        let revision = match self
            .bounded("revision poll", self.revisions.poll(resource))
            .await
        {
            Ok(revision) => revision,
            Err(e) => {
                warn!(blueprint_id = %id, "Revision poll failed: {}", e);
                return Detection::Settled(Outcome::PollFailed(e.to_string()));
            }
        };

        let Some(previous) = self.state.get(id).await else {
            info!(blueprint_id = %id, revision = %revision, "First revision seen, recording baseline");
            let update = RevisionUpdate {
                resource_id: id.clone(),
                resource_name: resource.name.clone(),
                revision: revision.clone(),
                polled_at,
                changed: false,
            };
            let outcome = match self.commit_tracked(vec![update]).await {
                Ok(committed) if committed.is_empty() => Outcome::Removed,
                Ok(_) => Outcome::Baseline { revision },
                Err(e) => {
                    error!(blueprint_id = %id, "Failed to record baseline: {}", e);
                    Outcome::CommitFailed(e.to_string())
                }
            };
            return Detection::Settled(outcome);
        };

        if previous.last_revision == revision {
            debug!(blueprint_id = %id, revision = %revision, "No change");
            self.state.record_poll(id, polled_at).await;
            return Detection::Settled(Outcome::Unchanged);
        }

        info!(
            blueprint_id = %id,
            "Revision changed: {} -> {}",
            previous.last_revision,
            revision
        );
        Detection::Changed {
            resource: resource.clone(),
            revision,
            polled_at,
        }
    }

    async fn handle_change(
        &self,
        resource: &Resource,
        revision: String,
        polled_at: DateTime<Utc>,
    ) -> Outcome {
        let id = &resource.id;

        let artifact = match self.invoker.invoke(Some(id)).await {
            Ok(artifact) => artifact,
            Err(e) => {
                error!(blueprint_id = %id, "Backup failed: {}", e);
                return Outcome::BackupFailed(e.to_string());
            }
        };

        let name = remote_file_name(
            resource.display_name(),
            &artifact.local_path,
            artifact.produced_at,
        );
        let remote_path = match self.transfer.transfer(artifact, name).await {
            Ok(path) => path,
            Err(e) => {
                error!(blueprint_id = %id, "Transfer failed: {}", e);
                return Outcome::TransferFailed(e.to_string());
            }
        };

        let update = RevisionUpdate {
            resource_id: id.clone(),
            resource_name: resource.name.clone(),
            revision: revision.clone(),
            polled_at,
            changed: true,
        };
        match self.commit_tracked(vec![update]).await {
            Ok(committed) if committed.is_empty() => Outcome::Removed,
            Ok(_) => {
                info!(blueprint_id = %id, revision = %revision, "Backup delivered to {}", remote_path);
                Outcome::Committed {
                    revision,
                    remote_path,
                }
            }
            Err(e) => {
                error!(blueprint_id = %id, "Backup delivered but revision not saved: {}", e);
                Outcome::CommitFailed(e.to_string())
            }
        }
    }

    /// Full-system scope: detect on every blueprint, then back up the whole
    /// system once for all changed ones and commit them together.
    pub(super) async fn full_system_cycle(
        self: &Arc<Self>,
        resources: Vec<Resource>,
    ) -> BTreeMap<String, Outcome> {
        let detections = self
            .for_each_resource(resources, |this, resource| async move {
                this.detect(&resource).await
            })
            .await;

        let mut outcomes = BTreeMap::new();
        let mut changed = Vec::new();
        for (id, detection) in detections {
            match detection {
                Detection::Settled(outcome) => {
                    outcomes.insert(id, outcome);
                }
                Detection::Changed {
                    resource,
                    revision,
                    polled_at,
                } => changed.push(RevisionUpdate {
                    resource_id: resource.id,
                    resource_name: resource.name,
                    revision,
                    polled_at,
                    changed: true,
                }),
            }
        }
        if changed.is_empty() {
            return outcomes;
        }

        info!("{} blueprint(s) changed, running full-system backup", changed.len());

        let artifact = match self.invoker.invoke(None).await {
            Ok(artifact) => artifact,
            Err(e) => {
                error!("Full-system backup failed: {}", e);
                settle(&mut outcomes, &changed, Outcome::BackupFailed(e.to_string()));
                return outcomes;
            }
        };

        let name = remote_file_name(FULL_SYSTEM_LABEL, &artifact.local_path, artifact.produced_at);
        let remote_path = match self.transfer.transfer(artifact, name).await {
            Ok(path) => path,
            Err(e) => {
                error!("Full-system transfer failed: {}", e);
                settle(&mut outcomes, &changed, Outcome::TransferFailed(e.to_string()));
                return outcomes;
            }
        };

        let revisions: Vec<(String, String)> = changed
            .iter()
            .map(|u| (u.resource_id.clone(), u.revision.clone()))
            .collect();
        match self.commit_tracked(changed).await {
            Ok(committed) => {
                info!("Full-system backup delivered to {}", remote_path);
                for (id, revision) in revisions {
                    let outcome = if committed.contains(&id) {
                        Outcome::Committed {
                            revision,
                            remote_path: remote_path.clone(),
                        }
                    } else {
                        Outcome::Removed
                    };
                    outcomes.insert(id, outcome);
                }
            }
            Err(e) => {
                error!("Full-system backup delivered but revisions not saved: {}", e);
                for (id, _) in revisions {
                    outcomes.insert(id, Outcome::CommitFailed(e.to_string()));
                }
            }
        }
        outcomes
    }
}

fn settle(outcomes: &mut BTreeMap<String, Outcome>, updates: &[RevisionUpdate], outcome: Outcome) {
    for update in updates {
        outcomes.insert(update.resource_id.clone(), outcome.clone());
    }
}
