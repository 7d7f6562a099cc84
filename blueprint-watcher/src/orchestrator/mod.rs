//! The control loop.
//!
//! Two independent timers drive the service: a coarse discovery timer that
//! reconciles the tracked blueprint set, and a fine polling timer that checks
//! every tracked blueprint for a new revision and, on change, runs
//! backup -> transfer -> commit for it (see [`pipeline`]).
//!
//! The inventory lives behind an `RwLock`. Discovery holds the write half for
//! the whole reconcile/persist/prune step; a pipeline takes the read half only
//! around its final commit, so a blueprint removed while its backup was in
//! flight is never written back into the state file.

mod pipeline;

pub use pipeline::Outcome;

use crate::api::{Discovery, RevisionSource};
use crate::backup::BackupInvoker;
use crate::config::{BackupScope, Config};
use crate::inventory::{reconcile, Inventory, InventoryStore, Resource};
use crate::state::{RevisionUpdate, StateStore};
use crate::transfer::TransferClient;
use crate::utils::errors::{ApiError, PersistenceError, WatcherError};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timing and policy knobs, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub polling_interval: Duration,
    pub discovery_interval: Duration,
    pub removal_threshold: u32,
    /// Upper bound for one discovery or revision call, re-login included
    pub api_timeout: Duration,
    pub max_parallel: usize,
    pub scope: BackupScope,
    /// How long shutdown waits for an in-flight poll cycle
    pub shutdown_grace: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            polling_interval: config.api.polling_interval(),
            discovery_interval: config.api.discovery_interval(),
            removal_threshold: config.api.removal_threshold,
            // login + request + one retry after re-login
            api_timeout: config.api.request_timeout() * 3,
            max_parallel: config.api.max_parallel_resources,
            scope: config.backup.scope,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Result of one discovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub discovered: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub pending_removal: Vec<String>,
    /// Whether the configuration document was rewritten
    pub inventory_written: bool,
}

/// Result of one poll cycle, keyed by blueprint id.
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    pub outcomes: BTreeMap<String, Outcome>,
}

impl PollReport {
    pub fn committed(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, Outcome::Committed { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_failure()).count()
    }
}

pub struct Orchestrator<D, R> {
    discovery: D,
    revisions: R,
    inventory: RwLock<Inventory>,
    inventory_store: InventoryStore,
    state: StateStore,
    invoker: BackupInvoker,
    transfer: Arc<TransferClient>,
    settings: OrchestratorSettings,
}

impl<D: Discovery, R: RevisionSource> Orchestrator<D, R> {
    /// The initial inventory is the one recorded in the store's document.
    pub fn new(
        discovery: D,
        revisions: R,
        inventory_store: InventoryStore,
        state: StateStore,
        invoker: BackupInvoker,
        transfer: TransferClient,
        settings: OrchestratorSettings,
    ) -> Self {
        let inventory = inventory_store.initial_inventory();
        info!(
            "Tracking {} blueprint(s) from {}",
            inventory.len(),
            inventory_store.path().display()
        );
        Self {
            discovery,
            revisions,
            inventory: RwLock::new(inventory),
            inventory_store,
            state,
            invoker,
            transfer: Arc::new(transfer),
            settings,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub async fn inventory(&self) -> Inventory {
        self.inventory.read().await.clone()
    }

    /// Refresh the tracked set from the API.
    ///
    /// A failed discovery leaves inventory and state exactly as they were. On
    /// success the document is rewritten only if its content changed, and
    /// revision state of removed blueprints is pruned after the new inventory
    /// is durable.
    pub async fn discovery_cycle(&self) -> Result<DiscoveryReport, WatcherError> {
        let discovered = self
            .bounded("discovery", self.discovery.discover())
            .await?;

        let mut inventory = self.inventory.write().await;
        let outcome = reconcile(&discovered, &inventory, self.settings.removal_threshold);

        for id in &outcome.added {
            info!(blueprint_id = %id, "New blueprint discovered");
        }
        for id in &outcome.pending_removal {
            if let Some(r) = outcome.inventory.get(id) {
                warn!(
                    blueprint_id = %id,
                    "Blueprint missing from discovery ({}/{} before removal)",
                    r.missed_discoveries,
                    self.settings.removal_threshold
                );
            }
        }
        for id in &outcome.removed {
            info!(blueprint_id = %id, "Blueprint removed");
        }

        let written = self.inventory_store.persist(&outcome.inventory)?;
        *inventory = outcome.inventory;

        let tracked = &*inventory;
        self.state.retain(|id| tracked.contains(id)).await?;

        let report = DiscoveryReport {
            discovered: discovered.len(),
            added: outcome.added.into_iter().collect(),
            removed: outcome.removed.into_iter().collect(),
            pending_removal: outcome.pending_removal.into_iter().collect(),
            inventory_written: written,
        };
        info!(
            "Discovery complete: {} found, {} added, {} removed, tracking {}",
            report.discovered,
            report.added.len(),
            report.removed.len(),
            inventory.len()
        );
        Ok(report)
    }

    /// Poll every tracked blueprint once and handle detected changes.
    pub async fn poll_cycle(self: &Arc<Self>) -> PollReport {
        let resources = self.inventory.read().await.to_vec();
        if resources.is_empty() {
            debug!("No blueprints tracked, nothing to poll");
            return PollReport::default();
        }

        let outcomes = match self.settings.scope {
            BackupScope::PerBlueprint => {
                self.for_each_resource(resources, |this, resource| async move {
                    this.process_resource(&resource).await
                })
                .await
            }
            BackupScope::FullSystem => self.full_system_cycle(resources).await,
        };

        let report = PollReport { outcomes };
        info!(
            "Poll cycle complete: {} blueprint(s), {} committed, {} failed",
            report.outcomes.len(),
            report.committed(),
            report.failed()
        );
        report
    }

    /// Run until `cancel` fires.
    ///
    /// Discovery runs once up front. A poll tick that arrives while the
    /// previous cycle is still running is skipped.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Orchestrator started: polling every {:?}, discovery every {:?}",
            self.settings.polling_interval, self.settings.discovery_interval
        );

        if let Err(e) = self.discovery_cycle().await {
            error!("Startup discovery failed, continuing with configured inventory: {}", e);
        }

        let mut discovery_timer = interval_at(
            Instant::now() + self.settings.discovery_interval,
            self.settings.discovery_interval,
        );
        discovery_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll_timer = interval(self.settings.polling_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut in_flight: Option<JoinHandle<PollReport>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = discovery_timer.tick() => {
                    if let Err(e) = self.discovery_cycle().await {
                        warn!("Discovery failed, keeping current inventory: {}", e);
                    }
                }
                _ = poll_timer.tick() => {
                    if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
                        warn!("Previous poll cycle still running, skipping this tick");
                        continue;
                    }
                    let this = Arc::clone(&self);
                    in_flight = Some(tokio::spawn(async move { this.poll_cycle().await }));
                }
            }
        }

        if let Some(handle) = in_flight.filter(|h| !h.is_finished()) {
            info!(
                "Waiting up to {:?} for the running poll cycle",
                self.settings.shutdown_grace
            );
            if tokio::time::timeout(self.settings.shutdown_grace, handle)
                .await
                .is_err()
            {
                warn!("Poll cycle did not finish within the grace period");
            }
        }
        info!("Orchestrator stopped");
    }

    /// Apply `task` to each resource on its own task, at most
    /// `max_parallel` at a time.
    async fn for_each_resource<T, F, Fut>(
        self: &Arc<Self>,
        resources: Vec<Resource>,
        task: F,
    ) -> BTreeMap<String, T>
    where
        T: Send + 'static,
        F: Fn(Arc<Self>, Resource) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut handles = Vec::with_capacity(resources.len());

        for resource in resources {
            let id = resource.id.clone();
            let sem = Arc::clone(&semaphore);
            let work = task(Arc::clone(self), resource);
            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                Some(work.await)
            });
            handles.push((id, handle));
        }

        let mut results = BTreeMap::new();
        for (id, handle) in handles {
            match handle.await {
                Ok(Some(result)) => {
                    results.insert(id, result);
                }
                Ok(None) => warn!(blueprint_id = %id, "Poll skipped, limiter closed"),
                Err(e) => error!(blueprint_id = %id, "Poll task panicked: {}", e),
            }
        }
        results
    }

    /// Await an API call under the configured bound.
    async fn bounded<T>(
        &self,
        what: &str,
        call: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        match tokio::time::timeout(self.settings.api_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Transient(format!(
                "{} timed out after {:?}",
                what, self.settings.api_timeout
            ))),
        }
    }

    /// Commit the updates whose blueprint is still tracked and return their
    /// ids.
    async fn commit_tracked(
        &self,
        updates: Vec<RevisionUpdate>,
    ) -> Result<Vec<String>, PersistenceError> {
        let inventory = self.inventory.read().await;
        let (kept, dropped): (Vec<_>, Vec<_>) = updates
            .into_iter()
            .partition(|u| inventory.contains(&u.resource_id));
        for update in &dropped {
            info!(blueprint_id = %update.resource_id, "Blueprint removed during backup, not recording revision");
        }
        let ids: Vec<String> = kept.iter().map(|u| u.resource_id.clone()).collect();
        self.state.commit_many(kept).await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests;
