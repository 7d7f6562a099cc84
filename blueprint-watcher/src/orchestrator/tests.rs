use super::*;
use crate::config::{BackupConfig, TransferMethod};
use crate::state::RevisionUpdate;
use crate::transfer::Uploader;
use crate::utils::errors::TransferError;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

#[derive(Clone, Default)]
struct FakeDiscovery {
    result: Arc<Mutex<Option<Result<Vec<Resource>, String>>>>,
}

impl FakeDiscovery {
    fn set(&self, ids: &[&str]) {
        let resources = ids
            .iter()
            .map(|id| Resource::new(*id, Some(format!("{}-name", id))))
            .collect();
        *self.result.lock().unwrap() = Some(Ok(resources));
    }

    fn fail(&self) {
        *self.result.lock().unwrap() = Some(Err("connection refused".into()));
    }
}

impl Discovery for FakeDiscovery {
    async fn discover(&self) -> Result<Vec<Resource>, ApiError> {
        let result = self.result.lock().unwrap().clone();
        result
            .unwrap_or_else(|| Ok(Vec::new()))
            .map_err(ApiError::Transient)
    }
}

#[derive(Clone, Default)]
struct FakeRevisions {
    revisions: Arc<Mutex<HashMap<String, Result<String, String>>>>,
}

impl FakeRevisions {
    fn set(&self, id: &str, revision: &str) {
        self.revisions
            .lock()
            .unwrap()
            .insert(id.to_string(), Ok(revision.to_string()));
    }

    fn fail(&self, id: &str) {
        self.revisions
            .lock()
            .unwrap()
            .insert(id.to_string(), Err("HTTP 503".into()));
    }
}

impl RevisionSource for FakeRevisions {
    async fn poll(&self, resource: &Resource) -> Result<String, ApiError> {
        let result = self.revisions.lock().unwrap().get(&resource.id).cloned();
        match result {
            Some(r) => r.map_err(ApiError::Transient),
            None => Err(ApiError::NoRevisions(resource.id.clone())),
        }
    }
}

#[derive(Clone, Default)]
struct RecordingUploader {
    fail: Arc<AtomicBool>,
    uploads: Arc<Mutex<Vec<String>>>,
}

impl Uploader for RecordingUploader {
    fn protocol(&self) -> &'static str {
        "recording"
    }

    fn create_remote_dir(&self) -> Result<(), TransferError> {
        Ok(())
    }

    fn upload(&self, _local: &Path, remote_name: &str) -> Result<String, TransferError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransferError::Connect {
                host: "backup.example.net".into(),
                port: 22,
                reason: "no route to host".into(),
            });
        }
        self.uploads.lock().unwrap().push(remote_name.to_string());
        Ok(format!("/srv/backups/{}", remote_name))
    }
}

/// Backup script writing `<dir>/<blueprint or full>.tar.gz` and announcing it.
fn writing_script(dir: &Path) -> String {
    format!(
        "f={}/${{2:-full}}.tar.gz; echo data > \"$f\"; echo \"BACKUP_FILE: $f\"",
        dir.display()
    )
}

struct Harness {
    dir: TempDir,
    scope: BackupScope,
    script: String,
    discovery: FakeDiscovery,
    revisions: FakeRevisions,
    uploader: RecordingUploader,
    orchestrator: Arc<Orchestrator<FakeDiscovery, FakeRevisions>>,
}

impl Harness {
    fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    fn uploads(&self) -> Vec<String> {
        self.uploader.uploads.lock().unwrap().clone()
    }

    async fn seed(&self, id: &str, revision: &str) {
        self.orchestrator
            .state()
            .commit(RevisionUpdate {
                resource_id: id.into(),
                resource_name: None,
                revision: revision.into(),
                polled_at: Utc::now(),
                changed: false,
            })
            .await
            .unwrap();
    }

    /// Drop the running orchestrator and start a new one from the files on
    /// disk, against the same remote API and storage.
    fn restart(self) -> Harness {
        let Harness {
            dir,
            scope,
            script,
            discovery,
            revisions,
            uploader,
            orchestrator,
        } = self;
        drop(orchestrator);
        assemble(dir, scope, script, discovery, revisions, uploader)
    }

    async fn revision(&self, id: &str) -> Option<String> {
        self.orchestrator
            .state()
            .get(id)
            .await
            .map(|s| s.last_revision)
    }
}

fn harness(tracked: &[&str], scope: BackupScope, script: Option<&str>) -> Harness {
    let dir = TempDir::new().unwrap();
    let artifacts = dir.path().join("artifacts");
    std::fs::create_dir_all(&artifacts).unwrap();

    let mut document = Config::from_toml(
        "[api]\nserver = \"apstra.example.net\"\n\n[transfer]\nmethod = \"sftp\"\nhost = \"backup.example.net\"\n",
    )
    .unwrap();
    document.api.blueprints = tracked
        .iter()
        .map(|id| Resource::new(*id, Some(format!("{}-name", id))))
        .collect();

    let store = InventoryStore::new(dir.path().join("config.toml"), document);
    store.persist(&store.initial_inventory()).unwrap();

    let script = script
        .map(str::to_string)
        .unwrap_or_else(|| writing_script(&artifacts));
    assemble(
        dir,
        scope,
        script,
        FakeDiscovery::default(),
        FakeRevisions::default(),
        RecordingUploader::default(),
    )
}

/// Build an orchestrator from whatever config and state files are in `dir`.
fn assemble(
    dir: TempDir,
    scope: BackupScope,
    script: String,
    discovery: FakeDiscovery,
    revisions: FakeRevisions,
    uploader: RecordingUploader,
) -> Harness {
    let config_path = dir.path().join("config.toml");
    let document = Config::from_file(&config_path).unwrap();
    let store = InventoryStore::new(&config_path, document.clone());
    let state = StateStore::open(dir.path().join("state.json"), 2).unwrap();

    let invoker = BackupInvoker::new(BackupConfig {
        script_path: PathBuf::from("/bin/sh"),
        parameters: vec!["-c".into(), script.clone(), "aos_backup".into()],
        scope,
        timeout_seconds: 10,
        ..BackupConfig::default()
    });

    let mut transfer_config = document.transfer.clone();
    transfer_config.method = TransferMethod::Sftp;
    transfer_config.retry_attempts = 2;
    transfer_config.retry_delay_seconds = 0;
    let transfer = TransferClient::new(Box::new(uploader.clone()), &transfer_config);

    let settings = OrchestratorSettings {
        polling_interval: Duration::from_millis(100),
        discovery_interval: Duration::from_secs(60),
        removal_threshold: 2,
        api_timeout: Duration::from_secs(5),
        max_parallel: 2,
        scope,
        shutdown_grace: Duration::from_secs(5),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        discovery.clone(),
        revisions.clone(),
        store,
        state,
        invoker,
        transfer,
        settings,
    ));

    Harness {
        dir,
        scope,
        script,
        discovery,
        revisions,
        uploader,
        orchestrator,
    }
}

#[tokio::test]
async fn test_changed_revision_is_backed_up_and_committed() {
    let h = harness(&["A"], BackupScope::PerBlueprint, None);
    h.seed("A", "123").await;
    h.revisions.set("A", "124");

    let report = h.orchestrator.poll_cycle().await;

    match &report.outcomes["A"] {
        Outcome::Committed {
            revision,
            remote_path,
        } => {
            assert_eq!(revision, "124");
            assert!(remote_path.starts_with("/srv/backups/A-name-"));
            assert!(remote_path.ends_with("-A.tar.gz"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.revision("A").await.as_deref(), Some("124"));
    assert_eq!(h.uploads().len(), 1);

    let persisted = StateStore::open(h.dir.path().join("state.json"), 0).unwrap();
    let entry = persisted.get("A").await.unwrap();
    assert_eq!(entry.last_revision, "124");
    assert!(entry.last_change_time.is_some());
}

#[tokio::test]
async fn test_missing_marker_keeps_revision() {
    let h = harness(&["A"], BackupScope::PerBlueprint, Some("echo backup finished"));
    h.seed("A", "123").await;
    h.revisions.set("A", "124");

    let report = h.orchestrator.poll_cycle().await;

    assert!(matches!(report.outcomes["A"], Outcome::BackupFailed(_)));
    assert_eq!(h.revision("A").await.as_deref(), Some("123"));
    assert!(h.uploads().is_empty());
}

#[tokio::test]
async fn test_transfer_failure_is_redetected() {
    let h = harness(&["A"], BackupScope::PerBlueprint, None);
    h.seed("A", "123").await;
    h.revisions.set("A", "124");
    h.uploader.fail.store(true, Ordering::SeqCst);

    let report = h.orchestrator.poll_cycle().await;
    assert!(matches!(report.outcomes["A"], Outcome::TransferFailed(_)));
    assert_eq!(h.revision("A").await.as_deref(), Some("123"));

    h.uploader.fail.store(false, Ordering::SeqCst);
    let report = h.orchestrator.poll_cycle().await;
    assert!(matches!(report.outcomes["A"], Outcome::Committed { .. }));
    assert_eq!(h.revision("A").await.as_deref(), Some("124"));
}

#[tokio::test]
async fn test_uncommitted_backup_is_retried_exactly_once_after_restart() {
    let h = harness(&["A"], BackupScope::PerBlueprint, None);
    h.seed("A", "123").await;
    h.revisions.set("A", "124");
    h.uploader.fail.store(true, Ordering::SeqCst);
    let report = h.orchestrator.poll_cycle().await;
    assert!(matches!(report.outcomes["A"], Outcome::TransferFailed(_)));

    let h = h.restart();
    assert_eq!(h.revision("A").await.as_deref(), Some("123"));

    h.uploader.fail.store(false, Ordering::SeqCst);
    let first = h.orchestrator.poll_cycle().await;
    let second = h.orchestrator.poll_cycle().await;

    assert!(matches!(first.outcomes["A"], Outcome::Committed { .. }));
    assert_eq!(second.outcomes["A"], Outcome::Unchanged);
    assert_eq!(h.uploads().len(), 1);

    let h = h.restart();
    assert_eq!(h.revision("A").await.as_deref(), Some("124"));
    let report = h.orchestrator.poll_cycle().await;
    assert_eq!(report.outcomes["A"], Outcome::Unchanged);
    assert_eq!(h.uploads().len(), 1);
}

#[tokio::test]
async fn test_first_poll_records_baseline_without_backup() {
    let h = harness(&["A"], BackupScope::PerBlueprint, None);
    h.revisions.set("A", "7");

    let report = h.orchestrator.poll_cycle().await;
    assert_eq!(
        report.outcomes["A"],
        Outcome::Baseline {
            revision: "7".into()
        }
    );
    assert_eq!(h.revision("A").await.as_deref(), Some("7"));
    assert!(h.uploads().is_empty());

    let report = h.orchestrator.poll_cycle().await;
    assert_eq!(report.outcomes["A"], Outcome::Unchanged);
    assert!(h.uploads().is_empty());
}

#[tokio::test]
async fn test_poll_failure_changes_nothing() {
    let h = harness(&["A", "B"], BackupScope::PerBlueprint, None);
    h.seed("A", "1").await;
    h.seed("B", "1").await;
    h.revisions.fail("A");
    h.revisions.set("B", "2");

    let report = h.orchestrator.poll_cycle().await;

    assert!(matches!(report.outcomes["A"], Outcome::PollFailed(_)));
    assert!(matches!(report.outcomes["B"], Outcome::Committed { .. }));
    assert_eq!(report.failed(), 1);
    assert_eq!(h.revision("A").await.as_deref(), Some("1"));
    assert_eq!(h.revision("B").await.as_deref(), Some("2"));
}

#[tokio::test]
async fn test_failed_state_write_does_not_advance() {
    let h = harness(&["A"], BackupScope::PerBlueprint, None);
    h.revisions.set("A", "5");
    // A directory where the state file should go makes every write fail
    std::fs::create_dir(h.dir.path().join("state.json")).unwrap();

    let report = h.orchestrator.poll_cycle().await;

    assert!(matches!(report.outcomes["A"], Outcome::CommitFailed(_)));
    assert_eq!(h.revision("A").await, None);
}

#[tokio::test]
async fn test_discovery_adds_blueprint_with_single_write() {
    let h = harness(&["A"], BackupScope::PerBlueprint, None);
    let before = std::fs::read_to_string(h.config_path()).unwrap();
    h.discovery.set(&["A", "B"]);

    let report = h.orchestrator.discovery_cycle().await.unwrap();

    assert_eq!(report.added, vec!["B".to_string()]);
    assert!(report.removed.is_empty());
    assert!(report.inventory_written);
    let ids: Vec<String> = h.orchestrator.inventory().await.ids().map(String::from).collect();
    assert_eq!(ids, vec!["A", "B"]);

    let backup = std::fs::read_to_string(h.dir.path().join("config.toml.bak")).unwrap();
    assert_eq!(backup, before);
    let reloaded = Config::from_file(&h.config_path()).unwrap();
    assert_eq!(reloaded.api.blueprints.len(), 2);
}

#[tokio::test]
async fn test_unchanged_discovery_is_idempotent() {
    let h = harness(&["A"], BackupScope::PerBlueprint, None);
    h.discovery.set(&["A", "B"]);
    h.orchestrator.discovery_cycle().await.unwrap();
    let written = std::fs::read_to_string(h.config_path()).unwrap();

    let report = h.orchestrator.discovery_cycle().await.unwrap();

    assert!(report.added.is_empty());
    assert!(report.removed.is_empty());
    assert!(!report.inventory_written);
    assert_eq!(std::fs::read_to_string(h.config_path()).unwrap(), written);
}

#[tokio::test]
async fn test_failed_discovery_keeps_inventory() {
    let h = harness(&["A", "B"], BackupScope::PerBlueprint, None);
    h.seed("B", "3").await;
    let before = std::fs::read_to_string(h.config_path()).unwrap();
    h.discovery.fail();

    let err = h.orchestrator.discovery_cycle().await.unwrap_err();

    assert!(matches!(err, WatcherError::Api(ApiError::Transient(_))));
    assert_eq!(h.orchestrator.inventory().await.len(), 2);
    assert_eq!(std::fs::read_to_string(h.config_path()).unwrap(), before);
    assert_eq!(h.revision("B").await.as_deref(), Some("3"));
}

#[tokio::test]
async fn test_removal_after_threshold_prunes_state() {
    let h = harness(&["A", "B"], BackupScope::PerBlueprint, None);
    h.seed("A", "1").await;
    h.seed("B", "1").await;
    h.discovery.set(&["A"]);

    let first = h.orchestrator.discovery_cycle().await.unwrap();
    assert_eq!(first.pending_removal, vec!["B".to_string()]);
    assert!(first.removed.is_empty());
    assert!(h.orchestrator.inventory().await.contains("B"));
    assert_eq!(h.revision("B").await.as_deref(), Some("1"));

    let second = h.orchestrator.discovery_cycle().await.unwrap();
    assert_eq!(second.removed, vec!["B".to_string()]);
    assert!(!h.orchestrator.inventory().await.contains("B"));
    assert_eq!(h.revision("B").await, None);
    assert_eq!(h.revision("A").await.as_deref(), Some("1"));

    let persisted = StateStore::open(h.dir.path().join("state.json"), 0).unwrap();
    assert!(persisted.get("B").await.is_none());
}

#[tokio::test]
async fn test_reappearing_blueprint_resets_removal_count() {
    let h = harness(&["A", "B"], BackupScope::PerBlueprint, None);
    h.discovery.set(&["A"]);
    h.orchestrator.discovery_cycle().await.unwrap();

    h.discovery.set(&["A", "B"]);
    h.orchestrator.discovery_cycle().await.unwrap();
    h.discovery.set(&["A"]);
    let report = h.orchestrator.discovery_cycle().await.unwrap();

    assert!(report.removed.is_empty());
    assert!(h.orchestrator.inventory().await.contains("B"));
}

#[tokio::test]
async fn test_full_system_backup_commits_changed_together() {
    let h = harness(&["A", "B", "C"], BackupScope::FullSystem, None);
    h.seed("A", "1").await;
    h.seed("B", "1").await;
    h.seed("C", "1").await;
    h.revisions.set("A", "2");
    h.revisions.set("B", "5");
    h.revisions.set("C", "1");

    let report = h.orchestrator.poll_cycle().await;

    let uploads = h.uploads();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].starts_with("full-system-"));
    assert!(uploads[0].ends_with("-full.tar.gz"));
    assert!(matches!(report.outcomes["A"], Outcome::Committed { .. }));
    assert!(matches!(report.outcomes["B"], Outcome::Committed { .. }));
    assert_eq!(report.outcomes["C"], Outcome::Unchanged);
    assert_eq!(h.revision("A").await.as_deref(), Some("2"));
    assert_eq!(h.revision("B").await.as_deref(), Some("5"));
}

#[tokio::test]
async fn test_full_system_failure_commits_none() {
    let h = harness(&["A", "B"], BackupScope::FullSystem, Some("exit 1"));
    h.seed("A", "1").await;
    h.seed("B", "1").await;
    h.revisions.set("A", "2");
    h.revisions.set("B", "2");

    let report = h.orchestrator.poll_cycle().await;

    assert!(matches!(report.outcomes["A"], Outcome::BackupFailed(_)));
    assert!(matches!(report.outcomes["B"], Outcome::BackupFailed(_)));
    assert_eq!(h.revision("A").await.as_deref(), Some("1"));
    assert_eq!(h.revision("B").await.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_run_discovers_polls_and_stops_on_cancel() {
    let h = harness(&[], BackupScope::PerBlueprint, None);
    h.discovery.set(&["A"]);
    h.revisions.set("A", "9");

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&h.orchestrator).run(cancel.clone()));

    let mut baseline = None;
    for _ in 0..50 {
        baseline = h.revision("A").await;
        if baseline.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(baseline.as_deref(), Some("9"));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("orchestrator did not stop")
        .unwrap();
}
