// ============================================================================
// File: packages/ovbackup/src/orchestrator/tests.rs
// ----------------------------------------------------------------------------
// End-to-end runs against the in-memory engine
// ============================================================================

use std::fs;
use std::time::Duration;

use assert_fs::TempDir;
use assert_fs::prelude::*;

use super::BackupState::*;
use super::*;
use crate::export::{ExportLink, LinkError};
use crate::platform::Backoff;
use crate::platform::fake::{FakeBehaviour, FakePlatform};
use crate::retention::list_artifacts;

fn fast_settings() -> BackupSettings {
    BackupSettings::new()
        .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5)))
        .with_snapshot_timeout(Duration::from_millis(200))
        .with_disk_timeout(Duration::from_secs(2))
        .with_attach_timeout(Duration::from_secs(2))
        .with_device_timeout(Duration::from_secs(2))
        .with_migrate_timeout(Duration::from_secs(2))
        .with_cleanup_timeout(Duration::from_secs(2))
        .with_chunk_size(4096)
}

struct Harness {
    temp: TempDir,
}

impl Harness {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            temp: TempDir::new().unwrap(),
        }
    }

    fn base(&self) -> std::path::PathBuf {
        self.temp.path().join("backup")
    }

    fn behaviour(&self) -> FakeBehaviour {
        FakeBehaviour::new(self.temp.path().join("by-id"))
    }

    fn orchestrator(&self, behaviour: FakeBehaviour) -> BackupOrchestrator<FakePlatform> {
        self.orchestrator_with(behaviour, fast_settings())
    }

    fn orchestrator_with(
        &self,
        behaviour: FakeBehaviour,
        settings: BackupSettings,
    ) -> BackupOrchestrator<FakePlatform> {
        let platform = FakePlatform::new(behaviour)
            .with_vm("db1", VmStatus::Up, "host-a")
            .with_vm("backupvm", VmStatus::Up, "host-b")
            .with_vm("idle", VmStatus::Down, "host-a")
            .with_configuration("db1", "<ovf:Envelope/>");
        BackupOrchestrator::new(platform, settings)
            .with_device_locator(DeviceLocator::new(self.temp.path().join("by-id")))
    }

    fn request(&self) -> BackupRequest {
        BackupRequest::new("db1", self.base(), "backupvm")
    }
}

fn ts(second: u32) -> BackupTimestamp {
    BackupTimestamp::parse(&format!("202401010000{second:02}")).unwrap()
}

fn count_calls(platform: &FakePlatform, prefix: &str) -> usize {
    platform
        .calls()
        .iter()
        .filter(|call| call.starts_with(prefix))
        .count()
}

/// Files anywhere under `dir` whose names end with `suffix`
fn files_ending_with(dir: &std::path::Path, suffix: &str) -> Vec<std::path::PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(suffix))
        .map(|entry| entry.into_path())
        .collect()
}

fn assert_released(platform: &FakePlatform) {
    assert_eq!(platform.snapshot_count(), 0, "snapshot leaked");
    assert_eq!(platform.disk_count(), 0, "cloned disk leaked");
    assert_eq!(platform.attachment_count(), 0, "attachment leaked");
}

#[tokio::test]
async fn successful_run_publishes_one_artifact() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(harness.behaviour());

    let report = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap();

    let expected = harness.base().join("db1/20240101000001");
    assert_eq!(report.artifact.path, expected);
    assert_eq!(report.artifact.size_bytes, 64 * 1024 + 15);
    assert!(expected.join("db1-db1-id.ovf").is_file());
    let images: Vec<_> = fs::read_dir(&expected)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| !e.file_name().to_string_lossy().ends_with(".ovf"))
        .collect();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].metadata().unwrap().len(), 64 * 1024);

    assert_eq!(
        report.trace,
        vec![
            Init,
            Snapshotting,
            Cloning,
            Attaching,
            Copying,
            Detaching,
            DeletingClone,
            DeletingSnapshot,
            Rotating,
            Done
        ]
    );
    assert!(report.cleanup_errors.is_empty());
    assert_released(orchestrator.client());

    let events = orchestrator.client().events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|(severity, _)| *severity == EventSeverity::Normal));
}

#[tokio::test]
async fn artifact_timestamp_is_not_before_run_start() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(harness.behaviour());
    let started = BackupTimestamp::now();

    let report = orchestrator
        .run(&harness.request(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.artifact.timestamp >= started);
    assert_eq!(list_artifacts(&harness.base().join("db1"), "db1").unwrap().len(), 1);
}

#[tokio::test]
async fn rotation_keeps_three_newest_of_four_runs() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(harness.behaviour());
    let request = harness.request().with_versions_to_keep(3);
    let cancel = CancellationToken::new();

    let mut last = None;
    for second in 1..=4 {
        last = Some(orchestrator.run_at(&request, &cancel, ts(second)).await.unwrap());
    }

    let remaining: Vec<String> = list_artifacts(&harness.base().join("db1"), "db1")
        .unwrap()
        .iter()
        .map(|a| a.timestamp.to_string())
        .collect();
    assert_eq!(
        remaining,
        vec!["20240101000002", "20240101000003", "20240101000004"]
    );

    let last = last.unwrap();
    assert_eq!(last.pruned.len(), 1);
    assert_eq!(last.pruned[0].timestamp, ts(1));
    assert_released(orchestrator.client());
}

#[tokio::test]
async fn snapshot_timeout_releases_snapshot_only() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.snapshot_never_ready = true;
    let orchestrator = harness.orchestrator(behaviour);

    let failure = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.cause,
        BackupError::Timeout { step: Snapshotting, .. }
    ));
    assert_eq!(
        failure.trace,
        vec![Init, Snapshotting, Aborting, DeletingSnapshot, Failed]
    );
    let calls = orchestrator.client().calls();
    assert!(!calls.iter().any(|c| c == "clone_disks"));
    assert!(!calls.iter().any(|c| c.starts_with("attach")));
    assert!(calls.iter().any(|c| c == "delete_snapshot"));
    assert_released(orchestrator.client());

    let events = orchestrator.client().events();
    assert_eq!(events.last().map(|(s, _)| *s), Some(EventSeverity::Error));
}

#[tokio::test]
async fn copy_failure_leaves_nothing_behind() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.unreadable_devices = true;
    let orchestrator = harness.orchestrator(behaviour);

    let failure = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.cause,
        BackupError::Io {
            step: Copying,
            source: CopyError::ReadFailure { .. }
        }
    ));
    assert_eq!(failure.cause.kind(), "io");
    assert!(!harness.base().join("db1/20240101000001").exists());
    assert!(!harness.base().join("db1/.20240101000001.partial").exists());
    assert_eq!(
        failure.trace,
        vec![
            Init,
            Snapshotting,
            Cloning,
            Attaching,
            Copying,
            Aborting,
            Detaching,
            DeletingClone,
            DeletingSnapshot,
            Failed
        ]
    );
    assert!(failure.cleanup_errors.is_empty());
    assert_released(orchestrator.client());
}

#[tokio::test]
async fn clone_failure_skips_detach_and_disk_release() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.fail_clone = true;
    let orchestrator = harness.orchestrator(behaviour);

    let failure = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.cause,
        BackupError::Platform { step: Cloning, .. }
    ));
    assert_eq!(
        failure.trace,
        vec![Init, Snapshotting, Cloning, Aborting, DeletingSnapshot, Failed]
    );
    assert_released(orchestrator.client());
}

#[tokio::test]
async fn attach_failure_releases_clones_and_snapshot() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.fail_attach = true;
    let orchestrator = harness.orchestrator(behaviour);

    let failure = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.cause,
        BackupError::Platform { step: Attaching, .. }
    ));
    assert!(!failure.trace.contains(&Detaching));
    assert!(failure.trace.contains(&DeletingClone));
    assert_released(orchestrator.client());
}

#[tokio::test]
async fn unknown_vm_creates_nothing() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(harness.behaviour());
    let request = BackupRequest::new("ghost", harness.base(), "backupvm");

    let failure = orchestrator
        .run_at(&request, &CancellationToken::new(), ts(1))
        .await
        .unwrap_err();

    assert!(matches!(failure.cause, BackupError::NotFound { kind: "VM", .. }));
    assert_eq!(failure.trace, vec![Init, Aborting, Failed]);
    assert!(orchestrator.client().calls().is_empty());
    assert!(orchestrator.client().events().is_empty());
}

#[tokio::test]
async fn unknown_agent_is_not_found() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(harness.behaviour());
    let request = BackupRequest::new("db1", harness.base(), "ghost");

    let failure = orchestrator
        .run_at(&request, &CancellationToken::new(), ts(1))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.cause,
        BackupError::NotFound { kind: "agent VM", .. }
    ));
}

#[tokio::test]
async fn stopped_vm_is_skipped() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(harness.behaviour());
    let request = BackupRequest::new("idle", harness.base(), "backupvm");

    let failure = orchestrator
        .run_at(&request, &CancellationToken::new(), ts(1))
        .await
        .unwrap_err();

    assert!(matches!(failure.cause, BackupError::NotRunning { .. }));
    assert_eq!(failure.cause.kind(), "not-running");
    assert!(orchestrator.client().calls().is_empty());
}

#[tokio::test]
async fn agent_cannot_back_itself_up() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(harness.behaviour());
    let request = BackupRequest::new("db1", harness.base(), "db1");

    let failure = orchestrator
        .run_at(&request, &CancellationToken::new(), ts(1))
        .await
        .unwrap_err();

    assert!(matches!(failure.cause, BackupError::InvalidRequest { .. }));
}

#[tokio::test]
async fn existing_artifact_is_refused_before_snapshot() {
    let harness = Harness::new();
    harness
        .temp
        .child("backup/db1/20240101000001/disk")
        .write_str("previous")
        .unwrap();
    let orchestrator = harness.orchestrator(harness.behaviour());

    let failure = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap_err();

    assert!(matches!(failure.cause, BackupError::ArtifactExists { .. }));
    assert!(orchestrator.client().calls().is_empty());
    assert_eq!(
        fs::read_to_string(harness.base().join("db1/20240101000001/disk")).unwrap(),
        "previous"
    );
}

#[tokio::test]
async fn export_reference_is_created() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(harness.behaviour());
    let request = harness.request().with_export_domain("export");

    let report = orchestrator
        .run_at(&request, &CancellationToken::new(), ts(1))
        .await
        .unwrap();

    assert!(report.trace.ends_with(&[Rotating, Linking, Done]));
    assert!(matches!(
        report.export,
        Some(ExportLink::HardLinks { files: 2, .. })
    ));
    assert!(harness.base().join("export/db1/20240101000001").is_dir());
}

#[tokio::test]
async fn export_failure_keeps_backup() {
    let harness = Harness::new();
    harness.temp.child("backup/export").write_str("in the way").unwrap();
    let orchestrator = harness.orchestrator(harness.behaviour());
    let request = harness.request().with_export_domain("export");

    let report = orchestrator
        .run_at(&request, &CancellationToken::new(), ts(1))
        .await
        .unwrap();

    assert!(matches!(report.link_error, Some(LinkError::NotWritable { .. })));
    assert!(report.export.is_none());
    assert!(report.artifact.path.is_dir());
}

#[tokio::test]
async fn detach_failure_is_secondary() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.fail_detach = true;
    let orchestrator = harness.orchestrator(behaviour);

    let report = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap();

    assert_eq!(report.cleanup_errors.len(), 1);
    assert_eq!(report.cleanup_errors[0].step, Detaching);
    assert_eq!(orchestrator.client().snapshot_count(), 0);
    assert_eq!(orchestrator.client().disk_count(), 0);
}

#[tokio::test]
async fn cancellation_during_snapshot_wait_releases_snapshot() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.snapshot_never_ready = true;
    let orchestrator = harness.orchestrator(behaviour);
    let cancel = CancellationToken::new();

    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        })
    };
    let failure = orchestrator
        .run_at(&harness.request(), &cancel, ts(1))
        .await
        .unwrap_err();
    trigger.await.unwrap();

    assert!(matches!(failure.cause, BackupError::Cancelled));
    assert!(failure.trace.contains(&DeletingSnapshot));
    assert_released(orchestrator.client());
}

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(harness.behaviour());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let failure = orchestrator
        .run_at(&harness.request(), &cancel, ts(1))
        .await
        .unwrap_err();

    assert!(matches!(failure.cause, BackupError::Cancelled));
    assert!(orchestrator.client().calls().is_empty());
}

#[tokio::test]
async fn agent_is_migrated_to_target_host() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.migration_polls = 2;
    let orchestrator = harness.orchestrator(behaviour);
    let request = harness.request().with_migrate_agent(true);

    let report = orchestrator
        .run_at(&request, &CancellationToken::new(), ts(1))
        .await
        .unwrap();

    assert_eq!(report.trace[1], Migrating);
    assert!(orchestrator
        .client()
        .calls()
        .contains(&"migrate backupvm-id host-a".to_string()));
    assert_eq!(
        orchestrator.client().vm("backupvm").and_then(|vm| vm.host),
        Some("host-a".to_string())
    );
}

#[tokio::test]
async fn failed_migration_does_not_abort() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.fail_migrate = true;
    let orchestrator = harness.orchestrator(behaviour);
    let request = harness.request().with_migrate_agent(true);

    let report = orchestrator
        .run_at(&request, &CancellationToken::new(), ts(1))
        .await
        .unwrap();

    assert!(report.trace.contains(&Migrating));
    assert_eq!(report.trace.last(), Some(&Done));
}

#[tokio::test]
async fn every_disk_of_the_snapshot_is_copied() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.disks_per_vm = 3;
    behaviour.disk_size = 10_000;
    let orchestrator = harness.orchestrator(behaviour);

    let report = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap();

    let files = fs::read_dir(&report.artifact.path).unwrap().count();
    assert_eq!(files, 4);
    assert_eq!(report.artifact.size_bytes, 3 * 10_000 + 15);
    assert_released(orchestrator.client());
}

#[tokio::test]
async fn event_failures_are_not_fatal() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.fail_events = true;
    let orchestrator = harness.orchestrator(behaviour);

    let report = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await;

    assert!(report.is_ok());
}

#[tokio::test]
async fn lost_snapshot_response_is_adopted_not_repeated() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.lost_snapshot_responses = 1;
    let orchestrator = harness.orchestrator(behaviour);

    let report = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap();

    let platform = orchestrator.client();
    assert_eq!(count_calls(platform, "create_snapshot"), 1);
    assert_eq!(count_calls(platform, "find_snapshot"), 1);
    assert_eq!(report.trace.last(), Some(&Done));
    assert_released(platform);
}

#[tokio::test]
async fn unconfirmed_snapshot_is_released_when_retries_run_out() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.lost_snapshot_responses = 1;
    let orchestrator =
        harness.orchestrator_with(behaviour, fast_settings().with_retry_attempts(1));

    let failure = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.cause,
        BackupError::Platform { step: Snapshotting, .. }
    ));
    assert!(failure.trace.contains(&DeletingSnapshot));
    assert_released(orchestrator.client());
}

#[tokio::test]
async fn lost_attach_response_is_adopted_not_repeated() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.lost_attach_responses = 1;
    let orchestrator = harness.orchestrator(behaviour);

    let report = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap();

    let platform = orchestrator.client();
    assert_eq!(count_calls(platform, "attach "), 1);
    assert_eq!(count_calls(platform, "find_attachment "), 1);
    assert!(report.cleanup_errors.is_empty());
    assert_released(platform);
}

#[tokio::test]
async fn rotation_drops_export_references() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(harness.behaviour());
    let request = harness
        .request()
        .with_versions_to_keep(1)
        .with_export_domain("export");
    let cancel = CancellationToken::new();

    for second in 1..=3 {
        orchestrator.run_at(&request, &cancel, ts(second)).await.unwrap();
    }

    let exported: Vec<String> = fs::read_dir(harness.base().join("export/db1"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(exported, vec!["20240101000003"]);
    assert_eq!(list_artifacts(&harness.base().join("db1"), "db1").unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_run_bounds_its_cleanup() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.snapshot_never_ready = true;
    behaviour.hang_release = true;
    let settings = fast_settings()
        .with_snapshot_timeout(Duration::from_secs(60))
        .with_cleanup_timeout(Duration::from_secs(600))
        .with_cancel_cleanup_timeout(Duration::from_millis(50));
    let orchestrator = harness.orchestrator_with(behaviour, settings);
    let cancel = CancellationToken::new();

    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        })
    };
    let failure = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator.run_at(&harness.request(), &cancel, ts(1)),
    )
    .await
    .expect("cleanup of a cancelled run must be bounded")
    .unwrap_err();
    trigger.await.unwrap();

    assert!(matches!(failure.cause, BackupError::Cancelled));
    assert_eq!(failure.cleanup_errors.len(), 1);
    assert_eq!(failure.cleanup_errors[0].step, DeletingSnapshot);
    assert_eq!(failure.trace.last(), Some(&Failed));
}

#[tokio::test]
async fn copy_failure_after_partial_data_leaves_nothing_behind() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.disks_per_vm = 3;
    behaviour.disk_size = 10_000;
    behaviour.readable_devices = Some(2);
    let orchestrator = harness.orchestrator(behaviour);

    let failure = orchestrator
        .run_at(&harness.request(), &CancellationToken::new(), ts(1))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.cause,
        BackupError::Io { step: Copying, .. }
    ));
    let db1 = harness.base().join("db1");
    assert!(!db1.join("20240101000001").exists());
    assert!(!db1.join(".20240101000001.partial").exists());
    assert!(files_ending_with(&harness.base(), ".part").is_empty());
    assert_eq!(count_calls(orchestrator.client(), "detach "), 3);
    assert_released(orchestrator.client());
}

#[tokio::test]
async fn stalled_migration_is_not_fatal() {
    let harness = Harness::new();
    let mut behaviour = harness.behaviour();
    behaviour.migration_stalls = true;
    let settings = fast_settings().with_migrate_timeout(Duration::from_millis(30));
    let orchestrator = harness.orchestrator_with(behaviour, settings);
    let request = harness.request().with_migrate_agent(true);

    let report = orchestrator
        .run_at(&request, &CancellationToken::new(), ts(1))
        .await
        .unwrap();

    assert!(report.trace.contains(&Migrating));
    assert_eq!(report.trace.last(), Some(&Done));
    assert_eq!(
        orchestrator.client().vm("backupvm").and_then(|vm| vm.host),
        Some("host-b".to_string())
    );
}
