// ============================================================================
// File: packages/ovbackup/src/orchestrator/mod.rs
// ----------------------------------------------------------------------------
// Backup workflow: snapshot, clone, attach, copy, release, rotate, export.
//
// A run walks the forward states until the first fatal error, then always
// releases what it created before reporting. Rotation and export only follow
// a published artifact.
// ============================================================================

mod cleanup;
mod errors;
mod request;
mod settings;
mod state;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use errors::{BackupError, BackupFailure, BackupReport, CleanupError};
pub use request::{BackupRequest, DEFAULT_VERSIONS_TO_KEEP};
pub use settings::BackupSettings;
pub use state::BackupState;

use self::cleanup::HeldResources;
use self::state::StateMachine;
use crate::artifact::{
    BackupArtifact, BackupTimestamp, artifact_path, ovf_file_name, staging_path, vm_dir,
};
use crate::copy::{CopyError, DeviceLocator, DiskCopyEngine};
use crate::export::ExportLinker;
use crate::platform::{
    self, AttachmentHandle, ClonedDiskHandle, EventSeverity, PlatformClient, PlatformError,
    ResourceRef, RetryPolicy, SnapshotHandle, VirtualMachine, VmStatus, create_with_retry,
    with_retry,
};
use crate::retention::RetentionManager;

/// Drives backup runs against one engine
#[derive(Debug)]
pub struct BackupOrchestrator<P> {
    client: P,
    settings: BackupSettings,
    locator: DeviceLocator,
}

impl<P: PlatformClient> BackupOrchestrator<P> {
    pub fn new(client: P, settings: BackupSettings) -> Self {
        Self {
            client,
            settings,
            locator: DeviceLocator::default(),
        }
    }

    /// Look for attached disks somewhere other than `/dev/disk/by-id`
    pub fn with_device_locator(mut self, locator: DeviceLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn client(&self) -> &P {
        &self.client
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    /// Back up `request.vm_name` now
    pub async fn run(
        &self,
        request: &BackupRequest,
        cancel: &CancellationToken,
    ) -> Result<BackupReport, BackupFailure> {
        self.run_at(request, cancel, BackupTimestamp::now()).await
    }

    /// Back up `request.vm_name` under an explicit timestamp
    pub async fn run_at(
        &self,
        request: &BackupRequest,
        cancel: &CancellationToken,
        timestamp: BackupTimestamp,
    ) -> Result<BackupReport, BackupFailure> {
        let run = BackupRun {
            client: &self.client,
            settings: &self.settings,
            locator: &self.locator,
            request,
            cancel,
            timestamp,
            retry: self.settings.retry_policy(),
            machine: StateMachine::new(&request.vm_name),
            held: HeldResources::default(),
            target: None,
            announced: false,
        };
        run.execute().await
    }
}

/// An attached disk and the local node it appeared as
#[derive(Debug)]
struct AttachedDisk {
    disk_id: String,
    device: PathBuf,
}

struct BackupRun<'a, P> {
    client: &'a P,
    settings: &'a BackupSettings,
    locator: &'a DeviceLocator,
    request: &'a BackupRequest,
    cancel: &'a CancellationToken,
    timestamp: BackupTimestamp,
    retry: RetryPolicy,
    machine: StateMachine,
    held: HeldResources,
    target: Option<VirtualMachine>,
    announced: bool,
}

impl<P: PlatformClient> BackupRun<'_, P> {
    fn vm(&self) -> &str {
        &self.request.vm_name
    }

    async fn execute(mut self) -> Result<BackupReport, BackupFailure> {
        let forward = match self.forward().await {
            Ok(artifact) => Ok(artifact),
            Err(cause) => {
                match &cause {
                    BackupError::NotRunning { .. } => info!("{}: {cause}", self.vm()),
                    _ => error!("{}: {cause}", self.vm()),
                }
                self.machine.enter(BackupState::Aborting);
                Err(cause)
            }
        };

        let deadline = self.cancel.is_cancelled().then(|| {
            warn!(
                "{}: cleaning up within {}s",
                self.vm(),
                self.settings.cancel_cleanup_timeout.as_secs()
            );
            Instant::now() + self.settings.cancel_cleanup_timeout
        });
        let cleanup_errors = cleanup::release(
            self.client,
            self.settings,
            &mut self.held,
            &mut self.machine,
            deadline,
        )
        .await;

        match forward {
            Ok(artifact) => Ok(self.finish(artifact, cleanup_errors).await),
            Err(cause) => Err(self.fail(cause, cleanup_errors).await),
        }
    }

    async fn forward(&mut self) -> Result<BackupArtifact, BackupError> {
        self.check_cancelled()?;
        let (target, agent) = self.init().await?;
        self.target = Some(target.clone());
        self.notify(
            EventSeverity::Normal,
            format!("Backup of VM '{}' started", target.name),
        )
        .await;
        self.announced = true;

        if self.request.migrate_agent {
            self.migrate_agent(&target, &agent).await;
        }
        self.check_cancelled()?;

        let snapshot = self.snapshot(&target).await?;
        self.check_cancelled()?;
        let disks = self.clone_disks(&snapshot).await?;
        self.check_cancelled()?;
        let devices = self.attach(&disks, &agent).await?;
        self.check_cancelled()?;
        self.copy(&target, &devices).await
    }

    fn check_cancelled(&self) -> Result<(), BackupError> {
        if self.cancel.is_cancelled() {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `work` unless the run is cancelled first
    async fn guarded<T>(
        &self,
        work: impl Future<Output = Result<T, BackupError>>,
    ) -> Result<T, BackupError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BackupError::Cancelled),
            outcome = work => outcome,
        }
    }

    async fn await_ready(
        &self,
        step: BackupState,
        resource: ResourceRef<'_>,
        timeout: Duration,
    ) -> Result<(), BackupError> {
        self.guarded(async {
            platform::wait_ready(self.client, resource, timeout, &self.settings.backoff)
                .await
                .map_err(BackupError::platform(step))
        })
        .await
    }

    async fn notify(&self, severity: EventSeverity, description: String) {
        let Some(target) = &self.target else {
            return;
        };
        if let Err(e) = self
            .client
            .send_event(&target.id, severity, &description)
            .await
        {
            warn!("{}: could not send {} event: {e}", self.vm(), severity.as_str());
        }
    }

    async fn lookup(&self, kind: &'static str, name: &str) -> Result<VirtualMachine, BackupError> {
        with_retry(&self.retry, "look up VM", || self.client.find_vm(name))
            .await
            .map_err(BackupError::platform(BackupState::Init))?
            .ok_or_else(|| BackupError::NotFound {
                kind,
                name: name.to_string(),
            })
    }

    async fn init(&self) -> Result<(VirtualMachine, VirtualMachine), BackupError> {
        self.request.validate()?;

        let target = self.lookup("VM", &self.request.vm_name).await?;
        let agent = self.lookup("agent VM", &self.request.agent_vm_name).await?;
        if agent.id == target.id {
            return Err(BackupError::InvalidRequest {
                reason: format!("VM '{}' cannot back itself up", target.name),
            });
        }
        if target.status != VmStatus::Up {
            return Err(BackupError::NotRunning {
                vm: target.name,
                status: target.status,
            });
        }

        let path = artifact_path(self.request.base_dir(), self.vm(), self.timestamp);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BackupError::ArtifactExists { path });
        }

        info!(
            "{}: backing up VM {} with agent '{}' ({})",
            self.vm(),
            target.id,
            agent.name,
            agent.id
        );
        Ok((target, agent))
    }

    /// Move the agent next to the target; never fatal
    async fn migrate_agent(&mut self, target: &VirtualMachine, agent: &VirtualMachine) {
        let Some(host) = target.host.as_deref() else {
            warn!("{}: host of VM is unknown, not migrating agent", self.vm());
            return;
        };
        if target.shares_host_with(agent) {
            info!("{}: agent VM already runs on host {host}", self.vm());
            return;
        }

        self.machine.enter(BackupState::Migrating);
        let requested = with_retry(&self.retry, "migrate agent VM", || {
            self.client.migrate(&agent.id, host, target.cluster.as_deref())
        })
        .await;
        if let Err(e) = requested {
            warn!("{}: could not migrate agent VM '{}': {e}", self.vm(), agent.name);
            return;
        }

        let settled = self
            .guarded(async {
                platform::wait_on_host(
                    self.client,
                    &agent.id,
                    host,
                    self.settings.migrate_timeout,
                    &self.settings.backoff,
                )
                .await
                .map_err(BackupError::platform(BackupState::Migrating))
            })
            .await;
        match settled {
            Ok(()) => info!("{}: agent VM migrated to host {host}", self.vm()),
            Err(e) => warn!("{}: migration of agent VM did not settle: {e}", self.vm()),
        }
    }

    async fn snapshot(&mut self, target: &VirtualMachine) -> Result<SnapshotHandle, BackupError> {
        self.machine.enter(BackupState::Snapshotting);
        let description = format!("{}-backup-{}", target.name, Uuid::new_v4());
        let created = create_with_retry(
            &self.retry,
            "create snapshot",
            || self.client.create_snapshot(&target.id, &description),
            || self.client.find_snapshot(&target.id, &description),
        )
        .await;
        let snapshot = match created {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if e.is_transient() {
                    self.held.snapshot = self
                        .recover("snapshot", self.client.find_snapshot(&target.id, &description))
                        .await;
                }
                return Err(BackupError::platform(BackupState::Snapshotting)(e));
            }
        };

        info!("{}: created snapshot {}", self.vm(), snapshot.id);
        self.held.snapshot = Some(snapshot.clone());
        self.await_ready(
            BackupState::Snapshotting,
            ResourceRef::Snapshot(&snapshot),
            self.settings.snapshot_timeout,
        )
        .await?;
        Ok(snapshot)
    }

    async fn clone_disks(
        &mut self,
        snapshot: &SnapshotHandle,
    ) -> Result<Vec<ClonedDiskHandle>, BackupError> {
        self.machine.enter(BackupState::Cloning);
        let disks = with_retry(&self.retry, "clone disks", || {
            self.client.clone_disks(snapshot)
        })
        .await
        .map_err(BackupError::platform(BackupState::Cloning))?;

        if disks.is_empty() {
            return Err(BackupError::Platform {
                step: BackupState::Cloning,
                source: PlatformError::Malformed {
                    operation: "clone disks",
                    details: format!("snapshot {} has no disks", snapshot.id),
                },
            });
        }

        self.held.disks = disks.clone();
        for disk in &disks {
            self.await_ready(
                BackupState::Cloning,
                ResourceRef::Disk(disk),
                self.settings.disk_timeout,
            )
            .await?;
        }
        Ok(disks)
    }

    async fn attach(
        &mut self,
        disks: &[ClonedDiskHandle],
        agent: &VirtualMachine,
    ) -> Result<Vec<AttachedDisk>, BackupError> {
        self.machine.enter(BackupState::Attaching);
        let mut devices = Vec::with_capacity(disks.len());

        for disk in disks {
            let attachment = self.attach_one(disk, agent).await?;
            self.held.attachments.push(attachment.clone());

            self.await_ready(
                BackupState::Attaching,
                ResourceRef::Attachment(&attachment),
                self.settings.attach_timeout,
            )
            .await?;

            let device = self
                .guarded(async {
                    self.locator
                        .wait_visible(
                            &disk.id,
                            self.settings.device_timeout,
                            &self.settings.backoff,
                        )
                        .await
                        .map_err(BackupError::io(BackupState::Attaching))
                })
                .await?;
            info!("{}: disk {} attached as {}", self.vm(), disk.id, device.display());
            devices.push(AttachedDisk {
                disk_id: disk.id.clone(),
                device,
            });
        }
        Ok(devices)
    }

    async fn attach_one(
        &mut self,
        disk: &ClonedDiskHandle,
        agent: &VirtualMachine,
    ) -> Result<AttachmentHandle, BackupError> {
        let created = create_with_retry(
            &self.retry,
            "attach disk",
            || self.client.attach(disk, &agent.id),
            || self.client.find_attachment(disk, &agent.id),
        )
        .await;
        match created {
            Ok(attachment) => Ok(attachment),
            Err(e) => {
                if e.is_transient() {
                    let orphan = self
                        .recover("attachment", self.client.find_attachment(disk, &agent.id))
                        .await;
                    self.held.attachments.extend(orphan);
                }
                Err(BackupError::platform(BackupState::Attaching)(e))
            }
        }
    }

    /// Look once more for a resource whose creation was never confirmed
    async fn recover<T: std::fmt::Debug>(
        &self,
        kind: &str,
        lookup: impl Future<Output = Result<Option<T>, PlatformError>>,
    ) -> Option<T> {
        match lookup.await {
            Ok(Some(found)) => {
                warn!("{}: releasing unconfirmed {kind} {found:?}", self.vm());
                Some(found)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("{}: cannot check for an unconfirmed {kind}: {e}", self.vm());
                None
            }
        }
    }

    async fn copy(
        &mut self,
        target: &VirtualMachine,
        devices: &[AttachedDisk],
    ) -> Result<BackupArtifact, BackupError> {
        self.machine.enter(BackupState::Copying);
        let base = self.request.base_dir();
        let staging = staging_path(base, self.vm(), self.timestamp);
        let final_path = artifact_path(base, self.vm(), self.timestamp);

        let published = match self.copy_into(&staging, target, devices).await {
            Ok(size) => tokio::fs::rename(&staging, &final_path)
                .await
                .map(|()| size)
                .map_err(|source| write_failure(&final_path, source)),
            Err(e) => Err(e),
        };

        match published {
            Ok(size) => {
                info!(
                    "{}: backup written to {} ({size} bytes)",
                    self.vm(),
                    final_path.display()
                );
                Ok(BackupArtifact::new(self.vm(), self.timestamp, final_path, size))
            }
            Err(e) => {
                if let Err(rm) = remove_if_present(&staging).await {
                    warn!("{}: could not remove {}: {rm}", self.vm(), staging.display());
                }
                Err(e)
            }
        }
    }

    async fn copy_into(
        &self,
        staging: &Path,
        target: &VirtualMachine,
        devices: &[AttachedDisk],
    ) -> Result<u64, BackupError> {
        remove_if_present(staging)
            .await
            .map_err(|source| write_failure(staging, source))?;
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|source| write_failure(staging, source))?;

        let mut total = self.save_configuration(staging, target).await?;

        let engine = DiskCopyEngine::new().with_chunk_size(self.settings.chunk_size);
        let watcher = {
            let engine = engine.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                engine.cancel();
            })
        };

        let mut outcome = Ok(());
        for attached in devices {
            let dest = staging.join(&attached.disk_id);
            match engine.spawn_copy(attached.device.clone(), dest).await {
                Ok(copied) => total += copied.bytes,
                Err(e) => {
                    outcome = Err(BackupError::io(BackupState::Copying)(e));
                    break;
                }
            }
        }
        watcher.abort();

        outcome.map(|()| total)
    }

    /// Write the VM's OVF next to the images; returns the bytes written
    async fn save_configuration(
        &self,
        staging: &Path,
        target: &VirtualMachine,
    ) -> Result<u64, BackupError> {
        let configuration = with_retry(&self.retry, "read VM configuration", || {
            self.client.vm_configuration(&target.id)
        })
        .await;

        match configuration {
            Ok(Some(ovf)) => {
                let path = staging.join(ovf_file_name(&target.name, &target.id));
                tokio::fs::write(&path, ovf.as_bytes())
                    .await
                    .map_err(|source| write_failure(&path, source))?;
                Ok(ovf.len() as u64)
            }
            Ok(None) => {
                info!("{}: no configuration available, skipping OVF", self.vm());
                Ok(0)
            }
            Err(e) => {
                warn!("{}: could not read configuration, skipping OVF: {e}", self.vm());
                Ok(0)
            }
        }
    }

    async fn finish(
        mut self,
        artifact: BackupArtifact,
        cleanup_errors: Vec<CleanupError>,
    ) -> BackupReport {
        self.machine.enter(BackupState::Rotating);
        let linker = self
            .request
            .export_domain
            .as_deref()
            .map(|domain| ExportLinker::new(self.request.base_dir(), domain));
        let mut retention = RetentionManager::new(self.request.versions_to_keep);
        if let Some(linker) = &linker {
            retention = retention.with_export(linker.clone());
        }
        let rotation = retention.apply(&artifact, &vm_dir(self.request.base_dir(), self.vm()));

        let mut export = None;
        let mut link_error = None;
        if let Some(linker) = &linker {
            self.machine.enter(BackupState::Linking);
            match linker.link(&artifact) {
                Ok(link) => export = Some(link),
                Err(e) => {
                    warn!("{}: export failed: {e}", self.vm());
                    link_error = Some(e);
                }
            }
        }

        self.machine.enter(BackupState::Done);
        self.notify(
            EventSeverity::Normal,
            format!(
                "Backup of VM '{}' completed: {}",
                self.vm(),
                artifact.path.display()
            ),
        )
        .await;

        BackupReport {
            artifact,
            export,
            link_error,
            pruned: rotation.removed,
            rotation_errors: rotation.failures,
            cleanup_errors,
            trace: self.machine.into_trace(),
        }
    }

    async fn fail(
        mut self,
        cause: BackupError,
        cleanup_errors: Vec<CleanupError>,
    ) -> BackupFailure {
        self.machine.enter(BackupState::Failed);
        if self.announced {
            self.notify(
                EventSeverity::Error,
                format!("Backup of VM '{}' failed: {cause}", self.vm()),
            )
            .await;
        }
        BackupFailure {
            cause,
            cleanup_errors,
            trace: self.machine.into_trace(),
        }
    }
}

fn write_failure(path: &Path, source: std::io::Error) -> BackupError {
    BackupError::Io {
        step: BackupState::Copying,
        source: CopyError::WriteFailure {
            path: path.to_path_buf(),
            source,
        },
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
