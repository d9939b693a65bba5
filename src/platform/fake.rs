// ============================================================================
// File: packages/ovbackup/src/platform/fake.rs
// ----------------------------------------------------------------------------
// In-memory engine used by the test suites.
//
// Attaching a disk materializes a "device" file under `device_dir` named the
// way udev names virtio disks (`virtio-<first 20 chars of the disk id>`), so
// the copy path runs against real files.
// ============================================================================

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use super::client::PlatformClient;
use super::errors::{PlatformError, PlatformResult};
use super::types::{
    AttachmentHandle, ClonedDiskHandle, EventSeverity, ResourceRef, ResourceStatus,
    SnapshotHandle, VirtualMachine, VmStatus,
};

/// Knobs for failure injection
#[derive(Debug, Clone)]
pub(crate) struct FakeBehaviour {
    /// Directory where attached disks appear
    pub device_dir: PathBuf,

    /// Size of every disk image in bytes
    pub disk_size: usize,

    /// Disks per VM
    pub disks_per_vm: usize,

    /// Number of polls reporting `locked` before a snapshot becomes ready
    pub snapshot_polls: u32,

    pub snapshot_never_ready: bool,
    pub fail_clone: bool,
    pub fail_attach: bool,
    pub fail_detach: bool,
    pub fail_migrate: bool,
    pub fail_events: bool,

    /// Release calls never answer
    pub hang_release: bool,

    /// Attached devices cannot be read (a directory sits where the node should be)
    pub unreadable_devices: bool,

    /// Only this many devices, in attach order, can be read
    pub readable_devices: Option<usize>,

    /// VM lookups reporting `migrating` on the old host after a migration request
    pub migration_polls: u32,

    /// Migrations never leave the source host
    pub migration_stalls: bool,

    /// Snapshot creations that succeed on the engine but lose their response
    pub lost_snapshot_responses: u32,

    /// Attachments that succeed on the engine but lose their response
    pub lost_attach_responses: u32,
}

impl FakeBehaviour {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
            disk_size: 64 * 1024,
            disks_per_vm: 1,
            snapshot_polls: 1,
            snapshot_never_ready: false,
            fail_clone: false,
            fail_attach: false,
            fail_detach: false,
            fail_migrate: false,
            fail_events: false,
            hang_release: false,
            unreadable_devices: false,
            readable_devices: None,
            migration_polls: 0,
            migration_stalls: false,
            lost_snapshot_responses: 0,
            lost_attach_responses: 0,
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    vms: HashMap<String, VirtualMachine>,
    configurations: HashMap<String, String>,
    snapshots: HashMap<String, (SnapshotHandle, u32)>,
    disks: HashMap<String, ClonedDiskHandle>,
    attachments: HashMap<String, AttachmentHandle>,
    migrating: HashMap<String, Migration>,
    lost_snapshot_responses: u32,
    lost_attach_responses: u32,
    attached_total: usize,
    calls: Vec<String>,
    events: Vec<(EventSeverity, String)>,
    next_id: u64,
}

#[derive(Debug)]
struct Migration {
    host: String,
    cluster: Option<String>,
    remaining: u32,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    /// Advance a pending migration by one observation; true while it runs
    fn observe_migration(&mut self, vm_id: &str, stalls: bool) -> bool {
        let Some(migration) = self.migrating.get_mut(vm_id) else {
            return false;
        };
        if stalls {
            return true;
        }
        if migration.remaining > 0 {
            migration.remaining -= 1;
            return true;
        }
        let done = self.migrating.remove(vm_id);
        if let (Some(done), Some(vm)) = (done, self.vms.get_mut(vm_id)) {
            vm.host = Some(done.host);
            if done.cluster.is_some() {
                vm.cluster = done.cluster;
            }
        }
        false
    }
}

fn lost_response(operation: &'static str) -> PlatformError {
    PlatformError::Transport {
        operation,
        details: "connection reset by peer".to_string(),
    }
}

/// In-memory PlatformClient
#[derive(Debug)]
pub(crate) struct FakePlatform {
    behaviour: FakeBehaviour,
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new(behaviour: FakeBehaviour) -> Self {
        let state = FakeState {
            lost_snapshot_responses: behaviour.lost_snapshot_responses,
            lost_attach_responses: behaviour.lost_attach_responses,
            ..FakeState::default()
        };
        Self {
            behaviour,
            state: Mutex::new(state),
        }
    }

    /// Register a VM running on `host`
    pub fn with_vm(self, name: &str, status: VmStatus, host: &str) -> Self {
        {
            let mut state = self.lock();
            let id = format!("{name}-id");
            state.vms.insert(
                id.clone(),
                VirtualMachine {
                    id,
                    name: name.to_string(),
                    status,
                    host: Some(host.to_string()),
                    cluster: Some("cluster-1".to_string()),
                },
            );
        }
        self
    }

    pub fn with_configuration(self, name: &str, ovf: &str) -> Self {
        self.lock()
            .configurations
            .insert(format!("{name}-id"), ovf.to_string());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake platform lock poisoned")
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    pub fn disk_count(&self) -> usize {
        self.lock().disks.len()
    }

    pub fn attachment_count(&self) -> usize {
        self.lock().attachments.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn events(&self) -> Vec<(EventSeverity, String)> {
        self.lock().events.clone()
    }

    pub fn vm(&self, name: &str) -> Option<VirtualMachine> {
        self.lock().vms.get(&format!("{name}-id")).cloned()
    }

    /// Path where an attached disk shows up
    pub fn device_path(&self, disk_id: &str) -> PathBuf {
        let prefix: String = disk_id.chars().take(20).collect();
        self.behaviour.device_dir.join(format!("virtio-{prefix}"))
    }

    fn disk_ids(vm_id: &str, count: usize) -> Vec<String> {
        (1..=count)
            .map(|n| format!("{n:08x}-d1e6-40e9-8410-{}", vm_id.replace('-', "")))
            .collect()
    }

    fn materialize_device(&self, disk_id: &str, ordinal: usize) -> std::io::Result<()> {
        fs::create_dir_all(&self.behaviour.device_dir)?;
        let path = self.device_path(disk_id);
        let readable = self.behaviour.readable_devices.is_none_or(|limit| ordinal < limit);
        if self.behaviour.unreadable_devices || !readable {
            fs::create_dir_all(path)
        } else {
            let content: Vec<u8> = (0..self.behaviour.disk_size)
                .map(|i| (i % 251) as u8)
                .collect();
            fs::write(path, content)
        }
    }

    fn remove_device(&self, disk_id: &str) {
        let path = self.device_path(disk_id);
        if path.is_dir() {
            let _ = fs::remove_dir_all(path);
        } else {
            let _ = fs::remove_file(path);
        }
    }
}

fn rejected(operation: &'static str, message: &str) -> PlatformError {
    PlatformError::Rejected {
        operation,
        code: 400,
        message: message.to_string(),
    }
}

impl PlatformClient for FakePlatform {
    async fn find_vm(&self, name: &str) -> PlatformResult<Option<VirtualMachine>> {
        Ok(self.lock().vms.values().find(|vm| vm.name == name).cloned())
    }

    async fn get_vm(&self, vm_id: &str) -> PlatformResult<VirtualMachine> {
        let mut state = self.lock();
        let migrating = state.observe_migration(vm_id, self.behaviour.migration_stalls);
        let mut vm = state
            .vms
            .get(vm_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound {
                resource: format!("vms/{vm_id}"),
            })?;
        if migrating {
            vm.status = VmStatus::Migrating;
        }
        Ok(vm)
    }

    async fn vm_configuration(&self, vm_id: &str) -> PlatformResult<Option<String>> {
        Ok(self.lock().configurations.get(vm_id).cloned())
    }

    async fn create_snapshot(
        &self,
        vm_id: &str,
        description: &str,
    ) -> PlatformResult<SnapshotHandle> {
        let mut state = self.lock();
        let handle = SnapshotHandle {
            id: state.next_id("snap"),
            vm_id: vm_id.to_string(),
            description: description.to_string(),
        };
        state.calls.push("create_snapshot".to_string());
        state.snapshots.insert(
            handle.id.clone(),
            (handle.clone(), self.behaviour.snapshot_polls),
        );
        if state.lost_snapshot_responses > 0 {
            state.lost_snapshot_responses -= 1;
            return Err(lost_response("create snapshot"));
        }
        Ok(handle)
    }

    async fn find_snapshot(
        &self,
        vm_id: &str,
        description: &str,
    ) -> PlatformResult<Option<SnapshotHandle>> {
        let mut state = self.lock();
        state.calls.push("find_snapshot".to_string());
        Ok(state
            .snapshots
            .values()
            .map(|(handle, _)| handle)
            .find(|h| h.vm_id == vm_id && h.description == description)
            .cloned())
    }

    async fn clone_disks(
        &self,
        snapshot: &SnapshotHandle,
    ) -> PlatformResult<Vec<ClonedDiskHandle>> {
        let mut state = self.lock();
        state.calls.push("clone_disks".to_string());
        if self.behaviour.fail_clone {
            return Err(rejected("clone disks", "storage domain is read-only"));
        }

        let disks: Vec<ClonedDiskHandle> =
            Self::disk_ids(&snapshot.vm_id, self.behaviour.disks_per_vm)
                .into_iter()
                .map(|id| ClonedDiskHandle {
                    id,
                    snapshot_id: snapshot.id.clone(),
                    vm_id: snapshot.vm_id.clone(),
                    alias: None,
                    provisioned_size: Some(self.behaviour.disk_size as u64),
                })
                .collect();
        for disk in &disks {
            state.disks.insert(disk.id.clone(), disk.clone());
        }
        Ok(disks)
    }

    async fn attach(
        &self,
        disk: &ClonedDiskHandle,
        vm_id: &str,
    ) -> PlatformResult<AttachmentHandle> {
        let (handle, lost, ordinal) = {
            let mut state = self.lock();
            state.calls.push(format!("attach {}", disk.id));
            if self.behaviour.fail_attach {
                return Err(rejected("attach disk", "VM has no free PCI slot"));
            }
            let handle = AttachmentHandle {
                id: state.next_id("att"),
                agent_vm_id: vm_id.to_string(),
                disk_id: disk.id.clone(),
            };
            state.attachments.insert(handle.id.clone(), handle.clone());
            let lost = state.lost_attach_responses > 0;
            if lost {
                state.lost_attach_responses -= 1;
            }
            let ordinal = state.attached_total;
            state.attached_total += 1;
            (handle, lost, ordinal)
        };

        self.materialize_device(&disk.id, ordinal)
            .map_err(|e| rejected("attach disk", &e.to_string()))?;
        if lost {
            return Err(lost_response("attach disk"));
        }
        Ok(handle)
    }

    async fn find_attachment(
        &self,
        disk: &ClonedDiskHandle,
        vm_id: &str,
    ) -> PlatformResult<Option<AttachmentHandle>> {
        let mut state = self.lock();
        state.calls.push(format!("find_attachment {}", disk.id));
        Ok(state
            .attachments
            .values()
            .find(|a| a.agent_vm_id == vm_id && a.disk_id == disk.id)
            .cloned())
    }

    async fn detach(&self, attachment: &AttachmentHandle) -> PlatformResult<()> {
        if self.behaviour.hang_release {
            std::future::pending::<()>().await;
        }
        {
            let mut state = self.lock();
            state.calls.push(format!("detach {}", attachment.id));
            if self.behaviour.fail_detach {
                return Err(rejected("detach disk", "disk is busy"));
            }
            state.attachments.remove(&attachment.id);
        }
        self.remove_device(&attachment.disk_id);
        Ok(())
    }

    async fn delete_disk(&self, disk: &ClonedDiskHandle) -> PlatformResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("delete_disk {}", disk.id));
        state.disks.remove(&disk.id);
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot: &SnapshotHandle) -> PlatformResult<()> {
        if self.behaviour.hang_release {
            std::future::pending::<()>().await;
        }
        let mut state = self.lock();
        state.calls.push("delete_snapshot".to_string());
        state.snapshots.remove(&snapshot.id);
        Ok(())
    }

    async fn migrate(
        &self,
        vm_id: &str,
        host_id: &str,
        cluster_id: Option<&str>,
    ) -> PlatformResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("migrate {vm_id} {host_id}"));
        if self.behaviour.fail_migrate {
            return Err(rejected("migrate VM", "no available host"));
        }
        if !state.vms.contains_key(vm_id) {
            return Err(PlatformError::NotFound {
                resource: format!("vms/{vm_id}"),
            });
        }
        let migration = Migration {
            host: host_id.to_string(),
            cluster: cluster_id.map(str::to_string),
            remaining: self.behaviour.migration_polls,
        };
        state.migrating.insert(vm_id.to_string(), migration);
        Ok(())
    }

    async fn status(&self, resource: ResourceRef<'_>) -> PlatformResult<ResourceStatus> {
        let mut state = self.lock();
        let status = match resource {
            ResourceRef::Vm(vm_id) => {
                if !state.vms.contains_key(vm_id) {
                    ResourceStatus::Missing
                } else if state.observe_migration(vm_id, self.behaviour.migration_stalls) {
                    ResourceStatus::Pending("migrating".to_string())
                } else {
                    ResourceStatus::Ready
                }
            }
            ResourceRef::Snapshot(snapshot) => match state.snapshots.get_mut(&snapshot.id) {
                None => ResourceStatus::Missing,
                Some(_) if self.behaviour.snapshot_never_ready => {
                    ResourceStatus::Pending("locked".to_string())
                }
                Some((_, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    ResourceStatus::Pending("locked".to_string())
                }
                Some(_) => ResourceStatus::Ready,
            },
            ResourceRef::Disk(disk) => {
                if state.disks.contains_key(&disk.id) {
                    ResourceStatus::Ready
                } else {
                    ResourceStatus::Missing
                }
            }
            ResourceRef::Attachment(attachment) => {
                if state.attachments.contains_key(&attachment.id) {
                    ResourceStatus::Ready
                } else {
                    ResourceStatus::Missing
                }
            }
        };
        Ok(status)
    }

    async fn send_event(
        &self,
        _vm_id: &str,
        severity: EventSeverity,
        description: &str,
    ) -> PlatformResult<()> {
        if self.behaviour.fail_events {
            return Err(PlatformError::Transport {
                operation: "send event",
                details: "connection refused".to_string(),
            });
        }
        self.lock().events.push((severity, description.to_string()));
        Ok(())
    }
}
