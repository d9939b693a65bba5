// ============================================================================
// File: packages/ovbackup/src/platform/client.rs
// ----------------------------------------------------------------------------
// PlatformClient trait definition
// ============================================================================

use std::future::Future;

use super::errors::PlatformResult;
use super::types::{
    AttachmentHandle, ClonedDiskHandle, EventSeverity, ResourceRef, ResourceStatus,
    SnapshotHandle, VirtualMachine,
};

/// Control-plane operations needed by a backup run
///
/// Creation calls return as soon as the engine accepted the request; callers
/// poll [`PlatformClient::status`] (usually through
/// [`wait_ready`](super::wait_ready)) until the resource is usable.
///
/// Release calls (`detach`, `delete_disk`, `delete_snapshot`) treat a resource
/// that is already gone as success. `find_snapshot` and `find_attachment`
/// recover handles whose creation response was lost.
pub trait PlatformClient: Send + Sync {
    /// Look up a VM by its exact name
    fn find_vm(
        &self,
        name: &str,
    ) -> impl Future<Output = PlatformResult<Option<VirtualMachine>>> + Send;

    /// Fetch the current state of a VM
    fn get_vm(&self, vm_id: &str) -> impl Future<Output = PlatformResult<VirtualMachine>> + Send;

    /// Fetch the VM's OVF descriptor, if the engine exposes one
    fn vm_configuration(
        &self,
        vm_id: &str,
    ) -> impl Future<Output = PlatformResult<Option<String>>> + Send;

    /// Request a disk-only snapshot of the VM
    fn create_snapshot(
        &self,
        vm_id: &str,
        description: &str,
    ) -> impl Future<Output = PlatformResult<SnapshotHandle>> + Send;

    /// Look up a snapshot of the VM by its description
    fn find_snapshot(
        &self,
        vm_id: &str,
        description: &str,
    ) -> impl Future<Output = PlatformResult<Option<SnapshotHandle>>> + Send;

    /// Derive attachable disks from a completed snapshot
    fn clone_disks(
        &self,
        snapshot: &SnapshotHandle,
    ) -> impl Future<Output = PlatformResult<Vec<ClonedDiskHandle>>> + Send;

    /// Attach a cloned disk to a VM
    fn attach(
        &self,
        disk: &ClonedDiskHandle,
        vm_id: &str,
    ) -> impl Future<Output = PlatformResult<AttachmentHandle>> + Send;

    /// Look up the attachment of a cloned disk to a VM
    fn find_attachment(
        &self,
        disk: &ClonedDiskHandle,
        vm_id: &str,
    ) -> impl Future<Output = PlatformResult<Option<AttachmentHandle>>> + Send;

    fn detach(
        &self,
        attachment: &AttachmentHandle,
    ) -> impl Future<Output = PlatformResult<()>> + Send;

    fn delete_disk(
        &self,
        disk: &ClonedDiskHandle,
    ) -> impl Future<Output = PlatformResult<()>> + Send;

    fn delete_snapshot(
        &self,
        snapshot: &SnapshotHandle,
    ) -> impl Future<Output = PlatformResult<()>> + Send;

    /// Live-migrate a VM to the given host (and cluster, when known)
    fn migrate(
        &self,
        vm_id: &str,
        host_id: &str,
        cluster_id: Option<&str>,
    ) -> impl Future<Output = PlatformResult<()>> + Send;

    /// Poll the state of a resource
    ///
    /// For VMs, `Ready` means the VM is not in a transitional state such as
    /// `migrating`.
    fn status(
        &self,
        resource: ResourceRef<'_>,
    ) -> impl Future<Output = PlatformResult<ResourceStatus>> + Send;

    /// Record an audit event attached to a VM
    fn send_event(
        &self,
        vm_id: &str,
        severity: EventSeverity,
        description: &str,
    ) -> impl Future<Output = PlatformResult<()>> + Send;
}
