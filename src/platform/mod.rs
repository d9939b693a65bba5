// ============================================================================
// File: packages/ovbackup/src/platform/mod.rs
// ----------------------------------------------------------------------------
// Platform client adapter for the virtualization control-plane.
//
// Provides:
// - PlatformClient trait for snapshot, disk, attachment and VM operations
// - OvirtApiClient, the engine REST implementation
// - Bounded polling (wait_ready / wait_released) and per-call retries
// ============================================================================

mod api_client;
mod api_types;
mod client;
mod errors;
mod polling;
mod session;
mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use api_client::{ApiStats, EVENT_ORIGIN, OvirtApiClient};
pub use client::PlatformClient;
pub use errors::{PlatformError, PlatformResult};
pub use polling::{
    Backoff, RetryPolicy, create_with_retry, wait_on_host, wait_ready, wait_released, with_retry,
};
pub use session::{Credentials, Session, TlsSettings};
pub use types::{
    AttachmentHandle, ClonedDiskHandle, EventSeverity, ResourceRef, ResourceStatus,
    SnapshotHandle, VirtualMachine, VmStatus,
};
