// ============================================================================
// File: packages/ovbackup/src/platform/types.rs
// ----------------------------------------------------------------------------
// Remote entities and transient resource handles
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

/// Power state of a virtual machine as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmStatus {
    Up,
    Down,
    Migrating,
    Paused,
    PoweringUp,
    PoweringDown,
    ImageLocked,
    Other(String),
}

impl VmStatus {
    /// Map the engine's status string (`up`, `down`, `migrating`, ...)
    pub fn from_api(value: &str) -> Self {
        match value {
            "up" => VmStatus::Up,
            "down" => VmStatus::Down,
            "migrating" => VmStatus::Migrating,
            "paused" => VmStatus::Paused,
            "powering_up" => VmStatus::PoweringUp,
            "powering_down" => VmStatus::PoweringDown,
            "image_locked" => VmStatus::ImageLocked,
            other => VmStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            VmStatus::Up => "up",
            VmStatus::Down => "down",
            VmStatus::Migrating => "migrating",
            VmStatus::Paused => "paused",
            VmStatus::PoweringUp => "powering_up",
            VmStatus::PoweringDown => "powering_down",
            VmStatus::ImageLocked => "image_locked",
            VmStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Virtual machine known to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    /// Engine identifier
    pub id: String,

    /// Display name, unique within the engine
    pub name: String,

    /// Current power state
    pub status: VmStatus,

    /// Identifier of the host currently running the VM
    pub host: Option<String>,

    /// Identifier of the cluster the VM belongs to
    pub cluster: Option<String>,
}

impl VirtualMachine {
    /// Whether both machines currently run on the same hypervisor
    pub fn shares_host_with(&self, other: &VirtualMachine) -> bool {
        matches!((&self.host, &other.host), (Some(a), Some(b)) if a == b)
    }
}

/// Point-in-time snapshot created for a single backup run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub id: String,
    pub vm_id: String,
    pub description: String,
}

/// Attachable disk derived from a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClonedDiskHandle {
    pub id: String,
    pub snapshot_id: String,
    pub vm_id: String,
    pub alias: Option<String>,

    /// Virtual size in bytes, when the engine reports it
    pub provisioned_size: Option<u64>,
}

/// Binding of a cloned disk to the agent VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentHandle {
    pub id: String,
    pub agent_vm_id: String,
    pub disk_id: String,
}

/// Any remote resource whose state can be polled
#[derive(Debug, Clone, Copy)]
pub enum ResourceRef<'a> {
    Vm(&'a str),
    Snapshot(&'a SnapshotHandle),
    Disk(&'a ClonedDiskHandle),
    Attachment(&'a AttachmentHandle),
}

impl fmt::Display for ResourceRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::Vm(id) => write!(f, "VM '{id}'"),
            ResourceRef::Snapshot(s) => write!(f, "snapshot '{}' ({})", s.description, s.id),
            ResourceRef::Disk(d) => write!(f, "disk '{}'", d.id),
            ResourceRef::Attachment(a) => {
                write!(f, "attachment '{}' of disk '{}'", a.id, a.disk_id)
            }
        }
    }
}

/// Polled state of a remote resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus {
    /// Usable for the next step
    Ready,

    /// Still being prepared; carries the engine's state string
    Pending(String),

    /// The engine gave up on the resource
    Failed(String),

    /// The resource does not exist
    Missing,
}

/// Severity of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
    Error,
}

impl EventSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSeverity::Normal => "normal",
            EventSeverity::Warning => "warning",
            EventSeverity::Error => "error",
        }
    }
}
