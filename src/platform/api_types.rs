//! Engine REST API request/response types (API v4, JSON representation)
//!
//! The engine renders numbers and booleans as JSON strings, so the decoders
//! below accept either form.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Reference to another entity, e.g. `"host": {"id": "..."}`
#[derive(Debug, Clone, Deserialize)]
pub struct IdRef {
    pub id: String,
}

/// Outgoing reference to another entity
#[derive(Debug, Clone, Serialize)]
pub struct IdLink<'a> {
    pub id: &'a str,
}

/// Virtual machine
/// API: GET /vms, GET /vms/{id}
#[derive(Debug, Clone, Deserialize)]
pub struct Vm {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub host: Option<IdRef>,
    #[serde(default)]
    pub cluster: Option<IdRef>,

    /// Only present with `all_content=true`
    #[serde(default)]
    pub initialization: Option<Initialization>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Initialization {
    #[serde(default)]
    pub configuration: Option<Configuration>,
}

/// OVF descriptor of a VM
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmList {
    #[serde(default)]
    pub vm: Vec<Vm>,
}

/// Snapshot
/// API: POST /vms/{id}/snapshots, GET /vms/{id}/snapshots/{sid}
#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,

    /// `locked` while being created, `ok` once complete
    #[serde(default)]
    pub snapshot_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotList {
    #[serde(default)]
    pub snapshot: Vec<Snapshot>,
}

/// Request body for snapshot creation
#[derive(Debug, Clone, Serialize)]
pub struct NewSnapshot<'a> {
    pub description: &'a str,
    pub persist_memorystate: bool,
}

/// Disk as seen through a snapshot
/// API: GET /vms/{id}/snapshots/{sid}/disks
#[derive(Debug, Clone, Deserialize)]
pub struct Disk {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub provisioned_size: Option<u64>,

    /// `ok`, `locked` or `illegal`
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskList {
    #[serde(default)]
    pub disk: Vec<Disk>,
}

/// Disk attachment of a VM
/// API: POST /vms/{id}/diskattachments, GET /vms/{id}/diskattachments/{aid}
#[derive(Debug, Clone, Deserialize)]
pub struct DiskAttachment {
    pub id: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub active: Option<bool>,
    #[serde(default)]
    pub disk: Option<IdRef>,
    #[serde(default)]
    pub logical_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskAttachmentList {
    #[serde(default)]
    pub disk_attachment: Vec<DiskAttachment>,
}

/// Disk of a snapshot to attach to another VM
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDiskLink<'a> {
    pub id: &'a str,
    pub snapshot: IdLink<'a>,
}

/// Request body for disk attachment
#[derive(Debug, Clone, Serialize)]
pub struct NewDiskAttachment<'a> {
    pub disk: SnapshotDiskLink<'a>,
    pub active: bool,
    pub bootable: bool,
    pub interface: &'static str,
}

/// Request body for the migrate action
/// API: POST /vms/{id}/migrate
#[derive(Debug, Clone, Serialize)]
pub struct MigrateAction<'a> {
    pub host: IdLink<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<IdLink<'a>>,
}

/// Request body for an external audit event
/// API: POST /events
#[derive(Debug, Clone, Serialize)]
pub struct NewEvent<'a> {
    pub vm: IdLink<'a>,
    pub origin: &'a str,
    pub severity: &'a str,
    pub custom_id: i64,
    pub description: &'a str,
}

/// Engine error response
#[derive(Debug, Clone, Deserialize)]
pub struct Fault {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl Fault {
    /// Most specific message available
    pub fn message(&self) -> Option<String> {
        self.detail.clone().or_else(|| self.reason.clone())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(n)) => Ok(Some(n)),
        Some(NumberOrText::Text(s)) => s.trim().parse().map(Some).map_err(de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolOrText {
    Bool(bool),
    Text(String),
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    match Option::<BoolOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(BoolOrText::Bool(b)) => Ok(Some(b)),
        Some(BoolOrText::Text(s)) => s.trim().parse().map(Some).map_err(de::Error::custom),
    }
}
