// ============================================================================
// File: packages/ovbackup/src/platform/api_client.rs
// ----------------------------------------------------------------------------
// Engine REST API client implementing PlatformClient.
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::{debug, info, warn};
use native_tls::{Certificate, TlsConnector};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::timeout;

use super::api_types::{
    Disk, DiskAttachment, DiskAttachmentList, DiskList, Fault, IdLink, MigrateAction,
    NewDiskAttachment, NewEvent, NewSnapshot, Snapshot, SnapshotDiskLink, SnapshotList, Vm,
    VmList,
};
use super::client::PlatformClient;
use super::errors::{PlatformError, PlatformResult};
use super::session::{Session, TlsSettings};
use super::types::{
    AttachmentHandle, ClonedDiskHandle, EventSeverity, ResourceRef, ResourceStatus,
    SnapshotHandle, VirtualMachine, VmStatus,
};

type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Origin recorded on audit events
pub const EVENT_ORIGIN: &str = "ovirt-backup";

/// API call statistics
#[derive(Debug, Default)]
pub struct ApiStats {
    /// Total API calls made
    api_calls: AtomicU64,

    /// Calls answered with an error status or not answered at all
    failed_calls: AtomicU64,

    /// Response time of the last call in microseconds
    last_response_time_us: AtomicU64,
}

impl ApiStats {
    pub fn api_calls(&self) -> u64 {
        self.api_calls.load(Ordering::Relaxed)
    }

    pub fn failed_calls(&self) -> u64 {
        self.failed_calls.load(Ordering::Relaxed)
    }

    pub fn last_response_time(&self) -> Duration {
        Duration::from_micros(self.last_response_time_us.load(Ordering::Relaxed))
    }
}

/// Engine REST API client
#[derive(Debug, Clone)]
pub struct OvirtApiClient {
    http_client: HttpClient,

    session: Session,

    /// Upper bound for a single request/response exchange
    request_timeout: Duration,

    /// Source of unique `custom_id`s for audit events
    event_ids: Arc<AtomicI64>,

    stats: Arc<ApiStats>,
}

impl OvirtApiClient {
    /// Create a client bound to an authenticated session
    ///
    /// Both `http` and `https` endpoints are served; certificate checks
    /// follow `session.tls`.
    pub fn new(session: Session, request_timeout: Duration) -> PlatformResult<Self> {
        let connector = https_connector(&session.tls)?;
        let http_client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            http_client,
            session,
            request_timeout,
            event_ids: Arc::new(AtomicI64::new(chrono::Utc::now().timestamp())),
            stats: Arc::new(ApiStats::default()),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stats(&self) -> &ApiStats {
        &self.stats
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> PlatformResult<Bytes> {
        let start_time = Instant::now();
        let uri = self.session.resolve(path);
        debug!("{method} {uri}");

        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header(AUTHORIZATION, self.session.credentials.basic_auth())
            .header(ACCEPT, "application/json")
            .header("Version", "4");
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| PlatformError::Transport {
                operation,
                details: format!("Failed to build request for {uri}: {e}"),
            })?;

        self.stats.api_calls.fetch_add(1, Ordering::Relaxed);

        let response = timeout(self.request_timeout, self.http_client.request(request))
            .await
            .map_err(|_| {
                self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                PlatformError::Transport {
                    operation,
                    details: format!(
                        "no response within {}s",
                        self.request_timeout.as_secs()
                    ),
                }
            })?
            .map_err(|e| {
                self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                PlatformError::Transport {
                    operation,
                    details: e.to_string(),
                }
            })?;

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| PlatformError::Transport {
                operation,
                details: format!("Failed to read response body: {e}"),
            })?
            .to_bytes();

        let elapsed_us = start_time.elapsed().as_micros() as u64;
        self.stats
            .last_response_time_us
            .store(elapsed_us, Ordering::Relaxed);

        if status.is_success() {
            return Ok(body_bytes);
        }

        self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);

        if status == StatusCode::NOT_FOUND {
            return Err(PlatformError::NotFound {
                resource: path.to_string(),
            });
        }

        let message = serde_json::from_slice::<Fault>(&body_bytes)
            .ok()
            .and_then(|fault| fault.message())
            .unwrap_or_else(|| String::from_utf8_lossy(&body_bytes).trim().to_string());

        Err(PlatformError::Rejected {
            operation,
            code: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
    ) -> PlatformResult<T> {
        let body = self.send(operation, Method::GET, path, None).await?;
        decode(operation, &body)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        payload: &B,
    ) -> PlatformResult<T> {
        let body = self
            .send(operation, Method::POST, path, Some(encode(operation, payload)?))
            .await?;
        decode(operation, &body)
    }

    async fn post_action<B: Serialize>(
        &self,
        operation: &'static str,
        path: &str,
        payload: &B,
    ) -> PlatformResult<()> {
        self.send(operation, Method::POST, path, Some(encode(operation, payload)?))
            .await
            .map(|_| ())
    }

    async fn delete(&self, operation: &'static str, path: &str) -> PlatformResult<()> {
        match self.send(operation, Method::DELETE, path, None).await {
            Ok(_) => Ok(()),
            Err(PlatformError::NotFound { resource }) => {
                debug!("{operation}: {resource} is already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn snapshot_disks(&self, snapshot_path: &str) -> PlatformResult<Vec<Disk>> {
        let list: DiskList = self
            .get_json("list snapshot disks", &format!("{snapshot_path}/disks"))
            .await?;
        Ok(list.disk)
    }

    async fn adopt_snapshot(
        &self,
        vm_id: &str,
        description: &str,
    ) -> PlatformResult<Option<Snapshot>> {
        let list: SnapshotList = self
            .get_json("list snapshots", &format!("vms/{vm_id}/snapshots"))
            .await?;
        Ok(list
            .snapshot
            .into_iter()
            .find(|s| s.description.as_deref() == Some(description)))
    }

    async fn adopt_attachment(
        &self,
        agent_vm_id: &str,
        disk_id: &str,
    ) -> PlatformResult<Option<DiskAttachment>> {
        let list: DiskAttachmentList = self
            .get_json(
                "list disk attachments",
                &format!("vms/{agent_vm_id}/diskattachments"),
            )
            .await?;
        Ok(list
            .disk_attachment
            .into_iter()
            .find(|a| a.disk.as_ref().is_some_and(|d| d.id == disk_id)))
    }
}

fn https_connector(tls: &TlsSettings) -> PlatformResult<HttpsConnector<HttpConnector>> {
    let tls_error = |details: String| PlatformError::Tls { details };

    let mut builder = TlsConnector::builder();
    if tls.insecure {
        warn!("Engine certificate checks are disabled");
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    if let Some(ca_file) = &tls.ca_file {
        let pem = std::fs::read(ca_file)
            .map_err(|e| tls_error(format!("Cannot read {}: {e}", ca_file.display())))?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|e| tls_error(format!("{}: {e}", ca_file.display())))?;
        builder.add_root_certificate(certificate);
    }
    let connector = builder.build().map_err(|e| tls_error(e.to_string()))?;

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    Ok(HttpsConnector::from((
        http,
        tokio_native_tls::TlsConnector::from(connector),
    )))
}

fn encode<B: Serialize>(operation: &'static str, payload: &B) -> PlatformResult<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| PlatformError::Malformed {
        operation,
        details: format!("Failed to serialize request body: {e}"),
    })
}

fn decode<T: DeserializeOwned>(operation: &'static str, body: &[u8]) -> PlatformResult<T> {
    serde_json::from_slice(body).map_err(|e| PlatformError::Malformed {
        operation,
        details: e.to_string(),
    })
}

fn vm_from_api(vm: Vm) -> VirtualMachine {
    VirtualMachine {
        id: vm.id,
        name: vm.name,
        status: VmStatus::from_api(vm.status.as_deref().unwrap_or("unknown")),
        host: vm.host.map(|h| h.id),
        cluster: vm.cluster.map(|c| c.id),
    }
}

fn snapshot_path(snapshot: &SnapshotHandle) -> String {
    format!("vms/{}/snapshots/{}", snapshot.vm_id, snapshot.id)
}

fn snapshot_state(snapshot: &Snapshot) -> ResourceStatus {
    match snapshot.snapshot_status.as_deref() {
        Some("ok") => ResourceStatus::Ready,
        Some("locked") | None => {
            ResourceStatus::Pending(snapshot.snapshot_status.clone().unwrap_or_default())
        }
        Some(other) => ResourceStatus::Failed(other.to_string()),
    }
}

fn disk_state(disk: &Disk) -> ResourceStatus {
    match disk.status.as_deref() {
        Some("ok") | None => ResourceStatus::Ready,
        Some("locked") => ResourceStatus::Pending("locked".to_string()),
        Some(other) => ResourceStatus::Failed(other.to_string()),
    }
}

fn missing_on_not_found(
    result: PlatformResult<ResourceStatus>,
) -> PlatformResult<ResourceStatus> {
    match result {
        Err(PlatformError::NotFound { .. }) => Ok(ResourceStatus::Missing),
        other => other,
    }
}

impl PlatformClient for OvirtApiClient {
    async fn find_vm(&self, name: &str) -> PlatformResult<Option<VirtualMachine>> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("search", &format!("name={name}"))
            .finish();
        let list: VmList = self.get_json("search VM", &format!("vms?{query}")).await?;

        Ok(list
            .vm
            .into_iter()
            .find(|vm| vm.name == name)
            .map(vm_from_api))
    }

    async fn get_vm(&self, vm_id: &str) -> PlatformResult<VirtualMachine> {
        let vm: Vm = self.get_json("get VM", &format!("vms/{vm_id}")).await?;
        Ok(vm_from_api(vm))
    }

    async fn vm_configuration(&self, vm_id: &str) -> PlatformResult<Option<String>> {
        let vm: Vm = self
            .get_json("get VM configuration", &format!("vms/{vm_id}?all_content=true"))
            .await?;
        Ok(vm
            .initialization
            .and_then(|init| init.configuration)
            .and_then(|config| config.data))
    }

    async fn create_snapshot(
        &self,
        vm_id: &str,
        description: &str,
    ) -> PlatformResult<SnapshotHandle> {
        let body = NewSnapshot {
            description,
            persist_memorystate: false,
        };
        let path = format!("vms/{vm_id}/snapshots");

        let snapshot = match self
            .post_json::<_, Snapshot>("create snapshot", &path, &body)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_conflict() => match self.adopt_snapshot(vm_id, description).await? {
                Some(existing) => {
                    info!(
                        "Snapshot '{description}' already exists, reusing '{}'",
                        existing.id
                    );
                    existing
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        };

        Ok(SnapshotHandle {
            id: snapshot.id,
            vm_id: vm_id.to_string(),
            description: description.to_string(),
        })
    }

    async fn find_snapshot(
        &self,
        vm_id: &str,
        description: &str,
    ) -> PlatformResult<Option<SnapshotHandle>> {
        Ok(self
            .adopt_snapshot(vm_id, description)
            .await?
            .map(|snapshot| SnapshotHandle {
                id: snapshot.id,
                vm_id: vm_id.to_string(),
                description: description.to_string(),
            }))
    }

    async fn clone_disks(
        &self,
        snapshot: &SnapshotHandle,
    ) -> PlatformResult<Vec<ClonedDiskHandle>> {
        let disks = self.snapshot_disks(&snapshot_path(snapshot)).await?;

        Ok(disks
            .into_iter()
            .map(|disk| ClonedDiskHandle {
                id: disk.id,
                snapshot_id: snapshot.id.clone(),
                vm_id: snapshot.vm_id.clone(),
                alias: disk.alias,
                provisioned_size: disk.provisioned_size,
            })
            .collect())
    }

    async fn attach(
        &self,
        disk: &ClonedDiskHandle,
        vm_id: &str,
    ) -> PlatformResult<AttachmentHandle> {
        let body = NewDiskAttachment {
            disk: SnapshotDiskLink {
                id: &disk.id,
                snapshot: IdLink {
                    id: &disk.snapshot_id,
                },
            },
            active: true,
            bootable: false,
            interface: "virtio",
        };
        let path = format!("vms/{vm_id}/diskattachments");

        let attachment = match self
            .post_json::<_, DiskAttachment>("attach disk", &path, &body)
            .await
        {
            Ok(attachment) => attachment,
            Err(e) if e.is_conflict() => match self.adopt_attachment(vm_id, &disk.id).await? {
                Some(existing) => {
                    info!("Disk '{}' is already attached as '{}'", disk.id, existing.id);
                    existing
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        };

        Ok(AttachmentHandle {
            id: attachment.id,
            agent_vm_id: vm_id.to_string(),
            disk_id: disk.id.clone(),
        })
    }

    async fn find_attachment(
        &self,
        disk: &ClonedDiskHandle,
        vm_id: &str,
    ) -> PlatformResult<Option<AttachmentHandle>> {
        Ok(self
            .adopt_attachment(vm_id, &disk.id)
            .await?
            .map(|attachment| AttachmentHandle {
                id: attachment.id,
                agent_vm_id: vm_id.to_string(),
                disk_id: disk.id.clone(),
            }))
    }

    async fn detach(&self, attachment: &AttachmentHandle) -> PlatformResult<()> {
        self.delete(
            "detach disk",
            &format!(
                "vms/{}/diskattachments/{}",
                attachment.agent_vm_id, attachment.id
            ),
        )
        .await
    }

    async fn delete_disk(&self, disk: &ClonedDiskHandle) -> PlatformResult<()> {
        // Snapshot disks are views of the snapshot; removing the snapshot
        // releases them. Deleting the disk id would delete the VM's own disk.
        debug!(
            "Disk '{}' is released together with snapshot '{}'",
            disk.id, disk.snapshot_id
        );
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot: &SnapshotHandle) -> PlatformResult<()> {
        self.delete("remove snapshot", &snapshot_path(snapshot)).await
    }

    async fn migrate(
        &self,
        vm_id: &str,
        host_id: &str,
        cluster_id: Option<&str>,
    ) -> PlatformResult<()> {
        let body = MigrateAction {
            host: IdLink { id: host_id },
            cluster: cluster_id.map(|id| IdLink { id }),
        };
        self.post_action("migrate VM", &format!("vms/{vm_id}/migrate"), &body)
            .await
    }

    async fn status(&self, resource: ResourceRef<'_>) -> PlatformResult<ResourceStatus> {
        let status = match resource {
            ResourceRef::Vm(vm_id) => self.get_vm(vm_id).await.map(|vm| match vm.status {
                VmStatus::Migrating
                | VmStatus::PoweringUp
                | VmStatus::PoweringDown
                | VmStatus::ImageLocked => ResourceStatus::Pending(vm.status.to_string()),
                _ => ResourceStatus::Ready,
            }),
            ResourceRef::Snapshot(snapshot) => self
                .get_json::<Snapshot>("get snapshot", &snapshot_path(snapshot))
                .await
                .map(|s| snapshot_state(&s)),
            ResourceRef::Disk(disk) => {
                let path = format!("vms/{}/snapshots/{}", disk.vm_id, disk.snapshot_id);
                self.snapshot_disks(&path).await.map(|disks| {
                    disks
                        .iter()
                        .find(|d| d.id == disk.id)
                        .map(disk_state)
                        .unwrap_or(ResourceStatus::Missing)
                })
            }
            ResourceRef::Attachment(attachment) => self
                .get_json::<DiskAttachment>(
                    "get disk attachment",
                    &format!(
                        "vms/{}/diskattachments/{}",
                        attachment.agent_vm_id, attachment.id
                    ),
                )
                .await
                .map(|a| match a.active {
                    Some(false) => ResourceStatus::Pending("inactive".to_string()),
                    _ => ResourceStatus::Ready,
                }),
        };

        missing_on_not_found(status)
    }

    async fn send_event(
        &self,
        vm_id: &str,
        severity: EventSeverity,
        description: &str,
    ) -> PlatformResult<()> {
        let body = NewEvent {
            vm: IdLink { id: vm_id },
            origin: EVENT_ORIGIN,
            severity: severity.as_str(),
            custom_id: self.event_ids.fetch_add(1, Ordering::Relaxed),
            description,
        };
        self.post_action("send event", "events", &body).await
    }
}
