// ============================================================================
// File: packages/ovbackup/src/orchestrator/cleanup.rs
// ----------------------------------------------------------------------------
// Release of the transient engine resources a run created.
//
// Order: detach every attachment (and wait until it is gone), delete the
// cloned disks, delete the snapshot. A step is entered only when it has
// something to release. Failures are collected, never raised.
//
// Each resource gets `cleanup_timeout` for its release call and wait
// together. A cancelled run additionally shares one overall deadline.
// ============================================================================

use std::future::Future;
use std::time::{Duration, Instant};

use log::{debug, error};

use super::errors::CleanupError;
use super::settings::BackupSettings;
use super::state::{BackupState, StateMachine};
use crate::platform::{
    AttachmentHandle, ClonedDiskHandle, PlatformClient, PlatformError, PlatformResult,
    ResourceRef, SnapshotHandle, wait_released, with_retry,
};

/// Engine resources owned by a run
#[derive(Debug, Default)]
pub(crate) struct HeldResources {
    pub snapshot: Option<SnapshotHandle>,
    pub disks: Vec<ClonedDiskHandle>,
    pub attachments: Vec<AttachmentHandle>,
}

/// Time allowed for releasing one resource
#[derive(Debug, Clone, Copy)]
struct Budget {
    per_resource: Duration,
    deadline: Option<Instant>,
}

impl Budget {
    fn limit(&self) -> Duration {
        match self.deadline {
            Some(deadline) => self
                .per_resource
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.per_resource,
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    resource: &str,
    call: impl Future<Output = PlatformResult<T>>,
) -> PlatformResult<T> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| {
            Err(PlatformError::Timeout {
                resource: resource.to_string(),
                waited: limit,
            })
        })
}

fn record(
    errors: &mut Vec<CleanupError>,
    step: BackupState,
    resource: String,
    outcome: PlatformResult<()>,
) {
    match outcome {
        Ok(()) => debug!("Released {resource}"),
        Err(e) if e.is_not_found() => debug!("{resource} was already released"),
        Err(source) => {
            let err = CleanupError {
                step,
                resource,
                source,
            };
            error!("{err}");
            errors.push(err);
        }
    }
}

/// Release everything in `held`, driving `machine` through the release states
///
/// With a `deadline` no resource is waited on past it.
pub(crate) async fn release<P: PlatformClient>(
    client: &P,
    settings: &BackupSettings,
    held: &mut HeldResources,
    machine: &mut StateMachine,
    deadline: Option<Instant>,
) -> Vec<CleanupError> {
    let policy = settings.retry_policy().with_conflicts();
    let budget = Budget {
        per_resource: settings.cleanup_timeout,
        deadline,
    };
    let backoff = &settings.backoff;
    let mut errors = Vec::new();

    if !held.attachments.is_empty() {
        machine.enter(BackupState::Detaching);
        for attachment in std::mem::take(&mut held.attachments) {
            let resource = ResourceRef::Attachment(&attachment);
            let name = resource.to_string();
            let limit = budget.limit();
            let outcome = bounded(limit, &name, async {
                with_retry(&policy, "detach disk", || client.detach(&attachment)).await?;
                wait_released(client, resource, limit, backoff).await
            })
            .await;
            record(&mut errors, BackupState::Detaching, name, outcome);
        }
    }

    if !held.disks.is_empty() {
        machine.enter(BackupState::DeletingClone);
        for disk in std::mem::take(&mut held.disks) {
            let name = ResourceRef::Disk(&disk).to_string();
            let outcome = bounded(
                budget.limit(),
                &name,
                with_retry(&policy, "delete disk", || client.delete_disk(&disk)),
            )
            .await;
            record(&mut errors, BackupState::DeletingClone, name, outcome);
        }
    }

    if let Some(snapshot) = held.snapshot.take() {
        machine.enter(BackupState::DeletingSnapshot);
        let resource = ResourceRef::Snapshot(&snapshot);
        let name = resource.to_string();
        let limit = budget.limit();
        let outcome = bounded(limit, &name, async {
            with_retry(&policy, "delete snapshot", || {
                client.delete_snapshot(&snapshot)
            })
            .await?;
            wait_released(client, resource, limit, backoff).await
        })
        .await;
        record(&mut errors, BackupState::DeletingSnapshot, name, outcome);
    }

    errors
}
