// ============================================================================
// File: packages/ovbackup/src/orchestrator/errors.rs
// ----------------------------------------------------------------------------
// Outcome types of a backup run
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use super::state::BackupState;
use crate::artifact::BackupArtifact;
use crate::copy::CopyError;
use crate::export::{ExportLink, LinkError};
use crate::platform::{PlatformError, VmStatus};
use crate::retention::RetentionError;

/// Fatal error of a backup run
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Target or agent VM unknown to the engine
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Request cannot be executed as given
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Target VM is not up; nothing to back up
    #[error("VM '{vm}' is not running (status: {status})")]
    NotRunning { vm: String, status: VmStatus },

    /// A backup with this timestamp is already on disk
    #[error("Backup {} already exists", path.display())]
    ArtifactExists { path: PathBuf },

    /// The engine rejected or failed a step
    #[error("{step} failed: {source}")]
    Platform {
        step: BackupState,
        source: PlatformError,
    },

    /// A resource did not become ready in time
    #[error("{step} timed out: {resource} not ready after {}s", waited.as_secs())]
    Timeout {
        step: BackupState,
        resource: String,
        waited: Duration,
    },

    /// Moving data to backup storage failed
    #[error("{step} failed: {source}")]
    Io { step: BackupState, source: CopyError },

    #[error("Backup cancelled")]
    Cancelled,
}

impl BackupError {
    pub(crate) fn platform(step: BackupState) -> impl FnOnce(PlatformError) -> Self {
        move |source| match source {
            PlatformError::Timeout { resource, waited } => Self::Timeout {
                step,
                resource,
                waited,
            },
            source => Self::Platform { step, source },
        }
    }

    pub(crate) fn io(step: BackupState) -> impl FnOnce(CopyError) -> Self {
        move |source| match source {
            CopyError::Interrupted => Self::Cancelled,
            source => Self::Io { step, source },
        }
    }

    /// Short machine-readable category for status lines
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not-found",
            Self::InvalidRequest { .. } => "invalid-request",
            Self::NotRunning { .. } => "not-running",
            Self::ArtifactExists { .. } => "artifact-exists",
            Self::Platform { .. } => "platform",
            Self::Timeout { .. } => "timeout",
            Self::Io { .. } => "io",
            Self::Cancelled => "cancelled",
        }
    }

    /// Step the error was raised in, when it belongs to one
    pub fn step(&self) -> Option<BackupState> {
        match self {
            Self::Platform { step, .. } | Self::Timeout { step, .. } | Self::Io { step, .. } => {
                Some(*step)
            }
            Self::NotFound { .. }
            | Self::InvalidRequest { .. }
            | Self::NotRunning { .. }
            | Self::ArtifactExists { .. } => Some(BackupState::Init),
            Self::Cancelled => None,
        }
    }
}

/// A transient resource that could not be released
#[derive(Debug, thiserror::Error)]
#[error("{step}: could not release {resource}: {source}")]
pub struct CleanupError {
    pub step: BackupState,
    pub resource: String,
    pub source: PlatformError,
}

/// Successful run
#[derive(Debug)]
pub struct BackupReport {
    pub artifact: BackupArtifact,

    /// Reference in the export domain, when requested and created
    pub export: Option<ExportLink>,

    /// Export linking failure; the backup itself stands
    pub link_error: Option<LinkError>,

    /// Artifacts removed by rotation, oldest first
    pub pruned: Vec<BackupArtifact>,

    pub rotation_errors: Vec<RetentionError>,
    pub cleanup_errors: Vec<CleanupError>,
    pub trace: Vec<BackupState>,
}

/// Failed run: the first fatal error plus release diagnostics
#[derive(Debug, thiserror::Error)]
#[error("{cause}")]
pub struct BackupFailure {
    pub cause: BackupError,
    pub cleanup_errors: Vec<CleanupError>,
    pub trace: Vec<BackupState>,
}
