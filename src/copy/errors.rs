// ============================================================================
// File: packages/ovbackup/src/copy/errors.rs
// ----------------------------------------------------------------------------
// Error types for the disk copy engine
// ============================================================================

use std::io;
use std::path::PathBuf;

/// Errors raised while moving disk data to backup storage
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    /// Reading the source device failed
    #[error("Failed to read {}: {source}", path.display())]
    ReadFailure { path: PathBuf, source: io::Error },

    /// Writing the destination failed
    #[error("Failed to write {}: {source}", path.display())]
    WriteFailure { path: PathBuf, source: io::Error },

    /// The source ended before (or after) its advertised size
    #[error("Copied {copied} of {expected} bytes from {}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        copied: u64,
    },

    /// No device node appeared for an attached disk
    #[error("No device node found for disk {disk_id} under {}", search_dir.display())]
    DeviceNotFound { disk_id: String, search_dir: PathBuf },

    /// Copy stopped on request
    #[error("Copy interrupted")]
    Interrupted,
}

impl CopyError {
    pub(crate) fn read(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::ReadFailure { path, source }
    }

    pub(crate) fn write(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::WriteFailure { path, source }
    }
}

pub type CopyResult<T> = Result<T, CopyError>;
