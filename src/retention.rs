// ============================================================================
// File: packages/ovbackup/src/retention.rs
// ----------------------------------------------------------------------------
// Keep-count rotation of backup artifacts
// ============================================================================

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::artifact::{BackupArtifact, BackupTimestamp, disk_usage};
use crate::export::{ExportLinker, LinkError};

/// An artifact that could not be removed
#[derive(Debug, thiserror::Error)]
#[error("Failed to remove {}: {source}", path.display())]
pub struct RetentionError {
    pub path: PathBuf,
    pub source: io::Error,
}

/// Artifacts beyond the `max(keep, 1)` newest, oldest first
///
/// Ordering is by timestamp, ties broken by path, so the newest artifact is
/// never returned.
pub fn prune(existing: &[BackupArtifact], keep: usize) -> Vec<BackupArtifact> {
    let keep = keep.max(1);
    let mut ordered = existing.to_vec();
    ordered.sort_by(|a, b| (a.timestamp, &a.path).cmp(&(b.timestamp, &b.path)));
    let excess = ordered.len().saturating_sub(keep);
    ordered.truncate(excess);
    ordered
}

/// Enumerate the finished artifacts of `vm_name` under `vm_dir`
///
/// Entries whose names are not timestamps (staging directories, OS clutter)
/// are ignored. A missing directory yields no artifacts.
pub fn list_artifacts(vm_dir: &Path, vm_name: &str) -> io::Result<Vec<BackupArtifact>> {
    let entries = match fs::read_dir(vm_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(timestamp) = name.to_str().and_then(BackupTimestamp::parse) else {
            continue;
        };
        let path = entry.path();
        let size_bytes = disk_usage(&path).unwrap_or(0);
        artifacts.push(BackupArtifact::new(vm_name, timestamp, path, size_bytes));
    }
    artifacts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(artifacts)
}

/// Result of a rotation pass
#[derive(Debug, Default)]
pub struct RetentionOutcome {
    pub removed: Vec<BackupArtifact>,
    pub failures: Vec<RetentionError>,
}

/// Applies the keep-count policy to one VM directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionManager {
    keep: usize,
    export: Option<ExportLinker>,
}

impl RetentionManager {
    pub fn new(keep: usize) -> Self {
        Self { keep, export: None }
    }

    /// Also drop the export references of every removed artifact
    pub fn with_export(mut self, linker: ExportLinker) -> Self {
        self.export = Some(linker);
        self
    }

    pub fn keep(&self) -> usize {
        self.keep.max(1)
    }

    /// Remove artifacts beyond the keep count, sparing `current`
    pub fn apply(&self, current: &BackupArtifact, vm_dir: &Path) -> RetentionOutcome {
        let mut outcome = RetentionOutcome::default();

        let existing = match list_artifacts(vm_dir, &current.vm_name) {
            Ok(existing) => existing,
            Err(source) => {
                warn!("Cannot list backups in {}: {source}", vm_dir.display());
                outcome.failures.push(RetentionError {
                    path: vm_dir.to_path_buf(),
                    source,
                });
                return outcome;
            }
        };

        for artifact in prune(&existing, self.keep) {
            if artifact.path == current.path {
                continue;
            }
            match remove_artifact(&artifact.path) {
                Ok(()) => {
                    info!("Removed old backup {}", artifact.path.display());
                    if let Some(failure) = self.unlink_export(&artifact) {
                        outcome.failures.push(failure);
                    }
                    outcome.removed.push(artifact);
                }
                Err(source) => {
                    let err = RetentionError {
                        path: artifact.path,
                        source,
                    };
                    warn!("{err}");
                    outcome.failures.push(err);
                }
            }
        }
        outcome
    }
}

impl RetentionManager {
    fn unlink_export(&self, artifact: &BackupArtifact) -> Option<RetentionError> {
        let linker = self.export.as_ref()?;
        match linker.unlink(artifact) {
            Ok(_) => None,
            Err(LinkError::NotWritable { path, source }) => {
                let err = RetentionError { path, source };
                warn!("{err}");
                Some(err)
            }
            Err(e) => {
                warn!("{e}");
                None
            }
        }
    }
}

fn remove_artifact(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}
