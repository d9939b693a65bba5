// ============================================================================
// File: packages/ovbackup/src/export.rs
// ----------------------------------------------------------------------------
// References from an export domain to finished backups.
//
// A reference is a directory of hard links mirroring the artifact. When the
// export path lives on another filesystem a `<timestamp>.ref` marker holding
// the artifact path is written instead. References are named after the
// artifact directory and are removed when rotation removes the artifact.
// ============================================================================

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::artifact::BackupArtifact;

/// Export linking failures; never fatal to a backup
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The export location cannot be written
    #[error("Export path {} is not writable: {source}", path.display())]
    NotWritable { path: PathBuf, source: io::Error },

    /// A reference with the same name points at a different backup
    #[error("{} already references a different backup", path.display())]
    Collision { path: PathBuf },
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Reference created by [`ExportLinker::link`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportLink {
    /// Directory of hard links
    HardLinks { path: PathBuf, files: usize },

    /// Marker file naming the artifact
    Marker { path: PathBuf },
}

impl ExportLink {
    pub fn path(&self) -> &Path {
        match self {
            Self::HardLinks { path, .. } | Self::Marker { path } => path,
        }
    }
}

/// Creates export references under `<base_dir>/<export_domain>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportLinker {
    root: PathBuf,
}

impl ExportLinker {
    pub fn new(base_dir: &Path, export_domain: &str) -> Self {
        Self {
            root: base_dir.join(export_domain),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn reference_paths(&self, artifact: &BackupArtifact) -> (PathBuf, PathBuf, PathBuf) {
        let vm_dir = self.root.join(&artifact.vm_name);
        let name = artifact
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| artifact.timestamp.to_string());
        let target = vm_dir.join(&name);
        let marker = vm_dir.join(format!("{name}.ref"));
        (vm_dir, target, marker)
    }

    /// Create or refresh the reference to `artifact`
    pub fn link(&self, artifact: &BackupArtifact) -> LinkResult<ExportLink> {
        let (vm_dir, target, marker) = self.reference_paths(artifact);
        fs::create_dir_all(&vm_dir).map_err(not_writable(&vm_dir))?;

        if marker.exists() {
            if !marker_names(&marker, &artifact.path) {
                return Err(LinkError::Collision { path: marker });
            }
            debug!("Refreshing export marker {}", marker.display());
            return write_marker(&marker, &artifact.path);
        }

        if target.exists() && !mirrors(&target, &artifact.path) {
            return Err(LinkError::Collision { path: target });
        }

        match link_files(&artifact.path, &target) {
            Ok(files) => {
                info!("Exported {} as {}", artifact.path.display(), target.display());
                Ok(ExportLink::HardLinks {
                    path: target,
                    files,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                debug!(
                    "{} is on another filesystem, writing marker instead",
                    vm_dir.display()
                );
                if let Err(e) = fs::remove_dir_all(&target) {
                    warn!("Cannot remove partial links in {}: {e}", target.display());
                }
                write_marker(&marker, &artifact.path)
            }
            Err(source) => Err(LinkError::NotWritable {
                path: target,
                source,
            }),
        }
    }

    /// Remove the references to `artifact`; returns how many were removed
    ///
    /// A marker naming some other backup is left alone.
    pub fn unlink(&self, artifact: &BackupArtifact) -> LinkResult<usize> {
        let (_, target, marker) = self.reference_paths(artifact);
        let mut removed = 0;

        match fs::remove_dir_all(&target) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(LinkError::NotWritable {
                    path: target,
                    source,
                });
            }
        }

        if marker.exists() {
            if marker_names(&marker, &artifact.path) {
                fs::remove_file(&marker).map_err(not_writable(&marker))?;
                removed += 1;
            } else {
                debug!("{} names another backup, keeping it", marker.display());
            }
        }

        if removed > 0 {
            info!("Removed export reference to {}", artifact.path.display());
        }
        Ok(removed)
    }
}

fn not_writable(path: &Path) -> impl FnOnce(io::Error) -> LinkError + '_ {
    move |source| LinkError::NotWritable {
        path: path.to_path_buf(),
        source,
    }
}

fn write_marker(marker: &Path, artifact: &Path) -> LinkResult<ExportLink> {
    let content = format!("{}\n", artifact.display());
    fs::write(marker, content).map_err(not_writable(marker))?;
    info!("Exported {} as marker {}", artifact.display(), marker.display());
    Ok(ExportLink::Marker {
        path: marker.to_path_buf(),
    })
}

fn marker_names(marker: &Path, artifact: &Path) -> bool {
    fs::read_to_string(marker)
        .map(|content| Path::new(content.trim_end()) == artifact)
        .unwrap_or(false)
}

/// Entries directly inside `dir`
fn children(dir: &Path) -> walkdir::IntoIter {
    WalkDir::new(dir).min_depth(1).max_depth(1).into_iter()
}

/// Every entry of `target` is a hard link to the same-named file in `source`
fn mirrors(target: &Path, source: &Path) -> bool {
    children(target).all(|entry| {
        entry.is_ok_and(|entry| same_file(entry.path(), &source.join(entry.file_name())))
    })
}

fn link_files(source: &Path, target: &Path) -> io::Result<usize> {
    fs::create_dir_all(target)?;
    let mut files = 0;
    for entry in children(source) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let link = target.join(entry.file_name());
        if !same_file(&link, entry.path()) {
            fs::hard_link(entry.path(), &link)?;
        }
        files += 1;
    }
    Ok(files)
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
