// ============================================================================
// File: packages/ovbackup/src/artifact.rs
// ----------------------------------------------------------------------------
// Backup artifacts and their on-disk layout.
//
// Layout:
//   <base_dir>/<vm_name>/<timestamp>/            finished backup
//   <base_dir>/<vm_name>/.<timestamp>.partial/   backup being written
// ============================================================================

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime, Timelike};
use walkdir::WalkDir;

/// Directory name format; lexical order equals chronological order
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

const TIMESTAMP_LEN: usize = 14;

/// Minute-precision names written by older backup scripts
const LEGACY_TIMESTAMP_LEN: usize = 12;

/// Local wall-clock time of a backup, second precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupTimestamp(NaiveDateTime);

impl BackupTimestamp {
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    pub fn from_datetime(at: NaiveDateTime) -> Self {
        Self(at.with_nanosecond(0).unwrap_or(at))
    }

    /// Parse a directory name of 14 digits, or 12 (seconds taken as zero)
    pub fn parse(name: &str) -> Option<Self> {
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let full = match name.len() {
            TIMESTAMP_LEN => name.to_string(),
            LEGACY_TIMESTAMP_LEN => format!("{name}00"),
            _ => return None,
        };
        NaiveDateTime::parse_from_str(&full, TIMESTAMP_FORMAT)
            .ok()
            .map(Self)
    }

    pub fn datetime(&self) -> NaiveDateTime {
        self.0
    }
}

impl fmt::Display for BackupTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

/// A finished backup of one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub vm_name: String,
    pub timestamp: BackupTimestamp,
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl BackupArtifact {
    pub fn new(
        vm_name: impl Into<String>,
        timestamp: BackupTimestamp,
        path: impl Into<PathBuf>,
        size_bytes: u64,
    ) -> Self {
        Self {
            vm_name: vm_name.into(),
            timestamp,
            path: path.into(),
            size_bytes,
        }
    }
}

pub fn vm_dir(base_dir: &Path, vm_name: &str) -> PathBuf {
    base_dir.join(vm_name)
}

pub fn artifact_path(base_dir: &Path, vm_name: &str, timestamp: BackupTimestamp) -> PathBuf {
    vm_dir(base_dir, vm_name).join(timestamp.to_string())
}

pub fn staging_path(base_dir: &Path, vm_name: &str, timestamp: BackupTimestamp) -> PathBuf {
    vm_dir(base_dir, vm_name).join(format!(".{timestamp}.partial"))
}

/// File name of the saved VM configuration
pub fn ovf_file_name(vm_name: &str, vm_id: &str) -> String {
    format!("{vm_name}-{vm_id}.ovf")
}

/// Total size of the files in `path` (or of `path` itself)
pub fn disk_usage(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
