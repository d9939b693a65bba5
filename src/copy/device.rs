// ============================================================================
// File: packages/ovbackup/src/copy/device.rs
// ----------------------------------------------------------------------------
// Discovery of attached disks under /dev/disk/by-id
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::debug;

use super::errors::{CopyError, CopyResult};
use crate::platform::Backoff;

pub const DEFAULT_BY_ID_DIR: &str = "/dev/disk/by-id";

/// udev truncates the virtio serial (the disk id) to 20 characters
const SERIAL_PREFIX_LEN: usize = 20;

/// Resolves platform disk ids to local device nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLocator {
    by_id_dir: PathBuf,
}

impl DeviceLocator {
    pub fn new(by_id_dir: impl Into<PathBuf>) -> Self {
        Self {
            by_id_dir: by_id_dir.into(),
        }
    }

    pub fn by_id_dir(&self) -> &Path {
        &self.by_id_dir
    }

    fn not_found(&self, disk_id: &str) -> CopyError {
        CopyError::DeviceNotFound {
            disk_id: disk_id.to_string(),
            search_dir: self.by_id_dir.clone(),
        }
    }

    /// Find the device node for `disk_id`, following the by-id symlink
    pub fn locate(&self, disk_id: &str) -> CopyResult<PathBuf> {
        let serial: String = disk_id.chars().take(SERIAL_PREFIX_LEN).collect();
        if serial.is_empty() {
            return Err(self.not_found(disk_id));
        }

        let entries = fs::read_dir(&self.by_id_dir).map_err(|_| self.not_found(disk_id))?;
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.contains(&serial) && !is_partition(&name)
            })
            .map(|entry| entry.path())
            .collect();
        candidates.sort();

        let link = candidates
            .into_iter()
            .next()
            .ok_or_else(|| self.not_found(disk_id))?;
        let device = fs::canonicalize(&link).map_err(CopyError::read(&link))?;
        debug!("Disk {disk_id} is {} ({})", device.display(), link.display());
        Ok(device)
    }

    /// Poll [`locate`](Self::locate) until the device shows up or `timeout` passes
    pub async fn wait_visible(
        &self,
        disk_id: &str,
        timeout: Duration,
        backoff: &Backoff,
    ) -> CopyResult<PathBuf> {
        let started = Instant::now();
        let mut delays = backoff.delays();

        loop {
            match self.locate(disk_id) {
                Err(CopyError::DeviceNotFound { .. }) => {}
                outcome => return outcome,
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(self.not_found(disk_id));
            }
            let delay = delays.next().unwrap_or(backoff.max).min(timeout - elapsed);
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for DeviceLocator {
    fn default() -> Self {
        Self::new(DEFAULT_BY_ID_DIR)
    }
}

fn is_partition(name: &str) -> bool {
    name.rsplit_once("-part")
        .is_some_and(|(_, n)| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}
