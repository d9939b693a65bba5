// ============================================================================
// File: packages/ovbackup/src/copy/engine.rs
// ----------------------------------------------------------------------------
// Chunked, verified and atomically published disk copies.
//
// Bytes are streamed into a temporary file next to the destination. Only a
// complete copy is fsynced and renamed onto the final name; on any error the
// temporary file is dropped and removed.
// ============================================================================

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use super::errors::{CopyError, CopyResult};

/// Default copy chunk: 4 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Result of a finished copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedDisk {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Copies block devices (or any seekable file) to backup storage
#[derive(Debug, Clone)]
pub struct DiskCopyEngine {
    chunk_size: usize,
    cancelled: Arc<AtomicBool>,
}

impl DiskCopyEngine {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Ask a running copy to stop after the current chunk
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Copy `source` to `dest`, publishing `dest` only when every byte arrived
    pub fn copy(&self, source: &Path, dest: &Path) -> CopyResult<CopiedDisk> {
        let mut reader = File::open(source).map_err(CopyError::read(source))?;
        self.copy_from(&mut reader, source, dest)
    }

    /// Copy an opened `source` device; `source` names it in errors
    pub(crate) fn copy_from<R: Read + Seek>(
        &self,
        reader: &mut R,
        source: &Path,
        dest: &Path,
    ) -> CopyResult<CopiedDisk> {
        let expected = reader
            .seek(SeekFrom::End(0))
            .map_err(CopyError::read(source))?;
        reader.rewind().map_err(CopyError::read(source))?;

        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = tempfile::Builder::new()
            .prefix(".copy-")
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(CopyError::write(dest))?;

        debug!(
            "Copying {} ({expected} bytes) to {} via {}",
            source.display(),
            dest.display(),
            staged.path().display()
        );

        let copied = self.stream(reader, staged.as_file_mut(), source, dest, expected)?;
        if copied != expected {
            return Err(CopyError::SizeMismatch {
                path: source.to_path_buf(),
                expected,
                copied,
            });
        }

        staged.as_file().sync_all().map_err(CopyError::write(dest))?;
        staged
            .persist(dest)
            .map_err(|e| CopyError::write(dest)(e.error))?;

        info!("Copied {} to {} ({copied} bytes)", source.display(), dest.display());
        Ok(CopiedDisk {
            path: dest.to_path_buf(),
            bytes: copied,
        })
    }

    /// Run [`copy`](Self::copy) on the blocking thread pool
    pub async fn spawn_copy(&self, source: PathBuf, dest: PathBuf) -> CopyResult<CopiedDisk> {
        let engine = self.clone();
        let target = dest.clone();
        tokio::task::spawn_blocking(move || engine.copy(&source, &dest))
            .await
            .map_err(|e| CopyError::WriteFailure {
                path: target,
                source: io::Error::other(e),
            })?
    }

    pub(crate) fn stream<R: Read, W: Write>(
        &self,
        reader: &mut R,
        writer: &mut W,
        source: &Path,
        dest: &Path,
        expected: u64,
    ) -> CopyResult<u64> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut copied: u64 = 0;
        let step = (expected / 10).max(1);
        let mut next_report = step;

        loop {
            if self.is_cancelled() {
                return Err(CopyError::Interrupted);
            }

            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CopyError::read(source)(e)),
            };
            writer
                .write_all(&buffer[..n])
                .map_err(CopyError::write(dest))?;
            copied += n as u64;

            if expected > 0 && copied >= next_report {
                let percent = (copied.min(expected) * 100) / expected;
                info!("{}: {percent}% copied", source.display());
                while next_report <= copied {
                    next_report += step;
                }
            }
        }

        writer.flush().map_err(CopyError::write(dest))?;
        Ok(copied)
    }
}

impl Default for DiskCopyEngine {
    fn default() -> Self {
        Self::new()
    }
}
