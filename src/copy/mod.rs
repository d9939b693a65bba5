// ============================================================================
// File: packages/ovbackup/src/copy/mod.rs
// ----------------------------------------------------------------------------
// Data plane: locating attached disks and streaming them to backup storage.
// ============================================================================

mod device;
mod engine;
mod errors;

pub use device::{DEFAULT_BY_ID_DIR, DeviceLocator};
pub use engine::{CopiedDisk, DEFAULT_CHUNK_SIZE, DiskCopyEngine};
pub use errors::{CopyError, CopyResult};
