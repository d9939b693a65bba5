// ============================================================================
// File: packages/ovbackup/src/orchestrator/settings.rs
// ----------------------------------------------------------------------------
// Tunables for a backup run
// ============================================================================

use std::time::Duration;

use crate::copy::DEFAULT_CHUNK_SIZE;
use crate::platform::{Backoff, RetryPolicy};

/// Timeouts, polling and retry settings
///
/// Every wait on the engine is bounded by one of these timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSettings {
    /// Snapshot creation until `ok`
    pub snapshot_timeout: Duration,

    /// Each cloned disk until ready
    pub disk_timeout: Duration,

    /// Each attachment until active
    pub attach_timeout: Duration,

    /// Device node to appear after attach
    pub device_timeout: Duration,

    /// Agent VM migration
    pub migrate_timeout: Duration,

    /// Each release wait during cleanup
    pub cleanup_timeout: Duration,

    /// Whole cleanup pass of a cancelled run
    pub cancel_cleanup_timeout: Duration,

    /// Single REST request
    pub request_timeout: Duration,

    /// Delay between status polls
    pub backoff: Backoff,

    /// Attempts per control-plane call
    pub retry_attempts: u32,

    /// Copy chunk size in bytes
    pub chunk_size: usize,
}

impl BackupSettings {
    pub fn new() -> Self {
        Self {
            snapshot_timeout: Duration::from_secs(1800),
            disk_timeout: Duration::from_secs(600),
            attach_timeout: Duration::from_secs(300),
            device_timeout: Duration::from_secs(60),
            migrate_timeout: Duration::from_secs(1800),
            cleanup_timeout: Duration::from_secs(600),
            cancel_cleanup_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(60),
            backoff: Backoff::default(),
            retry_attempts: 3,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }

    pub fn with_disk_timeout(mut self, timeout: Duration) -> Self {
        self.disk_timeout = timeout;
        self
    }

    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    pub fn with_migrate_timeout(mut self, timeout: Duration) -> Self {
        self.migrate_timeout = timeout;
        self
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    pub fn with_cancel_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_cleanup_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Retry policy for forward calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.backoff)
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self::new()
    }
}
