// ============================================================================
// File: packages/ovbackup/src/platform/errors.rs
// ----------------------------------------------------------------------------
// Control-plane error types
// ============================================================================

use std::time::Duration;

/// Errors raised by the platform client adapter
///
/// Covers rejections by the engine, transport failures and polling timeouts.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    /// The engine refused the operation
    #[error("Platform rejected {operation}: [{code}] {message}")]
    Rejected {
        operation: &'static str,
        code: u16,
        message: String,
    },

    /// The addressed resource does not exist (or no longer exists)
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// The request never produced a response
    #[error("Transport failure during {operation}: {details}")]
    Transport {
        operation: &'static str,
        details: String,
    },

    /// A polled resource never reached the expected state
    #[error("{resource} did not become ready within {}s", waited.as_secs())]
    Timeout { resource: String, waited: Duration },

    /// A polled resource reached a terminal state other than ready
    #[error("{resource} entered state '{state}'")]
    Failed { resource: String, state: String },

    /// The TLS connector could not be built
    #[error("TLS setup failed: {details}")]
    Tls { details: String },

    /// The engine answered with something we could not decode
    #[error("Malformed response to {operation}: {details}")]
    Malformed {
        operation: &'static str,
        details: String,
    },
}

impl PlatformError {
    /// Errors worth retrying for the same logical request.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Transport { .. } => true,
            PlatformError::Rejected { code, .. } => matches!(code, 502..=504),
            _ => false,
        }
    }

    /// The engine reported that the resource already exists or is locked.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PlatformError::Rejected { code: 409, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound { .. })
    }

    /// Numeric code used in status lines; transport failures have none.
    pub fn code(&self) -> Option<u16> {
        match self {
            PlatformError::Rejected { code, .. } => Some(*code),
            PlatformError::NotFound { .. } => Some(404),
            _ => None,
        }
    }
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;
