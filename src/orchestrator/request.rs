// ============================================================================
// File: packages/ovbackup/src/orchestrator/request.rs
// ----------------------------------------------------------------------------
// Validated input for one backup run
// ============================================================================

use std::path::{Path, PathBuf};

use super::errors::BackupError;

pub const DEFAULT_VERSIONS_TO_KEEP: usize = 7;

/// What to back up, where to, and with which helper VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    /// VM to back up
    pub vm_name: String,

    /// Root of the backup tree
    pub base_dir: PathBuf,

    /// Helper VM the cloned disks are attached to (the machine running us)
    pub agent_vm_name: String,

    /// Export domain directory under `base_dir` to reference backups from
    pub export_domain: Option<String>,

    /// Number of backups kept per VM
    pub versions_to_keep: usize,

    /// Move the agent VM to the target's host before attaching
    pub migrate_agent: bool,
}

impl BackupRequest {
    pub fn new<V, B, A>(vm_name: V, base_dir: B, agent_vm_name: A) -> Self
    where
        V: Into<String>,
        B: Into<PathBuf>,
        A: Into<String>,
    {
        Self {
            vm_name: vm_name.into(),
            base_dir: base_dir.into(),
            agent_vm_name: agent_vm_name.into(),
            export_domain: None,
            versions_to_keep: DEFAULT_VERSIONS_TO_KEEP,
            migrate_agent: false,
        }
    }

    pub fn with_export_domain<S: Into<String>>(mut self, export_domain: S) -> Self {
        self.export_domain = Some(export_domain.into());
        self
    }

    pub fn with_versions_to_keep(mut self, versions: usize) -> Self {
        self.versions_to_keep = versions;
        self
    }

    pub fn with_migrate_agent(mut self, migrate: bool) -> Self {
        self.migrate_agent = migrate;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Reject names that cannot be used as single path components
    pub fn validate(&self) -> Result<(), BackupError> {
        check_component("VM name", &self.vm_name)?;
        check_component("agent VM name", &self.agent_vm_name)?;
        if let Some(domain) = &self.export_domain {
            check_component("export domain", domain)?;
        }
        if self.base_dir.as_os_str().is_empty() {
            return Err(BackupError::InvalidRequest {
                reason: "base directory is empty".to_string(),
            });
        }
        Ok(())
    }
}

fn check_component(what: &str, value: &str) -> Result<(), BackupError> {
    let reason = if value.trim().is_empty() {
        format!("{what} is empty")
    } else if value.contains('/') || value == "." || value == ".." {
        format!("{what} '{value}' is not a valid directory name")
    } else {
        return Ok(());
    };
    Err(BackupError::InvalidRequest { reason })
}
