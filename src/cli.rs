// ============================================================================
// File: packages/ovbackup/src/cli.rs
// ----------------------------------------------------------------------------
// Command-line arguments and the final status line
// ============================================================================

use std::path::PathBuf;

use clap::Parser;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::logging::DEFAULT_LOG_FILE;
use crate::orchestrator::{
    BackupError, BackupFailure, BackupReport, BackupRequest, DEFAULT_VERSIONS_TO_KEEP,
};

/// Back up a running oVirt VM through a disk snapshot
///
/// Run on the agent VM: the snapshot's disks are attached to it, copied to
/// `<basedir>/<vmname>/<timestamp>/` and released again.
#[derive(Debug, Parser)]
#[command(name = "ovbackup", version)]
pub struct Args {
    /// Name of the VM to back up
    pub vmname: String,

    /// Directory holding the backups
    #[arg(short = 'b', long = "basedir")]
    pub basedir: PathBuf,

    /// Name of the VM this tool runs on
    #[arg(short = 'a', long = "agentvm")]
    pub agentvm: String,

    /// Export domain directory under basedir to reference the backup from
    #[arg(short = 'e', long = "export-domain")]
    pub export_domain: Option<String>,

    /// Number of backups to keep
    #[arg(short = 'n', long = "numkeep", default_value_t = DEFAULT_VERSIONS_TO_KEEP)]
    pub numkeep: usize,

    /// Migrate the agent VM to the host of the VM being backed up
    #[arg(short = 'm', long = "migrate-vm")]
    pub migrate_vm: bool,

    /// Engine connection settings
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log file (appended to)
    #[arg(short = 'l', long = "log-file", default_value = DEFAULT_LOG_FILE)]
    pub log_file: PathBuf,
}

impl Args {
    pub fn request(&self) -> BackupRequest {
        let request = BackupRequest::new(&self.vmname, &self.basedir, &self.agentvm)
            .with_versions_to_keep(self.numkeep)
            .with_migrate_agent(self.migrate_vm);
        match &self.export_domain {
            Some(domain) => request.with_export_domain(domain),
            None => request,
        }
    }
}

/// Human-readable summary printed when the run ends
pub fn status_line(vm_name: &str, outcome: &Result<BackupReport, BackupFailure>) -> String {
    match outcome {
        Ok(report) => format!(
            "{vm_name}: backup completed: {} ({} bytes)",
            report.artifact.path.display(),
            report.artifact.size_bytes
        ),
        Err(failure) if matches!(failure.cause, BackupError::NotRunning { .. }) => {
            format!("{vm_name}: backup skipped: {}", failure.cause)
        }
        Err(failure) => format!(
            "{vm_name}: backup failed [{}]: {}",
            failure.cause.kind(),
            failure.cause
        ),
    }
}

/// Process exit status for a finished run
pub fn exit_code(outcome: &Result<BackupReport, BackupFailure>) -> u8 {
    match outcome {
        Ok(_) => 0,
        Err(failure) if matches!(failure.cause, BackupError::NotRunning { .. }) => 0,
        Err(_) => 1,
    }
}
