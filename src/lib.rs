//! Snapshot-based backups of running oVirt virtual machines.
//!
//! A backup run snapshots the VM through the engine REST API, attaches the
//! snapshot's disks to the VM this process runs on (the agent), streams the
//! attached block devices into `<basedir>/<vm>/<timestamp>/`, and releases
//! every engine resource it created before returning. Older backups are
//! rotated away and the new one can be referenced from an export domain.
//!
//! ```no_run
//! use ovbackup::config::ShellConfig;
//! use ovbackup::orchestrator::{BackupOrchestrator, BackupRequest};
//! use ovbackup::platform::OvirtApiClient;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ShellConfig::load("/root/.ovirtshellrc".as_ref())?;
//! let client = OvirtApiClient::new(config.session(), config.settings.request_timeout)?;
//! let orchestrator = BackupOrchestrator::new(client, config.settings.clone());
//!
//! let request = BackupRequest::new("db1", "/backup", "backupvm").with_versions_to_keep(3);
//! let report = orchestrator.run(&request, &CancellationToken::new()).await?;
//! println!("{}", report.artifact.path.display());
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod cli;
pub mod config;
pub mod copy;
pub mod export;
pub mod logging;
pub mod orchestrator;
pub mod platform;
pub mod retention;

pub use artifact::{BackupArtifact, BackupTimestamp};
pub use orchestrator::{
    BackupError, BackupFailure, BackupOrchestrator, BackupReport, BackupRequest, BackupSettings,
    BackupState,
};
pub use platform::{OvirtApiClient, PlatformClient, PlatformError};
