// ============================================================================
// File: packages/ovbackup/src/orchestrator/state.rs
// ----------------------------------------------------------------------------
// Backup workflow states and the transition log
// ============================================================================

use std::fmt;

use log::{info, warn};

/// Steps of a backup run
///
/// Forward steps run in declaration order. `Aborting` is entered once when the
/// first fatal error is recorded; the release states follow it (or a
/// successful copy) only for resources that exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupState {
    Init,
    Migrating,
    Snapshotting,
    Cloning,
    Attaching,
    Copying,
    Aborting,
    Detaching,
    DeletingClone,
    DeletingSnapshot,
    Rotating,
    Linking,
    Done,
    Failed,
}

impl BackupState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Migrating => "Migrating",
            Self::Snapshotting => "Snapshotting",
            Self::Cloning => "Cloning",
            Self::Attaching => "Attaching",
            Self::Copying => "Copying",
            Self::Aborting => "Aborting",
            Self::Detaching => "Detaching",
            Self::DeletingClone => "DeletingClone",
            Self::DeletingSnapshot => "DeletingSnapshot",
            Self::Rotating => "Rotating",
            Self::Linking => "Linking",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn is_forward(self) -> bool {
        matches!(
            self,
            Self::Init
                | Self::Migrating
                | Self::Snapshotting
                | Self::Cloning
                | Self::Attaching
                | Self::Copying
        )
    }

    fn is_release(self) -> bool {
        matches!(
            self,
            Self::Detaching | Self::DeletingClone | Self::DeletingSnapshot
        )
    }

    /// Whether `next` may directly follow `self`
    pub fn can_advance_to(self, next: BackupState) -> bool {
        use BackupState::*;

        match (self, next) {
            (Init, Migrating | Snapshotting) => true,
            (Migrating, Snapshotting) => true,
            (Snapshotting, Cloning) => true,
            (Cloning, Attaching) => true,
            (Attaching, Copying) => true,
            (Copying, Detaching | DeletingClone | DeletingSnapshot | Rotating) => true,
            (from, Aborting) => from.is_forward(),
            (Aborting, to) => to.is_release() || to == Failed,
            (Detaching, DeletingClone | DeletingSnapshot) => true,
            (DeletingClone, DeletingSnapshot) => true,
            (from, Rotating | Failed) => from.is_release(),
            (Rotating, Linking | Done) => true,
            (Linking, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus every state visited, logged as `<vm>: <from> -> <to>`
#[derive(Debug, Clone)]
pub(crate) struct StateMachine {
    vm_name: String,
    trace: Vec<BackupState>,
}

impl StateMachine {
    pub fn new(vm_name: &str) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            trace: vec![BackupState::Init],
        }
    }

    pub fn current(&self) -> BackupState {
        self.trace.last().copied().unwrap_or(BackupState::Init)
    }

    pub fn enter(&mut self, next: BackupState) {
        let from = self.current();
        if !from.can_advance_to(next) {
            warn!("{}: unexpected transition {from} -> {next}", self.vm_name);
        }
        info!("{}: {from} -> {next}", self.vm_name);
        self.trace.push(next);
    }

    pub fn into_trace(self) -> Vec<BackupState> {
        self.trace
    }
}
