//! Installation State Machine
//!
//! Explicit transaction states so an install can never skip its backup
//! or leave a failure without a recovery attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::engine::error::{EngineError, Result};
use crate::engine::model::{HardwareId, Outcome, UpdatePlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Pending,
    BackupCreated,
    RestorePointCreated,
    Installing,
    Succeeded,
    InstallFailed,
    /// Installer exit code not recognized but the target version is present
    Unconfirmed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl InstallState {
    pub fn can_transition_to(self, next: InstallState) -> bool {
        use InstallState::*;
        matches!(
            (self, next),
            (Pending, BackupCreated)
                | (BackupCreated, RestorePointCreated)
                // restore point creation failed; proceed without one
                | (BackupCreated, Installing)
                | (RestorePointCreated, Installing)
                | (Installing, Succeeded)
                | (Installing, InstallFailed)
                | (Installing, Unconfirmed)
                | (InstallFailed, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, RollbackFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstallState::Succeeded
                | InstallState::Unconfirmed
                | InstallState::RolledBack
                | InstallState::RollbackFailed
        )
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallState::Pending => "pending",
            InstallState::BackupCreated => "backup_created",
            InstallState::RestorePointCreated => "restore_point_created",
            InstallState::Installing => "installing",
            InstallState::Succeeded => "succeeded",
            InstallState::InstallFailed => "install_failed",
            InstallState::Unconfirmed => "unconfirmed",
            InstallState::RollingBack => "rolling_back",
            InstallState::RolledBack => "rolled_back",
            InstallState::RollbackFailed => "rollback_failed",
        };
        f.write_str(name)
    }
}

/// One plan's walk through [`InstallState`], with timestamps.
#[derive(Debug, Clone)]
pub struct InstallTransaction {
    state: InstallState,
    history: Vec<(InstallState, DateTime<Utc>)>,
}

impl InstallTransaction {
    pub fn new() -> Self {
        Self {
            state: InstallState::Pending,
            history: vec![(InstallState::Pending, Utc::now())],
        }
    }

    pub fn state(&self) -> InstallState {
        self.state
    }

    pub fn history(&self) -> &[(InstallState, DateTime<Utc>)] {
        &self.history
    }

    pub fn advance(&mut self, next: InstallState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.history.push((next, Utc::now()));
        Ok(())
    }
}

impl Default for InstallTransaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a plan is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    Downloading,
    Verifying,
    /// Waiting for the install gate
    Queued,
    Transaction { state: InstallState },
    Finished { outcome: Outcome },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub plan_id: Uuid,
    pub hardware_id: HardwareId,
    #[serde(flatten)]
    pub stage: Stage,
    pub at: DateTime<Utc>,
}

/// Publishes progress events; a no-op when nobody listens.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    sender: Option<UnboundedSender<ProgressEvent>>,
}

impl Progress {
    pub fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        Self { sender: Some(sender) }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self, plan: &UpdatePlan, stage: Stage) {
        if let Some(sender) = &self.sender {
            // A closed receiver just means nobody is watching any more
            let _ = sender.send(ProgressEvent {
                plan_id: plan.id,
                hardware_id: plan.device.hardware_id.clone(),
                stage,
                at: Utc::now(),
            });
        }
    }
}
