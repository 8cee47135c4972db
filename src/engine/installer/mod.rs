//! Installation Transaction Engine
//!
//! Applies one approved package to one device as a transaction:
//! backup, optional restore point, install, post-install check, and
//! rollback when anything after the backup goes wrong.

pub mod host;
pub mod invoke;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::audit::{BackupSnapshot, DriverBackupStore};
use crate::engine::error::{EngineError, ErrorKind};
use crate::engine::locks::InstallGate;
use crate::engine::model::{InstallationRecord, Outcome, RestorePointId, UpdatePlan};
use crate::engine::updater::{ApprovedPackage, InstallState, InstallTransaction, Progress, Stage};
use crate::engine::version::DriverVersion;

pub use host::{DriverHost, InstallerInvoker, RecordSink, RestorePointService};
pub use invoke::{ExitClass, InstallerReport, PackageInstaller, SystemInstaller};

/// How the install step ended, before any rollback.
enum InstallResult {
    Succeeded { reboot_required: bool },
    Unconfirmed { exit_code: i32 },
    Failed(EngineError),
}

pub struct InstallationEngine {
    host: Arc<dyn DriverHost>,
    invoker: Arc<dyn InstallerInvoker>,
    restore_points: Option<Arc<dyn RestorePointService>>,
    backups: Arc<DriverBackupStore>,
    sink: Arc<dyn RecordSink>,
    timeout: Duration,
    progress: Progress,
}

impl InstallationEngine {
    pub fn new(
        host: Arc<dyn DriverHost>,
        invoker: Arc<dyn InstallerInvoker>,
        backups: Arc<DriverBackupStore>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            host,
            invoker,
            restore_points: None,
            backups,
            sink,
            timeout: Duration::from_secs(900),
            progress: Progress::silent(),
        }
    }

    pub fn with_restore_points(mut self, service: Arc<dyn RestorePointService>) -> Self {
        self.restore_points = Some(service);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn host(&self) -> &Arc<dyn DriverHost> {
        &self.host
    }

    /// Run the transaction for one plan and return the records it produced,
    /// already appended to the sink.
    ///
    /// The gate is held from before the backup until a terminal state.
    /// Cancellation is honoured up to the moment installing starts.
    pub async fn execute(
        &self,
        plan: &UpdatePlan,
        package: ApprovedPackage,
        gate: &InstallGate,
        cancel: &CancellationToken,
    ) -> Vec<InstallationRecord> {
        let records = self.run_transaction(plan, &package, gate, cancel).await;
        package.discard();
        records
    }

    async fn run_transaction(
        &self,
        plan: &UpdatePlan,
        package: &ApprovedPackage,
        gate: &InstallGate,
        cancel: &CancellationToken,
    ) -> Vec<InstallationRecord> {
        let device = &plan.device;
        self.progress.emit(plan, Stage::Queued);

        let description = format!("Hamster: {} {}", device.name, plan.rationale);
        let _permit = match gate.acquire(&description, cancel).await {
            Ok(permit) => permit,
            Err(e) => return vec![self.record_failure(plan, &e)],
        };
        if cancel.is_cancelled() {
            return vec![self.record_failure(plan, &EngineError::Cancelled)];
        }

        let mut tx = InstallTransaction::new();

        let backup = match self.backups.capture(device, self.host.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(device = %device.hardware_id, error = %e, "Backup failed, not installing");
                return vec![self.record_failure(plan, &e)];
            }
        };
        self.advance(plan, &mut tx, InstallState::BackupCreated);

        if cancel.is_cancelled() {
            let record = InstallationRecord::new(plan, Outcome::Cancelled)
                .with_error(ErrorKind::Cancelled, "cancelled before installing")
                .with_backup(Some(backup.id.as_str()));
            return vec![self.finish(plan, record)];
        }

        let restore_point = self.create_restore_point(plan, &mut tx, &description).await;

        if cancel.is_cancelled() {
            let record = InstallationRecord::new(plan, Outcome::Cancelled)
                .with_error(ErrorKind::Cancelled, "cancelled before installing")
                .with_backup(Some(backup.id.as_str()))
                .with_restore_point(restore_point.as_ref());
            return vec![self.finish(plan, record)];
        }

        self.advance(plan, &mut tx, InstallState::Installing);
        let installer = PackageInstaller::for_package(package);
        info!(device = %device.hardware_id, delta = %plan.rationale, kind = %installer.kind(), "Installing driver");

        match self.install(plan, &installer).await {
            InstallResult::Succeeded { reboot_required } => {
                self.advance(plan, &mut tx, InstallState::Succeeded);
                info!(device = %device.hardware_id, version = %plan.rationale.to, reboot_required, "Driver installed");
                let record = InstallationRecord::new(plan, Outcome::Succeeded)
                    .with_backup(Some(backup.id.as_str()))
                    .with_restore_point(restore_point.as_ref())
                    .with_reboot_required(reboot_required);
                vec![self.finish(plan, record)]
            }
            InstallResult::Unconfirmed { exit_code } => {
                self.advance(plan, &mut tx, InstallState::Unconfirmed);
                warn!(device = %device.hardware_id, exit_code, "Installer exit code not recognized; target version is present");
                let record = InstallationRecord::new(plan, Outcome::Unknown)
                    .with_error(
                        ErrorKind::UnknownOutcome,
                        format!("unrecognized installer exit code {}", exit_code),
                    )
                    .with_backup(Some(backup.id.as_str()))
                    .with_restore_point(restore_point.as_ref());
                vec![self.finish(plan, record)]
            }
            InstallResult::Failed(e) => {
                self.advance(plan, &mut tx, InstallState::InstallFailed);
                warn!(device = %device.hardware_id, error = %e, "Install failed, rolling back");
                let failed = InstallationRecord::new(plan, Outcome::InstallFailed)
                    .with_error(e.kind(), e.to_string())
                    .with_backup(Some(backup.id.as_str()))
                    .with_restore_point(restore_point.as_ref());
                let failed = self.finish(plan, failed);

                self.advance(plan, &mut tx, InstallState::RollingBack);
                let recovery = self.roll_back(plan, &mut tx, &backup, restore_point.as_ref()).await;
                vec![failed, recovery]
            }
        }
    }

    async fn create_restore_point(
        &self,
        plan: &UpdatePlan,
        tx: &mut InstallTransaction,
        description: &str,
    ) -> Option<RestorePointId> {
        let service = self.restore_points.as_ref()?;
        match service.create(description).await {
            Ok(id) => {
                self.advance(plan, tx, InstallState::RestorePointCreated);
                info!(restore_point = %id, "Restore point created");
                Some(id)
            }
            Err(e) => {
                warn!(device = %plan.device.hardware_id, error = %e, "Restore point creation failed, continuing without one");
                None
            }
        }
    }

    async fn install(&self, plan: &UpdatePlan, installer: &PackageInstaller) -> InstallResult {
        let report = match tokio::time::timeout(self.timeout, self.invoker.invoke(installer)).await {
            Err(_) => return InstallResult::Failed(EngineError::InstallTimeout(self.timeout.as_secs())),
            Ok(Err(e)) => return InstallResult::Failed(e),
            Ok(Ok(report)) => report,
        };

        let class = installer.classify(report.exit_code);
        if class == ExitClass::Failure {
            let code = report
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string());
            let mut message = format!("exit code {}", code);
            if !report.output.is_empty() {
                message.push_str(": ");
                message.push_str(&report.output);
            }
            return InstallResult::Failed(EngineError::InstallerFailed(message));
        }

        let expected = Some(plan.rationale.to.clone());
        let confirmed = match self.host.installed_version(&plan.device).await {
            Ok(found) if same_version(&found, &expected) => Ok(()),
            Ok(found) => Err(describe(&found)),
            Err(e) => Err(format!("query failed: {}", e)),
        };

        match (class, confirmed) {
            (ExitClass::Unrecognized, Ok(())) => InstallResult::Unconfirmed {
                exit_code: report.exit_code.unwrap_or_default(),
            },
            (ExitClass::Unrecognized, Err(found)) => InstallResult::Failed(EngineError::InstallerFailed(format!(
                "unrecognized exit code {} and device reports {}",
                report.exit_code.unwrap_or_default(),
                found
            ))),
            (class, Ok(())) => InstallResult::Succeeded {
                reboot_required: class == ExitClass::SuccessRebootRequired,
            },
            (_, Err(found)) => InstallResult::Failed(EngineError::PostInstallMismatch {
                expected: plan.rationale.to.to_string(),
                found,
            }),
        }
    }

    /// Reapply the backup; fall back to the restore point; confirm either way.
    /// An empty backup is confirmed directly against the device.
    async fn roll_back(
        &self,
        plan: &UpdatePlan,
        tx: &mut InstallTransaction,
        backup: &BackupSnapshot,
        restore_point: Option<&RestorePointId>,
    ) -> InstallationRecord {
        let device = &plan.device;
        let mut failures = Vec::new();

        if backup.is_empty() {
            // Nothing to reapply; the device had no driver before
            match self.confirm_rollback(plan, backup).await {
                Ok(()) => return self.rolled_back(plan, tx, backup, restore_point, "no prior driver; none bound"),
                Err(e) => failures.push(format!("backup: {}", e)),
            }
        } else {
            match self.backups.reapply(backup, device, self.host.as_ref()).await {
                Ok(()) => match self.confirm_rollback(plan, backup).await {
                    Ok(()) => return self.rolled_back(plan, tx, backup, restore_point, "backup reapplied"),
                    Err(e) => failures.push(format!("backup: {}", e)),
                },
                Err(e) => failures.push(format!("backup: {}", e)),
            }
        }

        if let (Some(service), Some(id)) = (&self.restore_points, restore_point) {
            warn!(device = %device.hardware_id, restore_point = %id, "Backup rollback failed, restoring system restore point");
            match service.restore(id).await {
                Ok(()) => match self.confirm_rollback(plan, backup).await {
                    Ok(()) => return self.rolled_back(plan, tx, backup, restore_point, "restore point applied"),
                    Err(e) => failures.push(format!("restore point: {}", e)),
                },
                Err(e) => failures.push(format!("restore point: {}", e)),
            }
        } else {
            failures.push("restore point: none available".to_string());
        }

        self.advance(plan, tx, InstallState::RollbackFailed);
        let detail = failures.join("; ");
        error!(device = %device.hardware_id, %detail, "Rollback failed; device needs attention");
        let record = InstallationRecord::new(plan, Outcome::RollbackFailed)
            .with_error(ErrorKind::RollbackFailed, detail)
            .with_backup(Some(backup.id.as_str()))
            .with_restore_point(restore_point);
        self.finish(plan, record)
    }

    async fn confirm_rollback(&self, plan: &UpdatePlan, backup: &BackupSnapshot) -> Result<(), String> {
        match self.host.installed_version(&plan.device).await {
            Ok(found) if same_version(&found, &backup.version) => Ok(()),
            Ok(found) => Err(format!(
                "device reports {} after rollback, expected {}",
                describe(&found),
                describe(&backup.version)
            )),
            Err(e) => Err(format!("post-rollback query failed: {}", e)),
        }
    }

    fn rolled_back(
        &self,
        plan: &UpdatePlan,
        tx: &mut InstallTransaction,
        backup: &BackupSnapshot,
        restore_point: Option<&RestorePointId>,
        via: &str,
    ) -> InstallationRecord {
        self.advance(plan, tx, InstallState::RolledBack);
        info!(device = %plan.device.hardware_id, version = %describe(&backup.version), via, "Rolled back");
        let record = InstallationRecord::new(plan, Outcome::RolledBack)
            .with_detail(via)
            .with_backup(Some(backup.id.as_str()))
            .with_restore_point(restore_point);
        self.finish(plan, record)
    }

    /// Record a plan that ended before installing.
    pub fn record_failure(&self, plan: &UpdatePlan, e: &EngineError) -> InstallationRecord {
        let record = match e {
            EngineError::Cancelled => InstallationRecord::new(plan, Outcome::Cancelled)
                .with_error(ErrorKind::Cancelled, "cancelled before installing"),
            e => InstallationRecord::new(plan, Outcome::Failed).with_error(e.kind(), e.to_string()),
        };
        self.finish(plan, record)
    }

    fn finish(&self, plan: &UpdatePlan, record: InstallationRecord) -> InstallationRecord {
        if let Err(e) = self.sink.append(&record) {
            error!(record = %record.id, error = %e, "Failed to persist installation record");
        }
        self.progress.emit(plan, Stage::Finished { outcome: record.outcome });
        record
    }

    fn advance(&self, plan: &UpdatePlan, tx: &mut InstallTransaction, next: InstallState) {
        match tx.advance(next) {
            Ok(()) => self.progress.emit(plan, Stage::Transaction { state: next }),
            Err(e) => error!(plan = %plan.id, error = %e, "Transaction state error"),
        }
    }
}

fn same_version(found: &Option<DriverVersion>, expected: &Option<DriverVersion>) -> bool {
    match (found, expected) {
        (Some(found), Some(expected)) => found.same_release(expected),
        (None, None) => true,
        _ => false,
    }
}

fn describe(version: &Option<DriverVersion>) -> String {
    version
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "no driver".to_string())
}
