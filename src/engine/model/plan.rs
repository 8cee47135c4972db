//! Plans, Download Results and Installation Records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use super::catalog::CatalogEntry;
use super::device::{DeviceRecord, HardwareId};
use crate::engine::error::ErrorKind;
use crate::engine::version::DriverVersion;

/// Why a plan exists: the installed version and the one it moves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDelta {
    pub from: Option<DriverVersion>,
    pub to: DriverVersion,
}

impl fmt::Display for VersionDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.from {
            Some(from) => write!(f, "{} -> {}", from, self.to),
            None => write!(f, "(none) -> {}", self.to),
        }
    }
}

/// One device paired with the catalog entry chosen for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePlan {
    pub id: Uuid,
    pub device: DeviceRecord,
    pub entry: CatalogEntry,
    pub rationale: VersionDelta,
}

impl UpdatePlan {
    pub fn new(device: DeviceRecord, entry: CatalogEntry) -> Self {
        let rationale = VersionDelta {
            from: device.installed_version.clone(),
            to: entry.version.clone(),
        };
        Self {
            id: Uuid::new_v4(),
            device,
            entry,
            rationale,
        }
    }
}

/// How the bytes got here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum TransferMethod {
    Segmented { segments: usize },
    SingleStream,
    LocalCopy,
}

/// A retrieved package awaiting verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub bytes: u64,
    /// SHA-256 of the artifact, hex
    pub sha256: String,
    pub method: TransferMethod,
    /// Some bytes came from an earlier interrupted attempt
    pub resumed: bool,
}

/// Identifier handed out by the host restore-point service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RestorePointId(pub String);

impl fmt::Display for RestorePointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal outcome of one step of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// Installer failed or could not be confirmed; always followed by a rollback record
    InstallFailed,
    RolledBack,
    RollbackFailed,
    /// Plan ended before installing (download, verification or backup failure)
    Failed,
    /// Installer exit code not recognized; needs user review
    Unknown,
    Cancelled,
}

impl Outcome {
    pub fn needs_attention(&self) -> bool {
        matches!(self, Outcome::RollbackFailed | Outcome::Unknown)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Succeeded => "succeeded",
            Outcome::InstallFailed => "install_failed",
            Outcome::RolledBack => "rolled_back",
            Outcome::RollbackFailed => "rollback_failed",
            Outcome::Failed => "failed",
            Outcome::Unknown => "unknown",
            Outcome::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Append-only record of an install attempt. Corrections are new records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationRecord {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub hardware_id: HardwareId,
    pub device_name: String,
    pub prior_version: Option<DriverVersion>,
    pub target_version: DriverVersion,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_point: Option<RestorePointId>,
    #[serde(default)]
    pub reboot_required: bool,
    #[serde(default)]
    pub needs_attention: bool,
    pub created_at: DateTime<Utc>,
}

impl InstallationRecord {
    pub fn new(plan: &UpdatePlan, outcome: Outcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id: plan.id,
            hardware_id: plan.device.hardware_id.clone(),
            device_name: plan.device.name.clone(),
            prior_version: plan.rationale.from.clone(),
            target_version: plan.rationale.to.clone(),
            outcome,
            error: None,
            detail: None,
            backup_id: None,
            restore_point: None,
            reboot_required: false,
            needs_attention: outcome.needs_attention(),
            created_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, kind: ErrorKind, detail: impl Into<String>) -> Self {
        self.error = Some(kind);
        self.detail = Some(detail.into());
        self.needs_attention = self.needs_attention || kind.needs_attention();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_backup(mut self, backup_id: Option<&str>) -> Self {
        self.backup_id = backup_id.map(String::from);
        self
    }

    pub fn with_restore_point(mut self, restore_point: Option<&RestorePointId>) -> Self {
        self.restore_point = restore_point.cloned();
        self
    }

    pub fn with_reboot_required(mut self, reboot_required: bool) -> Self {
        self.reboot_required = reboot_required;
        self
    }

    /// One-line summary for logs and CLI output.
    pub fn summary(&self) -> String {
        let versions = match &self.prior_version {
            Some(prior) => format!("{} -> {}", prior, self.target_version),
            None => format!("(none) -> {}", self.target_version),
        };
        match self.error {
            Some(kind) => format!("{} [{}] {} ({})", self.hardware_id, self.outcome, versions, kind),
            None => format!("{} [{}] {}", self.hardware_id, self.outcome, versions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::catalog::{CatalogOrigin, DriverPackage, Locator, PackageKind};
    use crate::engine::model::device::DeviceClass;

    fn plan() -> UpdatePlan {
        let hardware_id = HardwareId::parse("PCI\\VEN_10EC&DEV_8168").unwrap();
        let device = DeviceRecord::new(hardware_id.clone(), DeviceClass::Network, "Realtek PCIe GbE")
            .with_driver(DriverVersion::parse("1.0.0").unwrap(), "Realtek");
        let entry = CatalogEntry {
            version: DriverVersion::parse("1.2.0").unwrap(),
            package: DriverPackage {
                hardware_id,
                provider: "Realtek".to_string(),
                locator: Locator::Http("https://dl.example.com/rt.zip".into()),
                sha256: "00".to_string(),
                size: None,
                signature: None,
                kind: PackageKind::Inf,
            },
            origin: CatalogOrigin::Local,
        };
        UpdatePlan::new(device, entry)
    }

    #[test]
    fn test_plan_rationale() {
        let plan = plan();
        assert_eq!(plan.rationale.to_string(), "1.0.0 -> 1.2.0");
    }

    #[test]
    fn test_record_attention_flags() {
        let plan = plan();
        assert!(!InstallationRecord::new(&plan, Outcome::Succeeded).needs_attention);
        assert!(InstallationRecord::new(&plan, Outcome::RollbackFailed).needs_attention);
        let unknown = InstallationRecord::new(&plan, Outcome::Failed)
            .with_error(ErrorKind::UnknownOutcome, "exit code 42");
        assert!(unknown.needs_attention);
    }

    #[test]
    fn test_record_summary() {
        let plan = plan();
        let record = InstallationRecord::new(&plan, Outcome::InstallFailed)
            .with_error(ErrorKind::PostInstallMismatch, "still 1.0.0");
        assert_eq!(
            record.summary(),
            "PCI\\VEN_10EC&DEV_8168 [install_failed] 1.0.0 -> 1.2.0 (post_install_mismatch)"
        );
    }
}
