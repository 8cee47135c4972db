//! Host Collaborators
//!
//! Seams between the installation engine and the operating system.
//! Production implementations live in `engine::platform`; tests script them.

use async_trait::async_trait;
use std::path::Path;

use super::invoke::{InstallerReport, PackageInstaller};
use crate::engine::error::Result;
use crate::engine::model::{DeviceRecord, InstallationRecord, RestorePointId};
use crate::engine::version::DriverVersion;

/// Driver store operations for a single device.
#[async_trait]
pub trait DriverHost: Send + Sync {
    /// Version currently bound to the device; `None` when no driver is installed.
    async fn installed_version(&self, device: &DeviceRecord) -> Result<Option<DriverVersion>>;

    /// Export the currently bound driver package into `dest`.
    async fn export_driver(&self, device: &DeviceRecord, dest: &Path) -> Result<()>;

    /// Reinstall a driver package previously exported to `source`.
    async fn reapply_driver(&self, device: &DeviceRecord, source: &Path) -> Result<()>;
}

#[async_trait]
pub trait RestorePointService: Send + Sync {
    async fn create(&self, description: &str) -> Result<RestorePointId>;

    async fn restore(&self, id: &RestorePointId) -> Result<()>;
}

/// Runs an installer to completion. The engine imposes the timeout.
#[async_trait]
pub trait InstallerInvoker: Send + Sync {
    async fn invoke(&self, installer: &PackageInstaller) -> Result<InstallerReport>;
}

/// Append-only destination for installation records.
pub trait RecordSink: Send + Sync {
    fn append(&self, record: &InstallationRecord) -> Result<()>;
}
