//! Platform Support Module
//!
//! Windows driver host (pnputil) and system restore points (PowerShell).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, warn};

use crate::engine::error::{EngineError, Result};
use crate::engine::installer::{DriverHost, RestorePointService};
use crate::engine::model::{DeviceRecord, RestorePointId};
use crate::engine::version::DriverVersion;

/// Supported platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
    Unknown,
}

impl Platform {
    /// Detect current platform
    pub fn current() -> Self {
        #[cfg(target_os = "macos")]
        return Platform::MacOS;

        #[cfg(target_os = "linux")]
        return Platform::Linux;

        #[cfg(target_os = "windows")]
        return Platform::Windows;

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        return Platform::Unknown;
    }

    /// Whether drivers can actually be installed here
    pub fn supports_install(&self) -> bool {
        matches!(self, Platform::Windows)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::MacOS => "macOS",
            Platform::Linux => "Linux",
            Platform::Windows => "Windows",
            Platform::Unknown => "Unknown",
        }
    }
}

async fn run(program: &Path, args: &[String]) -> Result<String> {
    debug!(program = %program.display(), ?args, "Running host command");
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::InstallerFailed(format!(
            "{} exited with {:?}: {}",
            program.display(),
            output.status.code(),
            if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() }
        )));
    }
    Ok(stdout)
}

/// Value of the first `Key: value` line in a pnputil block.
fn field<'a>(block: &'a str, key: &str) -> Option<&'a str> {
    block.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim().eq_ignore_ascii_case(key)).then(|| v.trim()).filter(|v| !v.is_empty())
    })
}

/// Published INF bound to a device, from `pnputil /enum-devices /instanceid <id>`.
pub fn parse_bound_inf(enum_devices: &str) -> Option<String> {
    field(enum_devices, "Driver Name").map(str::to_string)
}

/// Version of a published INF, from `pnputil /enum-drivers`.
pub fn parse_driver_version(enum_drivers: &str, published_name: &str) -> Result<Option<DriverVersion>> {
    let text = enum_drivers.replace("\r\n", "\n");
    let block = text
        .split("\n\n")
        .find(|b| field(b, "Published Name").is_some_and(|n| n.eq_ignore_ascii_case(published_name)));
    match block.and_then(|b| field(b, "Driver Version")) {
        Some(text) => Ok(Some(DriverVersion::parse_driver_ver(text)?)),
        None => Ok(None),
    }
}

/// `pnputil /enum-devices` arguments selecting one device, by instance ID
/// when the scan captured it and by hardware ID otherwise.
pub fn device_query(device: &DeviceRecord) -> Vec<String> {
    match &device.instance_id {
        Some(instance_id) => vec!["/enum-devices".into(), "/instanceid".into(), instance_id.clone()],
        None => vec!["/enum-devices".into(), "/deviceid".into(), device.hardware_id.to_string()],
    }
}

/// Driver store access through pnputil.
pub struct WindowsHost {
    pnputil: PathBuf,
}

impl WindowsHost {
    pub fn new() -> Self {
        let pnputil = which::which("pnputil").unwrap_or_else(|_| PathBuf::from("pnputil"));
        Self { pnputil }
    }

    /// INF currently bound to the device, queried live so a freshly
    /// published `oemNN.inf` is seen after an install.
    async fn bound_inf(&self, device: &DeviceRecord) -> Result<Option<String>> {
        match run(&self.pnputil, &device_query(device)).await {
            Ok(output) => Ok(parse_bound_inf(&output)),
            Err(e) if device.instance_id.is_none() => {
                // pnputil builds without /deviceid
                warn!(device = %device.hardware_id, error = %e, "Device lookup by hardware ID failed, using scanned INF");
                Ok(device.inf_name.clone())
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for WindowsHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverHost for WindowsHost {
    async fn installed_version(&self, device: &DeviceRecord) -> Result<Option<DriverVersion>> {
        let Some(inf) = self.bound_inf(device).await? else {
            return Ok(None);
        };
        let output = run(&self.pnputil, &["/enum-drivers".into()]).await?;
        parse_driver_version(&output, &inf)
    }

    async fn export_driver(&self, device: &DeviceRecord, dest: &Path) -> Result<()> {
        let inf = self.bound_inf(device).await?.ok_or_else(|| {
            EngineError::BackupFailed(format!("no bound driver found for {}", device.hardware_id))
        })?;
        run(
            &self.pnputil,
            &["/export-driver".into(), inf, dest.display().to_string()],
        )
        .await?;
        Ok(())
    }

    async fn reapply_driver(&self, _device: &DeviceRecord, source: &Path) -> Result<()> {
        let pattern = source.join("*.inf");
        run(
            &self.pnputil,
            &[
                "/add-driver".into(),
                pattern.display().to_string(),
                "/subdirs".into(),
                "/install".into(),
            ],
        )
        .await
        .map_err(|e| EngineError::RollbackFailed(e.to_string()))?;
        Ok(())
    }
}

/// System restore points through the PowerShell cmdlets.
pub struct PowerShellRestorePoints {
    powershell: PathBuf,
}

impl PowerShellRestorePoints {
    pub fn new() -> Self {
        let powershell = which::which("powershell").unwrap_or_else(|_| PathBuf::from("powershell"));
        Self { powershell }
    }

    async fn script(&self, script: String) -> Result<String> {
        run(
            &self.powershell,
            &["-NoProfile".into(), "-NonInteractive".into(), "-Command".into(), script],
        )
        .await
    }
}

impl Default for PowerShellRestorePoints {
    fn default() -> Self {
        Self::new()
    }
}

/// Last non-empty line as a restore point sequence number.
pub fn parse_sequence_number(output: &str) -> Option<RestorePointId> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .filter(|line| line.chars().all(|c| c.is_ascii_digit()))
        .map(|line| RestorePointId(line.to_string()))
}

#[async_trait]
impl RestorePointService for PowerShellRestorePoints {
    async fn create(&self, description: &str) -> Result<RestorePointId> {
        let description = description.replace('\'', "''");
        let script = format!(
            "Checkpoint-Computer -Description '{}' -RestorePointType MODIFY_SETTINGS; \
             (Get-ComputerRestorePoint | Sort-Object SequenceNumber | Select-Object -Last 1).SequenceNumber",
            description
        );
        let output = self.script(script).await?;
        parse_sequence_number(&output)
            .ok_or_else(|| EngineError::InstallerFailed("restore point sequence number not reported".into()))
    }

    async fn restore(&self, id: &RestorePointId) -> Result<()> {
        if !id.0.chars().all(|c| c.is_ascii_digit()) {
            return Err(EngineError::RollbackFailed(format!("invalid restore point id {:?}", id.0)));
        }
        self.script(format!("Restore-Computer -RestorePoint {} -Confirm:$false", id.0))
            .await
            .map_err(|e| EngineError::RollbackFailed(e.to_string()))?;
        Ok(())
    }
}
