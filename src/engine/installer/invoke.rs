//! Installer Invocation
//!
//! Package kinds map to a closed set of installer variants, each with its
//! own exit-code interpretation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::debug;

use super::host::InstallerInvoker;
use crate::engine::error::{EngineError, Result};
use crate::engine::model::PackageKind;
use crate::engine::updater::ApprovedPackage;

/// Switches understood by the common setup frameworks (NSIS, Inno Setup).
pub const EXE_SILENT_ARGS: &[&str] = &["/S", "/VERYSILENT", "/NORESTART"];

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_REBOOT_REQUIRED: i32 = 3010;
pub const EXIT_REBOOT_INITIATED: i32 = 1641;

/// Standard Windows Installer failure codes
const EXE_FAILURE_CODES: &[i32] = &[
    1602, // user cancelled
    1603, // fatal error during installation
    1618, // another installation in progress
    1619, // package could not be opened
    1620, // package invalid
    1633, // platform unsupported
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageInstaller {
    /// Stage and install an INF package with pnputil
    Inf { inf_path: PathBuf },
    /// Run a vendor setup executable silently
    Exe { path: PathBuf, args: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    Success,
    SuccessRebootRequired,
    Failure,
    /// Not a code this installer kind is known to return
    Unrecognized,
}

impl PackageInstaller {
    pub fn for_package(package: &ApprovedPackage) -> Self {
        match package.kind() {
            PackageKind::Inf => PackageInstaller::Inf {
                inf_path: package.path().to_path_buf(),
            },
            PackageKind::Exe => PackageInstaller::Exe {
                path: package.path().to_path_buf(),
                args: EXE_SILENT_ARGS.iter().map(|a| a.to_string()).collect(),
            },
        }
    }

    pub fn kind(&self) -> PackageKind {
        match self {
            PackageInstaller::Inf { .. } => PackageKind::Inf,
            PackageInstaller::Exe { .. } => PackageKind::Exe,
        }
    }

    /// Interpret an exit code; `None` means the process died without one.
    pub fn classify(&self, exit_code: Option<i32>) -> ExitClass {
        let Some(code) = exit_code else {
            return ExitClass::Failure;
        };
        match code {
            EXIT_SUCCESS => ExitClass::Success,
            EXIT_REBOOT_REQUIRED | EXIT_REBOOT_INITIATED => ExitClass::SuccessRebootRequired,
            _ => match self {
                PackageInstaller::Inf { .. } => ExitClass::Failure,
                PackageInstaller::Exe { .. } if EXE_FAILURE_CODES.contains(&code) => ExitClass::Failure,
                PackageInstaller::Exe { .. } => ExitClass::Unrecognized,
            },
        }
    }
}

/// What the installer process reported.
#[derive(Debug, Clone)]
pub struct InstallerReport {
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    /// Combined stdout/stderr, trimmed
    pub output: String,
}

/// Runs installers as child processes.
///
/// A child whose wait is dropped (installer timeout) is killed, so the
/// install gate is never released while it still runs.
pub struct SystemInstaller {
    pnputil: PathBuf,
}

impl SystemInstaller {
    pub fn new() -> Self {
        let pnputil = which::which("pnputil").unwrap_or_else(|_| PathBuf::from("pnputil"));
        Self { pnputil }
    }

    fn command(&self, installer: &PackageInstaller) -> tokio::process::Command {
        match installer {
            PackageInstaller::Inf { inf_path } => {
                let mut cmd = tokio::process::Command::new(&self.pnputil);
                cmd.arg("/add-driver").arg(inf_path).arg("/install");
                cmd
            }
            PackageInstaller::Exe { path, args } => {
                let mut cmd = tokio::process::Command::new(path);
                cmd.args(args);
                cmd
            }
        }
    }
}

impl Default for SystemInstaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstallerInvoker for SystemInstaller {
    async fn invoke(&self, installer: &PackageInstaller) -> Result<InstallerReport> {
        let start = Instant::now();
        let output = self
            .command(installer)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::InstallerFailed(format!("failed to start installer: {}", e)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push('\n');
            text.push_str(stderr.trim());
        }

        let report = InstallerReport {
            exit_code: output.status.code(),
            elapsed: start.elapsed(),
            output: text,
        };
        debug!(kind = %installer.kind(), exit_code = ?report.exit_code, elapsed = ?report.elapsed, "Installer exited");
        Ok(report)
    }
}
