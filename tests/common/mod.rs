//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use hamster_lib::engine::audit::DriverBackupStore;
use hamster_lib::engine::catalog::{CatalogResolver, LocalCatalog};
use hamster_lib::engine::config::{DownloadConfig, TrustConfig, TrustedPublisher};
use hamster_lib::engine::error::{EngineError, Result};
use hamster_lib::engine::installer::{
    DriverHost, InstallationEngine, InstallerInvoker, InstallerReport, PackageInstaller, RecordSink,
    RestorePointService,
};
use hamster_lib::engine::locks::InstallGate;
use hamster_lib::engine::model::{
    CatalogListing, DeviceClass, DeviceRecord, DriverPackage, HardwareId, InstallationRecord, Locator,
    PackageKind, RestorePointId, SignatureInfo,
};
use hamster_lib::engine::updater::{calculate_sha256, Downloader, Progress, VerificationGate};
use hamster_lib::engine::version::DriverVersion;
use hamster_lib::engine::UpdateOrchestrator;

pub const PUBLISHER: &str = "Realtek";

pub fn version(text: &str) -> DriverVersion {
    DriverVersion::parse(text).unwrap()
}

pub fn hwid(text: &str) -> HardwareId {
    HardwareId::parse(text).unwrap()
}

pub fn device(hardware_id: &str, installed: Option<&str>) -> DeviceRecord {
    let device = DeviceRecord::new(hwid(hardware_id), DeviceClass::Network, "Realtek PCIe GbE");
    match installed {
        Some(v) => device.with_driver(version(v), PUBLISHER),
        None => device,
    }
}

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

pub fn trust() -> TrustConfig {
    TrustConfig {
        publishers: vec![TrustedPublisher {
            name: PUBLISHER.to_string(),
            public_key: hex::encode(signing_key().verifying_key().to_bytes()),
        }],
        require_signed_exe: true,
    }
}

pub fn sign(sha256_hex: &str) -> SignatureInfo {
    let digest = hex::decode(sha256_hex).unwrap();
    SignatureInfo {
        publisher: PUBLISHER.to_string(),
        signature: hex::encode(signing_key().sign(&digest).to_bytes()),
    }
}

/// Driver store double: tracks the bound version per hardware ID.
#[derive(Default)]
pub struct ScriptedHost {
    pub versions: Mutex<HashMap<String, Option<DriverVersion>>>,
    pub fail_export: bool,
    pub fail_reapply: bool,
    pub reapplied: AtomicUsize,
}

impl ScriptedHost {
    pub fn set_version(&self, hardware_id: &HardwareId, version: Option<DriverVersion>) {
        self.versions.lock().unwrap().insert(hardware_id.to_string(), version);
    }

    pub fn version_of(&self, hardware_id: &HardwareId) -> Option<DriverVersion> {
        self.versions.lock().unwrap().get(&hardware_id.to_string()).cloned().flatten()
    }
}

#[async_trait]
impl DriverHost for ScriptedHost {
    async fn installed_version(&self, device: &DeviceRecord) -> Result<Option<DriverVersion>> {
        let versions = self.versions.lock().unwrap();
        Ok(match versions.get(&device.hardware_id.to_string()) {
            Some(version) => version.clone(),
            None => device.installed_version.clone(),
        })
    }

    async fn export_driver(&self, _device: &DeviceRecord, dest: &Path) -> Result<()> {
        if self.fail_export {
            return Err(EngineError::BackupFailed("export refused".into()));
        }
        std::fs::write(dest.join("rt640x64.inf"), "[Version]\nDriverVer=01/01/2023,1.0.0\n")?;
        Ok(())
    }

    async fn reapply_driver(&self, device: &DeviceRecord, _source: &Path) -> Result<()> {
        if self.fail_reapply {
            return Err(EngineError::RollbackFailed("pnputil refused the package".into()));
        }
        self.reapplied.fetch_add(1, Ordering::SeqCst);
        self.set_version(&device.hardware_id, device.installed_version.clone());
        Ok(())
    }
}

/// What the installer does when run against a given package file.
#[derive(Clone)]
pub struct Script {
    pub exit_code: Option<i32>,
    /// Version the device reports afterwards; `None` leaves it untouched
    pub installs: Option<(HardwareId, DriverVersion)>,
    pub delay: Duration,
}

impl Script {
    pub fn installs(hardware_id: &str, to: &str, exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            installs: Some((hwid(hardware_id), version(to))),
            delay: Duration::ZERO,
        }
    }

    pub fn exits(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            installs: None,
            delay: Duration::ZERO,
        }
    }
}

pub struct ScriptedInvoker {
    host: Arc<ScriptedHost>,
    scripts: Mutex<HashMap<String, Script>>,
    pub invocations: AtomicUsize,
    running: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl ScriptedInvoker {
    pub fn new(host: Arc<ScriptedHost>) -> Self {
        Self {
            host,
            scripts: Mutex::new(HashMap::new()),
            invocations: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, file_name: &str, script: Script) {
        self.scripts.lock().unwrap().insert(file_name.to_string(), script);
    }
}

#[async_trait]
impl InstallerInvoker for ScriptedInvoker {
    async fn invoke(&self, installer: &PackageInstaller) -> Result<InstallerReport> {
        let path = match installer {
            PackageInstaller::Inf { inf_path } => inf_path,
            PackageInstaller::Exe { path, .. } => path,
        };
        assert!(path.exists(), "installer ran without its package");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| panic!("no script for {}", name));

        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(script.delay).await;
        if let Some((hardware_id, version)) = &script.installs {
            self.host.set_version(hardware_id, Some(version.clone()));
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        Ok(InstallerReport {
            exit_code: script.exit_code,
            elapsed: script.delay,
            output: String::new(),
        })
    }
}

/// Restore point double; restoring puts `restores_to` back on the host.
pub struct ScriptedRestorePoints {
    host: Arc<ScriptedHost>,
    pub restores_to: Mutex<Option<(HardwareId, Option<DriverVersion>)>>,
    pub created: AtomicUsize,
    pub restored: AtomicUsize,
}

impl ScriptedRestorePoints {
    pub fn new(host: Arc<ScriptedHost>) -> Self {
        Self {
            host,
            restores_to: Mutex::new(None),
            created: AtomicUsize::new(0),
            restored: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RestorePointService for ScriptedRestorePoints {
    async fn create(&self, _description: &str) -> Result<RestorePointId> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RestorePointId(n.to_string()))
    }

    async fn restore(&self, _id: &RestorePointId) -> Result<()> {
        self.restored.fetch_add(1, Ordering::SeqCst);
        match self.restores_to.lock().unwrap().clone() {
            Some((hardware_id, version)) => {
                self.host.set_version(&hardware_id, version);
                Ok(())
            }
            None => Err(EngineError::RollbackFailed("restore point unavailable".into())),
        }
    }
}

#[derive(Default)]
pub struct MemorySink {
    pub records: Mutex<Vec<InstallationRecord>>,
}

impl RecordSink for MemorySink {
    fn append(&self, record: &InstallationRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// A scratch data directory with a local catalog and scripted collaborators.
pub struct Harness {
    pub dir: TempDir,
    pub catalog: Arc<LocalCatalog>,
    pub host: Arc<ScriptedHost>,
    pub invoker: Arc<ScriptedInvoker>,
    pub restore_points: Arc<ScriptedRestorePoints>,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_host(ScriptedHost::default())
    }

    pub fn with_host(host: ScriptedHost) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(LocalCatalog::open(&dir.path().join("catalog.db")).unwrap());
        let host = Arc::new(host);
        Self {
            invoker: Arc::new(ScriptedInvoker::new(Arc::clone(&host))),
            restore_points: Arc::new(ScriptedRestorePoints::new(Arc::clone(&host))),
            sink: Arc::new(MemorySink::default()),
            dir,
            catalog,
            host,
        }
    }

    pub fn source_dir(&self) -> PathBuf {
        let dir = self.dir.path().join("source");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write a signed package to disk and list it in the local catalog.
    pub fn publish(&self, file_name: &str, hardware_id: &str, version: &str, kind: PackageKind) -> CatalogListing {
        let path = self.source_dir().join(file_name);
        std::fs::write(&path, format!("{} {} {}", file_name, hardware_id, version).repeat(64)).unwrap();
        let sha256 = calculate_sha256(&path).unwrap();
        let listing = CatalogListing {
            version: version.to_string(),
            release_date: None,
            package: DriverPackage {
                hardware_id: hwid(hardware_id),
                provider: PUBLISHER.to_string(),
                locator: Locator::File(path.clone()),
                size: Some(std::fs::metadata(&path).unwrap().len()),
                signature: Some(sign(&sha256)),
                sha256,
                kind,
            },
        };
        self.catalog.import_listings(std::slice::from_ref(&listing)).unwrap();
        listing
    }

    pub fn records(&self) -> Vec<InstallationRecord> {
        self.sink.records.lock().unwrap().clone()
    }

    pub fn orchestrator(&self, restore_points: bool) -> UpdateOrchestrator {
        self.build(restore_points, Duration::from_secs(5), Progress::silent())
    }

    pub fn build(&self, restore_points: bool, timeout: Duration, progress: Progress) -> UpdateOrchestrator {
        let resolver = CatalogResolver::new(self.catalog.clone(), None);
        let downloader = Downloader::new(DownloadConfig::default()).unwrap();
        let verifier = VerificationGate::new(&trust()).unwrap();
        let backups = Arc::new(DriverBackupStore::new(&self.dir.path().join("backups")).unwrap());
        let mut engine = InstallationEngine::new(
            self.host.clone(),
            self.invoker.clone(),
            backups,
            self.sink.clone(),
        )
        .with_timeout(timeout)
        .with_progress(progress.clone());
        if restore_points {
            engine = engine.with_restore_points(self.restore_points.clone());
        }
        UpdateOrchestrator::new(
            resolver,
            downloader,
            verifier,
            engine,
            InstallGate::local(),
            self.dir.path().join("downloads"),
        )
        .with_progress(progress)
    }
}
