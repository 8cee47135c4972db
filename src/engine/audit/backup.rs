//! Pre-Install Driver Backups
//!
//! Immutable snapshots of a device's bound driver, taken before every
//! install and referenced by id from installation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::engine::error::{EngineError, Result};
use crate::engine::installer::DriverHost;
use crate::engine::model::{DeviceRecord, HardwareId};
use crate::engine::version::DriverVersion;

const META_FILE: &str = "backup.json";
const PAYLOAD_DIR: &str = "driver";

/// Metadata for a backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub hardware_id: HardwareId,
    pub device_name: String,
    /// Driver version at backup time; `None` when the device had no driver
    pub version: Option<DriverVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inf_name: Option<String>,
    /// Files included, relative to the payload directory
    pub files: Vec<String>,
    pub total_size: u64,
    /// SHA-256 over file names and contents
    pub checksum: String,
}

impl BackupSnapshot {
    pub fn is_empty(&self) -> bool {
        self.version.is_none()
    }
}

pub struct DriverBackupStore {
    backup_dir: PathBuf,
}

impl DriverBackupStore {
    pub fn new(backup_dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(backup_dir)?;
        Ok(Self {
            backup_dir: backup_dir.to_path_buf(),
        })
    }

    pub fn payload_dir(&self, backup_id: &str) -> PathBuf {
        self.backup_dir.join(backup_id).join(PAYLOAD_DIR)
    }

    /// Snapshot the device's current driver through the host.
    pub async fn capture(&self, device: &DeviceRecord, host: &dyn DriverHost) -> Result<BackupSnapshot> {
        let id = format!(
            "{}-{}-{}",
            device.hardware_id.short_id(),
            Utc::now().format("%Y%m%d-%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let backup_path = self.backup_dir.join(&id);
        let payload = backup_path.join(PAYLOAD_DIR);
        fs::create_dir_all(&payload).map_err(|e| EngineError::BackupFailed(e.to_string()))?;

        if device.installed_version.is_some() {
            if let Err(e) = host.export_driver(device, &payload).await {
                let _ = fs::remove_dir_all(&backup_path);
                return Err(EngineError::BackupFailed(e.to_string()));
            }
        }

        let snapshot = async {
            let ((files, total_size), checksum) = scan_payload(payload).await?;
            let snapshot = BackupSnapshot {
                id: id.clone(),
                created_at: Utc::now(),
                hardware_id: device.hardware_id.clone(),
                device_name: device.name.clone(),
                version: device.installed_version.clone(),
                provider: device.provider.clone(),
                inf_name: device.inf_name.clone(),
                files,
                total_size,
                checksum,
            };
            let meta_content = serde_json::to_string_pretty(&snapshot)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            fs::write(backup_path.join(META_FILE), meta_content)?;
            Ok::<_, std::io::Error>(snapshot)
        }
        .await
        .map_err(|e| {
            let _ = fs::remove_dir_all(&backup_path);
            EngineError::BackupFailed(e.to_string())
        })?;

        info!(backup = %snapshot.id, device = %device.hardware_id, files = snapshot.files.len(), "Driver backup created");
        Ok(snapshot)
    }

    pub fn load(&self, backup_id: &str) -> Result<BackupSnapshot> {
        let meta_path = self.backup_dir.join(backup_id).join(META_FILE);
        let content = fs::read_to_string(&meta_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// List all backups, newest first
    pub fn list(&self) -> Result<Vec<BackupSnapshot>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let path = entry?.path();
            let meta_path = path.join(META_FILE);
            if path.is_dir() && meta_path.exists() {
                let content = fs::read_to_string(&meta_path)?;
                match serde_json::from_str(&content) {
                    Ok(backup) => backups.push(backup),
                    Err(e) => warn!(path = %meta_path.display(), error = %e, "Skipping unreadable backup"),
                }
            }
        }
        backups.sort_by(|a: &BackupSnapshot, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Verify a backup's integrity
    pub async fn verify(&self, snapshot: &BackupSnapshot) -> Result<bool> {
        let (_, current) = scan_payload(self.payload_dir(&snapshot.id)).await?;
        Ok(current == snapshot.checksum)
    }

    /// Reinstall the backed-up driver after checking the snapshot is intact.
    pub async fn reapply(
        &self,
        snapshot: &BackupSnapshot,
        device: &DeviceRecord,
        host: &dyn DriverHost,
    ) -> Result<()> {
        if snapshot.is_empty() {
            return Err(EngineError::RollbackFailed(
                "backup holds no driver to reapply".to_string(),
            ));
        }
        if !self.verify(snapshot).await? {
            return Err(EngineError::RollbackFailed(format!(
                "backup {} failed verification: checksum mismatch",
                snapshot.id
            )));
        }
        host.reapply_driver(device, &self.payload_dir(&snapshot.id)).await
    }
}

/// File listing and checksum of a payload, computed on the blocking pool.
async fn scan_payload(payload: PathBuf) -> std::io::Result<((Vec<String>, u64), String)> {
    tokio::task::spawn_blocking(move || Ok((list_files(&payload)?, calculate_dir_checksum(&payload)?)))
        .await
        .map_err(|e| std::io::Error::other(format!("backup scan task failed: {}", e)))?
}

/// Relative file names (sorted) and their total size.
fn list_files(dir: &Path) -> std::io::Result<(Vec<String>, u64)> {
    let mut files = Vec::new();
    let mut total_size = 0u64;
    for path in walk(dir)? {
        total_size += fs::metadata(&path)?.len();
        let relative = path.strip_prefix(dir).unwrap_or(&path);
        files.push(relative.to_string_lossy().replace('\\', "/"));
    }
    Ok((files, total_size))
}

/// SHA-256 over every file's relative name and content, in sorted order.
fn calculate_dir_checksum(dir: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    for path in walk(dir)? {
        let relative = path.strip_prefix(dir).unwrap_or(&path);
        hasher.update(relative.to_string_lossy().replace('\\', "/").as_bytes());
        hasher.update([0u8]);
        let mut file = File::open(&path)?;
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

fn walk(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            files.extend(walk(&path)?);
        } else {
            files.push(path);
        }
    }
    Ok(files)
}
