//! Install Gate
//!
//! At most one driver installation at a time: a single-permit semaphore
//! inside the process, plus an optional lock file shared between processes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::error::{EngineError, Result};

pub const INSTALL_LOCK_FILE: &str = "install.lock";

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Information stored in a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub description: String,
}

impl LockInfo {
    pub fn new(description: &str) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            description: description.to_string(),
        }
    }

    /// Check if the process that created the lock is still running
    pub fn is_process_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return true;
        }

        #[cfg(unix)]
        {
            use std::process::Command;
            Command::new("kill")
                .args(["-0", &self.pid.to_string()])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }

        #[cfg(windows)]
        {
            use std::process::Command;
            Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", self.pid)])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&self.pid.to_string()))
                .unwrap_or(false)
        }

        #[cfg(not(any(unix, windows)))]
        true
    }
}

#[derive(Clone)]
pub struct InstallGate {
    permits: Arc<Semaphore>,
    lock_path: Option<PathBuf>,
    lock_wait: Duration,
}

impl InstallGate {
    /// In-process exclusion only.
    pub fn local() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            lock_path: None,
            lock_wait: Duration::ZERO,
        }
    }

    /// Also exclude other processes through `<locks_dir>/install.lock`.
    pub fn with_lock_file(locks_dir: &Path, lock_wait: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            lock_path: Some(locks_dir.join(INSTALL_LOCK_FILE)),
            lock_wait,
        }
    }

    /// Wait for the gate. Waiting is abandoned when `cancel` fires.
    pub async fn acquire(&self, description: &str, cancel: &CancellationToken) -> Result<InstallPermit> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| EngineError::Locked("install gate closed".to_string()))?
            }
        };

        let lock_file = match &self.lock_path {
            Some(path) => Some(self.acquire_file(path, description, cancel).await?),
            None => None,
        };

        Ok(InstallPermit {
            _permit: permit,
            _lock_file: lock_file,
        })
    }

    async fn acquire_file(&self, path: &Path, description: &str, cancel: &CancellationToken) -> Result<LockFileGuard> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let deadline = tokio::time::Instant::now() + self.lock_wait;

        loop {
            match try_create(path, description) {
                Ok(guard) => return Ok(guard),
                Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => return Err(e.into()),
                Err(_) => {}
            }

            match read_lock(path) {
                Some(existing) if existing.is_process_alive() => {
                    debug!(pid = existing.pid, "Install lock held by another process");
                    if tokio::time::Instant::now() >= deadline {
                        return Err(EngineError::Locked(format!(
                            "held by PID {}: {}",
                            existing.pid, existing.description
                        )));
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
                stale => {
                    // Dead owner or unreadable file
                    warn!(path = %path.display(), pid = ?stale.map(|s| s.pid), "Removing stale install lock");
                    let _ = fs::remove_file(path);
                }
            }
        }
    }
}

fn try_create(path: &Path, description: &str) -> std::io::Result<LockFileGuard> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let content = serde_json::to_string_pretty(&LockInfo::new(description))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    file.write_all(content.as_bytes())?;
    Ok(LockFileGuard {
        lock_path: path.to_path_buf(),
    })
}

/// Read a lock file
fn read_lock(path: &Path) -> Option<LockInfo> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

/// RAII guard that releases lock on drop
struct LockFileGuard {
    lock_path: PathBuf,
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Held for the whole installation transaction; released on drop.
pub struct InstallPermit {
    _permit: OwnedSemaphorePermit,
    _lock_file: Option<LockFileGuard>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_single_holder() {
        let gate = InstallGate::local();
        let cancel = CancellationToken::new();
        let permit = gate.acquire("first", &cancel).await.unwrap();

        let waiting = gate.clone();
        let second = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            waiting.acquire("second", &cancel).await.map(|_| ())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        drop(permit);
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let gate = InstallGate::local();
        let _held = gate.acquire("first", &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(gate.acquire("second", &cancel).await, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_lock_file_lifecycle() {
        let dir = tempdir().unwrap();
        let gate = InstallGate::with_lock_file(dir.path(), Duration::ZERO);
        let lock_path = dir.path().join(INSTALL_LOCK_FILE);

        let permit = gate.acquire("installing", &CancellationToken::new()).await.unwrap();
        let info = read_lock(&lock_path).unwrap();
        assert_eq!(info.pid, std::process::id());
        drop(permit);
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_live_foreign_lock_times_out() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join(INSTALL_LOCK_FILE);
        // Our own pid counts as alive, standing in for another live process
        fs::write(&lock_path, serde_json::to_string(&LockInfo::new("other run")).unwrap()).unwrap();

        let gate = InstallGate::with_lock_file(dir.path(), Duration::ZERO);
        let err = gate.acquire("installing", &CancellationToken::new()).await.err().unwrap();
        assert!(matches!(err, EngineError::Locked(_)));
        assert!(lock_path.exists());
    }

    #[tokio::test]
    async fn test_unreadable_lock_is_stale() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(INSTALL_LOCK_FILE), "garbage").unwrap();

        let gate = InstallGate::with_lock_file(dir.path(), Duration::ZERO);
        assert!(gate.acquire("installing", &CancellationToken::new()).await.is_ok());
    }
}
