//! Hamster Configuration Module
//! Handles loading and validating hamster.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::error::EngineError;
use super::model::DeviceClass;

pub const CONFIG_FILE: &str = "hamster.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
    #[error("Could not determine a data directory")]
    NoDataDir,
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub policy: UpdatePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// SQLite catalog, relative paths resolve against the data directory
    #[serde(default = "default_local_db")]
    pub local_db: PathBuf,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Upper bound on parallel segments per package
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
    /// Packages smaller than two segments of this size go single-stream
    #[serde(default = "default_min_segment_size")]
    pub min_segment_size: u64,
    /// Attempts per segment (and per single-stream transfer)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_install_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub create_restore_point: bool,
    /// Also hold a lock file so separate processes never install at once
    #[serde(default = "default_true")]
    pub cross_process_lock: bool,
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default)]
    pub publishers: Vec<TrustedPublisher>,
    /// INF packages always need a trusted signature; this extends it to EXE installers
    #[serde(default = "default_true")]
    pub require_signed_exe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPublisher {
    pub name: String,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
}

/// Knobs for one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Devices downloading/verifying at once; installs are always one at a time
    #[serde(default = "default_parallel_transfers")]
    pub max_parallel_transfers: usize,
    #[serde(default = "default_true")]
    pub redownload_on_hash_mismatch: bool,
    /// Only consider these device classes (all when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<DeviceClass>>,
}

fn default_true() -> bool { true }
fn default_local_db() -> PathBuf { PathBuf::from("catalog.db") }
fn default_remote_timeout() -> u64 { 15 }
fn default_max_segments() -> usize { 4 }
fn default_min_segment_size() -> u64 { 1024 * 1024 }
fn default_max_attempts() -> u32 { 4 }
fn default_backoff_base_ms() -> u64 { 250 }
fn default_backoff_max_ms() -> u64 { 8_000 }
fn default_connect_timeout() -> u64 { 10 }
fn default_read_timeout() -> u64 { 60 }
fn default_user_agent() -> String { format!("Hamster/{}", env!("CARGO_PKG_VERSION")) }
fn default_install_timeout() -> u64 { 900 }
fn default_lock_wait() -> u64 { 3_600 }
fn default_parallel_transfers() -> usize { 3 }

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            local_db: default_local_db(),
            remote_url: None,
            remote_timeout_secs: default_remote_timeout(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_segments: default_max_segments(),
            min_segment_size: default_min_segment_size(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl DownloadConfig {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_install_timeout(),
            create_restore_point: true,
            cross_process_lock: true,
            lock_wait_secs: default_lock_wait(),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            publishers: Vec::new(),
            require_signed_exe: true,
        }
    }
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            max_parallel_transfers: default_parallel_transfers(),
            redownload_on_hash_mismatch: true,
            classes: None,
        }
    }
}

impl Config {
    /// Load `hamster.config.json` from a data directory; a missing file yields defaults.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = data_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(data_dir)?;
        let config_path = data_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download.max_segments == 0 {
            return Err(ConfigError::Invalid("download.max_segments must be at least 1".into()));
        }
        if self.download.max_attempts == 0 {
            return Err(ConfigError::Invalid("download.max_attempts must be at least 1".into()));
        }
        if self.policy.max_parallel_transfers == 0 {
            return Err(ConfigError::Invalid("policy.max_parallel_transfers must be at least 1".into()));
        }
        if self.install.timeout_secs == 0 {
            return Err(ConfigError::Invalid("install.timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Filesystem layout under the data directory.
#[derive(Debug, Clone)]
pub struct Layout {
    base_dir: PathBuf,
}

impl Layout {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Linux: ~/.local/share/Hamster, Windows: %LOCALAPPDATA%\Hamster
    pub fn default_base_dir() -> Result<PathBuf, ConfigError> {
        dirs::data_local_dir()
            .map(|dir| dir.join("Hamster"))
            .ok_or(ConfigError::NoDataDir)
    }

    pub fn init(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.downloads_dir())?;
        std::fs::create_dir_all(self.backups_dir())?;
        std::fs::create_dir_all(self.locks_dir())?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base_dir.join("backups")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.base_dir.join("locks")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.base_dir.join("records").join("installations.jsonl")
    }

    pub fn catalog_path(&self, config: &CatalogConfig) -> PathBuf {
        if config.local_db.is_absolute() {
            config.local_db.clone()
        } else {
            self.base_dir.join(&config.local_db)
        }
    }
}
