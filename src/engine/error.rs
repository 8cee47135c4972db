//! Engine Error Types

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Stable classification of every failure the engine can report.
///
/// Carried on `InstallationRecord`s so a reader can tell what happened
/// without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnparseableVersion,
    CatalogUnavailable,
    NetworkUnavailable,
    TransferFailed,
    IntegrityMismatch,
    HashMismatch,
    UntrustedSignature,
    BackupFailed,
    InstallTimeout,
    InstallerFailed,
    PostInstallMismatch,
    UnknownOutcome,
    RollbackFailed,
    Cancelled,
    Storage,
    Config,
    Io,
}

impl ErrorKind {
    /// Kinds that leave a device in a state a human has to look at.
    pub fn needs_attention(&self) -> bool {
        matches!(self, ErrorKind::RollbackFailed | ErrorKind::UnknownOutcome)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::UnparseableVersion => "unparseable_version",
            ErrorKind::CatalogUnavailable => "catalog_unavailable",
            ErrorKind::NetworkUnavailable => "network_unavailable",
            ErrorKind::TransferFailed => "transfer_failed",
            ErrorKind::IntegrityMismatch => "integrity_mismatch",
            ErrorKind::HashMismatch => "hash_mismatch",
            ErrorKind::UntrustedSignature => "untrusted_signature",
            ErrorKind::BackupFailed => "backup_failed",
            ErrorKind::InstallTimeout => "install_timeout",
            ErrorKind::InstallerFailed => "installer_failed",
            ErrorKind::PostInstallMismatch => "post_install_mismatch",
            ErrorKind::UnknownOutcome => "unknown_outcome",
            ErrorKind::RollbackFailed => "rollback_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unparseable driver version: {0:?}")]
    UnparseableVersion(String),

    #[error("Invalid hardware ID: {0:?}")]
    InvalidHardwareId(String),

    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    IntegrityMismatch { expected: u64, actual: u64 },

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Untrusted signature: {0}")]
    UntrustedSignature(String),

    #[error("Driver backup failed: {0}")]
    BackupFailed(String),

    #[error("Installer did not finish within {0}s")]
    InstallTimeout(u64),

    #[error("Installer failed: {0}")]
    InstallerFailed(String),

    #[error("Post-install check expected {expected}, found {found}")]
    PostInstallMismatch { expected: String, found: String },

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Catalog store error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Install lock unavailable: {0}")]
    Locked(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::UnparseableVersion(_) => ErrorKind::UnparseableVersion,
            EngineError::CatalogUnavailable(_) => ErrorKind::CatalogUnavailable,
            EngineError::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,
            EngineError::TransferFailed(_) => ErrorKind::TransferFailed,
            EngineError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            EngineError::HashMismatch { .. } => ErrorKind::HashMismatch,
            EngineError::UntrustedSignature(_) => ErrorKind::UntrustedSignature,
            EngineError::BackupFailed(_) => ErrorKind::BackupFailed,
            EngineError::InstallTimeout(_) => ErrorKind::InstallTimeout,
            EngineError::InstallerFailed(_) => ErrorKind::InstallerFailed,
            EngineError::PostInstallMismatch { .. } => ErrorKind::PostInstallMismatch,
            EngineError::RollbackFailed(_) => ErrorKind::RollbackFailed,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Storage(_) | EngineError::Locked(_) => ErrorKind::Storage,
            EngineError::InvalidHardwareId(_)
            | EngineError::Config(_)
            | EngineError::InvalidTransition { .. } => ErrorKind::Config,
            EngineError::Io(_) | EngineError::Json(_) => ErrorKind::Io,
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Self::NetworkUnavailable(e.to_string())
        } else {
            Self::TransferFailed(e.to_string())
        }
    }
}

impl From<r2d2::Error> for EngineError {
    fn from(e: r2d2::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
