//! Cryptographic Verification
//!
//! SHA-256 content checks and Ed25519 publisher signatures. Only this gate
//! can produce an [`ApprovedPackage`], the sole input the installer accepts.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::config::TrustConfig;
use crate::engine::error::{EngineError, ErrorKind, Result};
use crate::engine::model::{CatalogEntry, DownloadResult, PackageKind};

/// Calculate SHA256 checksum of a file
pub fn calculate_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// A package that passed hash and signature checks.
#[derive(Debug, Clone)]
pub struct ApprovedPackage {
    path: PathBuf,
    kind: PackageKind,
    sha256: String,
    publisher: Option<String>,
}

impl ApprovedPackage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> PackageKind {
        self.kind
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn publisher(&self) -> Option<&str> {
        self.publisher.as_deref()
    }

    /// Remove the artifact once its plan is finished.
    pub fn discard(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    HashMismatch { expected: String, actual: String },
    UntrustedSignature(String),
}

impl RejectReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RejectReason::HashMismatch { .. } => ErrorKind::HashMismatch,
            RejectReason::UntrustedSignature(_) => ErrorKind::UntrustedSignature,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::HashMismatch { expected, actual } => {
                write!(f, "content hash mismatch: expected {}, got {}", expected, actual)
            }
            RejectReason::UntrustedSignature(reason) => write!(f, "untrusted signature: {}", reason),
        }
    }
}

impl From<RejectReason> for EngineError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::HashMismatch { expected, actual } => EngineError::HashMismatch { expected, actual },
            RejectReason::UntrustedSignature(reason) => EngineError::UntrustedSignature(reason),
        }
    }
}

#[derive(Debug)]
pub enum Verdict {
    Approved(ApprovedPackage),
    Rejected(RejectReason),
}

#[derive(Clone)]
pub struct VerificationGate {
    publishers: Arc<HashMap<String, VerifyingKey>>,
    require_signed_exe: bool,
}

impl VerificationGate {
    pub fn new(trust: &TrustConfig) -> Result<Self> {
        let mut publishers = HashMap::new();
        for publisher in &trust.publishers {
            let bytes = hex::decode(publisher.public_key.trim())
                .map_err(|e| EngineError::Config(format!("publisher {}: {}", publisher.name, e)))?;
            let key_bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                EngineError::Config(format!("publisher {}: key must be 32 bytes", publisher.name))
            })?;
            let key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| EngineError::Config(format!("publisher {}: invalid public key", publisher.name)))?;
            publishers.insert(publisher.name.to_lowercase(), key);
        }
        Ok(Self {
            publishers: Arc::new(publishers),
            require_signed_exe: trust.require_signed_exe,
        })
    }

    /// Check a downloaded artifact against its catalog entry.
    ///
    /// Rejected artifacts are deleted from disk.
    pub fn verify(&self, download: &DownloadResult, entry: &CatalogEntry) -> Result<Verdict> {
        let actual = calculate_sha256(&download.path)?;
        let expected = entry.package.sha256.trim().to_lowercase();

        let verdict = if actual != expected {
            Verdict::Rejected(RejectReason::HashMismatch { expected, actual })
        } else {
            match self.check_signature(&actual, entry) {
                Ok(publisher) => Verdict::Approved(ApprovedPackage {
                    path: download.path.clone(),
                    kind: entry.package.kind,
                    sha256: actual,
                    publisher,
                }),
                Err(reason) => Verdict::Rejected(reason),
            }
        };

        match &verdict {
            Verdict::Approved(package) => {
                info!(path = %package.path.display(), publisher = ?package.publisher, "Package approved");
            }
            Verdict::Rejected(reason) => {
                warn!(path = %download.path.display(), %reason, "Package rejected");
                let _ = std::fs::remove_file(&download.path);
            }
        }
        Ok(verdict)
    }

    /// [`verify`](Self::verify) on the blocking pool, off the async workers
    /// driving other transfers.
    pub async fn verify_blocking(&self, download: &DownloadResult, entry: &CatalogEntry) -> Result<Verdict> {
        let gate = self.clone();
        let (download, entry) = (download.clone(), entry.clone());
        tokio::task::spawn_blocking(move || gate.verify(&download, &entry))
            .await
            .map_err(|e| EngineError::TransferFailed(format!("verification task failed: {}", e)))?
    }

    fn check_signature(&self, digest_hex: &str, entry: &CatalogEntry) -> std::result::Result<Option<String>, RejectReason> {
        let required = match entry.package.kind {
            PackageKind::Inf => true,
            PackageKind::Exe => self.require_signed_exe,
        };

        let Some(info) = &entry.package.signature else {
            return if required {
                Err(RejectReason::UntrustedSignature(format!("{} package is unsigned", entry.package.kind)))
            } else {
                Ok(None)
            };
        };

        let Some(key) = self.publishers.get(&info.publisher.to_lowercase()) else {
            return Err(RejectReason::UntrustedSignature(format!(
                "publisher {:?} is not trusted",
                info.publisher
            )));
        };

        let sig_bytes = hex::decode(info.signature.trim())
            .map_err(|e| RejectReason::UntrustedSignature(format!("malformed signature: {}", e)))?;
        let sig_array: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| RejectReason::UntrustedSignature("signature must be 64 bytes".into()))?;
        let signature = Signature::from_bytes(&sig_array);

        let digest = hex::decode(digest_hex)
            .map_err(|e| RejectReason::UntrustedSignature(format!("bad digest: {}", e)))?;
        key.verify(&digest, &signature)
            .map_err(|_| RejectReason::UntrustedSignature(format!("signature by {:?} does not verify", info.publisher)))?;

        Ok(Some(info.publisher.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::TrustedPublisher;
    use crate::engine::model::{CatalogOrigin, DriverPackage, HardwareId, Locator, SignatureInfo, TransferMethod};
    use crate::engine::version::DriverVersion;
    use ed25519_dalek::{Signer, SigningKey};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn gate(require_signed_exe: bool) -> VerificationGate {
        let trust = TrustConfig {
            publishers: vec![TrustedPublisher {
                name: "Realtek".to_string(),
                public_key: hex::encode(signing_key().verifying_key().to_bytes()),
            }],
            require_signed_exe,
        };
        VerificationGate::new(&trust).unwrap()
    }

    fn artifact(content: &[u8]) -> (NamedTempFile, DownloadResult) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        let result = DownloadResult {
            path: file.path().to_path_buf(),
            bytes: content.len() as u64,
            sha256: String::new(),
            method: TransferMethod::LocalCopy,
            resumed: false,
        };
        (file, result)
    }

    fn entry(kind: PackageKind, sha256: &str, signature: Option<SignatureInfo>) -> CatalogEntry {
        CatalogEntry {
            version: DriverVersion::parse("1.2.0").unwrap(),
            package: DriverPackage {
                hardware_id: HardwareId::parse("PCI\\VEN_10EC&DEV_8168").unwrap(),
                provider: "Realtek".to_string(),
                locator: Locator::Http("https://x/rt.zip".into()),
                sha256: sha256.to_string(),
                size: None,
                signature,
                kind,
            },
            origin: CatalogOrigin::Local,
        }
    }

    fn sign(digest_hex: &str) -> SignatureInfo {
        let digest = hex::decode(digest_hex).unwrap();
        SignatureInfo {
            publisher: "Realtek".to_string(),
            signature: hex::encode(signing_key().sign(&digest).to_bytes()),
        }
    }

    #[test]
    fn test_sha256_calculation() {
        let (file, _) = artifact(b"hello world");
        assert_eq!(calculate_sha256(file.path()).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_signed_inf_approved() {
        let (_file, download) = artifact(b"hello world");
        let verdict = gate(true)
            .verify(&download, &entry(PackageKind::Inf, HELLO_SHA256, Some(sign(HELLO_SHA256))))
            .unwrap();
        match verdict {
            Verdict::Approved(package) => {
                assert_eq!(package.publisher(), Some("Realtek"));
                assert_eq!(package.kind(), PackageKind::Inf);
            }
            Verdict::Rejected(reason) => panic!("unexpected rejection: {}", reason),
        }
    }

    #[tokio::test]
    async fn test_verify_on_blocking_pool() {
        let gate = gate(true);
        let (_file, download) = artifact(b"hello world");
        let verdict = gate
            .verify_blocking(&download, &entry(PackageKind::Inf, HELLO_SHA256, Some(sign(HELLO_SHA256))))
            .await
            .unwrap();
        assert!(matches!(verdict, Verdict::Approved(_)));

        let (_file, download) = artifact(b"hello worle");
        let verdict = gate
            .verify_blocking(&download, &entry(PackageKind::Inf, HELLO_SHA256, Some(sign(HELLO_SHA256))))
            .await
            .unwrap();
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::HashMismatch { .. })));
        assert!(!download.path.exists());
    }

    #[test]
    fn test_hash_mismatch_rejected_and_deleted() {
        let (_file, download) = artifact(b"hello world");
        let mut wrong = HELLO_SHA256.to_string();
        wrong.replace_range(0..1, "c");
        let verdict = gate(false)
            .verify(&download, &entry(PackageKind::Exe, &wrong, None))
            .unwrap();
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::HashMismatch { .. })));
        assert!(!download.path.exists());
    }

    #[test]
    fn test_unsigned_inf_rejected() {
        let (_file, download) = artifact(b"hello world");
        let verdict = gate(false)
            .verify(&download, &entry(PackageKind::Inf, HELLO_SHA256, None))
            .unwrap();
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::UntrustedSignature(_))));
    }

    #[test]
    fn test_unsigned_exe_follows_policy() {
        let (_file, download) = artifact(b"hello world");
        let verdict = gate(false)
            .verify(&download, &entry(PackageKind::Exe, HELLO_SHA256, None))
            .unwrap();
        assert!(matches!(verdict, Verdict::Approved(_)));

        let (_file, download) = artifact(b"hello world");
        let verdict = gate(true)
            .verify(&download, &entry(PackageKind::Exe, HELLO_SHA256, None))
            .unwrap();
        assert!(matches!(verdict, Verdict::Rejected(_)));
    }

    #[test]
    fn test_bad_signature_always_rejected() {
        let (_file, download) = artifact(b"hello world");
        let forged = sign("00".repeat(32).as_str());
        let verdict = gate(false)
            .verify(&download, &entry(PackageKind::Exe, HELLO_SHA256, Some(forged)))
            .unwrap();
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::UntrustedSignature(_))));
    }

    #[test]
    fn test_unknown_publisher_rejected() {
        let (_file, download) = artifact(b"hello world");
        let mut signature = sign(HELLO_SHA256);
        signature.publisher = "Somebody Else".to_string();
        let verdict = gate(true)
            .verify(&download, &entry(PackageKind::Inf, HELLO_SHA256, Some(signature)))
            .unwrap();
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::UntrustedSignature(_))));
    }

    #[test]
    fn test_bad_publisher_key_is_config_error() {
        let trust = TrustConfig {
            publishers: vec![TrustedPublisher {
                name: "Broken".to_string(),
                public_key: "abcd".to_string(),
            }],
            require_signed_exe: false,
        };
        assert!(matches!(VerificationGate::new(&trust), Err(EngineError::Config(_))));
    }
}
