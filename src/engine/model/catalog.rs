//! Catalog Entries
//!
//! Candidate driver packages as returned by the local store and the remote service.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::device::HardwareId;
use crate::engine::error::Result;
use crate::engine::version::DriverVersion;

/// How a package is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    /// INF driver package, staged with pnputil
    Inf,
    /// Vendor setup executable run silently
    Exe,
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageKind::Inf => write!(f, "inf"),
            PackageKind::Exe => write!(f, "exe"),
        }
    }
}

/// Where a package can be retrieved from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Locator {
    Http(String),
    File(PathBuf),
}

impl Locator {
    pub fn is_http(&self) -> bool {
        matches!(self, Locator::Http(_))
    }

    /// Last path segment, used as the local file name.
    pub fn file_name(&self) -> String {
        let name = match self {
            Locator::Http(url) => url
                .split(['?', '#'])
                .next()
                .and_then(|path| path.rsplit('/').next())
                .map(str::to_string),
            Locator::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string()),
        };
        name.filter(|n| !n.is_empty())
            .unwrap_or_else(|| "package.bin".to_string())
    }
}

impl From<String> for Locator {
    fn from(value: String) -> Self {
        let lower = value.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Locator::Http(value)
        } else if lower.starts_with("file://") {
            Locator::File(PathBuf::from(&value["file://".len()..]))
        } else {
            Locator::File(PathBuf::from(value))
        }
    }
}

impl From<Locator> for String {
    fn from(locator: Locator) -> Self {
        locator.to_string()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Http(url) => write!(f, "{}", url),
            Locator::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Publisher signature over the package's SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub publisher: String,
    /// Hex-encoded Ed25519 signature (64 bytes)
    pub signature: String,
}

/// Everything about a package except its version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverPackage {
    /// Hardware-ID pattern this package targets
    pub hardware_id: HardwareId,
    pub provider: String,
    pub locator: Locator,
    /// Expected SHA-256, hex
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureInfo>,
    pub kind: PackageKind,
}

/// Which source produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogOrigin {
    Local,
    Remote,
}

/// A catalog row as stored or transmitted; the version is still raw text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogListing {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<NaiveDate>,
    #[serde(flatten)]
    pub package: DriverPackage,
}

impl CatalogListing {
    pub fn parse_version(&self) -> Result<DriverVersion> {
        let version = DriverVersion::parse(&self.version)?;
        Ok(match self.release_date {
            Some(date) => version.with_release_date(date),
            None => version,
        })
    }
}

/// A comparable candidate driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub version: DriverVersion,
    pub package: DriverPackage,
    pub origin: CatalogOrigin,
}

impl CatalogEntry {
    pub fn from_listing(listing: CatalogListing, origin: CatalogOrigin) -> Result<Self> {
        let version = listing.parse_version()?;
        Ok(Self {
            version,
            package: listing.package,
            origin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_from_string() {
        assert!(Locator::from("https://dl.example.com/a.exe".to_string()).is_http());
        assert_eq!(
            Locator::from("file:///srv/drivers/a.inf".to_string()),
            Locator::File(PathBuf::from("/srv/drivers/a.inf"))
        );
        assert_eq!(
            Locator::from("C:\\drivers\\a.inf".to_string()),
            Locator::File(PathBuf::from("C:\\drivers\\a.inf"))
        );
    }

    #[test]
    fn test_locator_file_name() {
        let url = Locator::Http("https://dl.example.com/nv/531.41-win11.exe?token=x".into());
        assert_eq!(url.file_name(), "531.41-win11.exe");
        let bare = Locator::Http("https://dl.example.com/".into());
        assert_eq!(bare.file_name(), "package.bin");
    }

    #[test]
    fn test_listing_json() {
        let json = r#"{
            "version": "31.0.15.3623",
            "release_date": "2023-06-21",
            "hardware_id": "PCI\\VEN_10DE&DEV_1C03",
            "provider": "NVIDIA",
            "locator": "https://dl.example.com/nv.exe",
            "sha256": "ab",
            "size": 1024,
            "kind": "exe"
        }"#;
        let listing: CatalogListing = serde_json::from_str(json).unwrap();
        assert_eq!(listing.package.kind, PackageKind::Exe);
        assert!(listing.package.signature.is_none());

        let entry = CatalogEntry::from_listing(listing, CatalogOrigin::Remote).unwrap();
        assert_eq!(entry.version.to_string(), "31.0.15.3623");
        assert!(entry.version.release_date().is_some());
    }

    #[test]
    fn test_listing_with_bad_version() {
        let listing = CatalogListing {
            version: "latest".to_string(),
            release_date: None,
            package: DriverPackage {
                hardware_id: HardwareId::parse("PCI\\VEN_10DE&DEV_1C03").unwrap(),
                provider: "NVIDIA".to_string(),
                locator: Locator::Http("https://dl.example.com/nv.exe".into()),
                sha256: "ab".to_string(),
                size: None,
                signature: None,
                kind: PackageKind::Exe,
            },
        };
        assert!(CatalogEntry::from_listing(listing, CatalogOrigin::Local).is_err());
    }
}
