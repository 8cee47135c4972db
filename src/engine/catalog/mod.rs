//! Catalog Resolver
//!
//! Finds candidate drivers for a device from the local store and, when
//! configured, the remote catalog service.

pub mod local;
pub mod remote;

use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::{EngineError, Result};
use super::model::{CatalogEntry, CatalogListing, CatalogOrigin, DeviceRecord, HardwareId};
use super::version::compare;

pub use local::LocalCatalog;
pub use remote::RemoteCatalog;

/// A source of catalog listings keyed by hardware ID.
///
/// Implementations return every listing whose vendor/device pair matches;
/// the resolver does the finer pattern matching.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn name(&self) -> &str;

    async fn query(&self, hardware_id: &HardwareId) -> Result<Vec<CatalogListing>>;
}

/// Candidates for one device.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Newest first
    pub candidates: Vec<CatalogEntry>,
    /// Listings with versions that could not be parsed; offered for manual choice only
    pub manual: Vec<CatalogListing>,
    /// Non-fatal problems, e.g. the remote service being unreachable
    pub warnings: Vec<EngineError>,
}

impl Resolution {
    pub fn best(&self) -> Option<&CatalogEntry> {
        self.candidates.first()
    }
}

/// An update is warranted when nothing is installed or the candidate is strictly newer.
pub fn is_warranted(device: &DeviceRecord, candidate: &CatalogEntry) -> bool {
    match &device.installed_version {
        None => true,
        Some(installed) => compare(&candidate.version, installed) == Ordering::Greater,
    }
}

pub struct CatalogResolver {
    local: Arc<dyn CatalogSource>,
    remote: Option<Arc<dyn CatalogSource>>,
}

impl CatalogResolver {
    pub fn new(local: Arc<dyn CatalogSource>, remote: Option<Arc<dyn CatalogSource>>) -> Self {
        Self { local, remote }
    }

    pub async fn resolve(&self, device: &DeviceRecord) -> Result<Resolution> {
        let mut resolution = Resolution::default();
        let hardware_id = &device.hardware_id;

        let local = self.local.query(hardware_id).await?;
        self.merge(&mut resolution, device, local, CatalogOrigin::Local);

        if let Some(remote) = &self.remote {
            match remote.query(hardware_id).await {
                Ok(listings) => self.merge(&mut resolution, device, listings, CatalogOrigin::Remote),
                Err(e) => {
                    warn!(source = remote.name(), device = %hardware_id, error = %e, "Remote catalog unavailable, using local entries only");
                    let message = e.to_string();
                    resolution.warnings.push(match e {
                        EngineError::CatalogUnavailable(_) => e,
                        _ => EngineError::CatalogUnavailable(message),
                    });
                }
            }
        }

        resolution.candidates.sort_by(|a, b| {
            compare(&b.version, &a.version)
                .then_with(|| {
                    b.package
                        .hardware_id
                        .specificity()
                        .cmp(&a.package.hardware_id.specificity())
                })
                .then_with(|| a.package.provider.cmp(&b.package.provider))
        });

        debug!(
            device = %hardware_id,
            candidates = resolution.candidates.len(),
            manual = resolution.manual.len(),
            "Resolved catalog candidates"
        );
        Ok(resolution)
    }

    fn merge(
        &self,
        resolution: &mut Resolution,
        device: &DeviceRecord,
        listings: Vec<CatalogListing>,
        origin: CatalogOrigin,
    ) {
        for listing in listings {
            if !listing.package.hardware_id.covers(&device.hardware_id) {
                continue;
            }
            let entry = match CatalogEntry::from_listing(listing.clone(), origin) {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(version = %listing.version, error = %e, "Listing kept for manual selection");
                    resolution.manual.push(listing);
                    continue;
                }
            };

            let duplicate = resolution.candidates.iter().position(|existing| {
                existing.version.same_release(&entry.version)
                    && existing.package.provider.eq_ignore_ascii_case(&entry.package.provider)
            });
            match duplicate {
                // Remote copies are authoritative
                Some(index) if origin == CatalogOrigin::Remote => resolution.candidates[index] = entry,
                Some(_) => {}
                None => resolution.candidates.push(entry),
            }
        }
    }
}
