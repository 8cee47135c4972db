//! Device & Driver Model
//!
//! Immutable value types shared by every stage of the pipeline.

pub mod catalog;
pub mod device;
pub mod plan;

pub use catalog::{CatalogEntry, CatalogListing, CatalogOrigin, DriverPackage, Locator, PackageKind, SignatureInfo};
pub use device::{load_inventory, DeviceClass, DeviceRecord, HardwareId};
pub use plan::{
    DownloadResult, InstallationRecord, Outcome, RestorePointId, TransferMethod, UpdatePlan, VersionDelta,
};
