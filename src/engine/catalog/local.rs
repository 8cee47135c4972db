//! Local Catalog Store
//! SQLite catalog with connection pooling

use async_trait::async_trait;
use chrono::NaiveDate;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tracing::info;

use super::CatalogSource;
use crate::engine::error::{EngineError, Result};
use crate::engine::model::{CatalogListing, DriverPackage, HardwareId, Locator, PackageKind, SignatureInfo};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

#[derive(Clone)]
pub struct LocalCatalog {
    pool: DbPool,
}

impl LocalCatalog {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder().max_size(8).build(manager)?;

        let catalog = Self { pool };
        catalog.init_schema()?;
        Ok(catalog)
    }

    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        let catalog = Self { pool };
        catalog.init_schema()?;
        Ok(catalog)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS drivers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hardware_id TEXT NOT NULL,
                bus TEXT NOT NULL,
                vendor_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                version TEXT NOT NULL,
                release_date TEXT,
                provider TEXT NOT NULL,
                locator TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                size INTEGER,
                kind TEXT NOT NULL,
                publisher TEXT,
                signature TEXT,
                UNIQUE (hardware_id, version, provider)
            );
            CREATE INDEX IF NOT EXISTS idx_drivers_device ON drivers (bus, vendor_id, device_id);",
        )?;

        // PRAGMA journal_mode returns a row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Ok(())
    }

    pub fn get_connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    /// Insert or replace listings; returns how many rows were written.
    pub fn import_listings(&self, listings: &[CatalogListing]) -> Result<usize> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO drivers
                    (hardware_id, bus, vendor_id, device_id, version, release_date, provider,
                     locator, sha256, size, kind, publisher, signature)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for listing in listings {
                let package = &listing.package;
                let id = &package.hardware_id;
                stmt.execute(params![
                    id.to_string(),
                    id.bus,
                    id.vendor_id,
                    id.device_id,
                    listing.version,
                    listing.release_date.map(|d| d.to_string()),
                    package.provider,
                    package.locator.to_string(),
                    package.sha256.to_lowercase(),
                    package.size.map(|s| s as i64),
                    package.kind.to_string(),
                    package.signature.as_ref().map(|s| s.publisher.clone()),
                    package.signature.as_ref().map(|s| s.signature.clone()),
                ])?;
            }
        }
        tx.commit()?;
        info!(count = listings.len(), "Imported catalog listings");
        Ok(listings.len())
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.get_connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM drivers", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Blocking lookup of every listing for the device's vendor/device pair.
    pub fn listings_for(&self, hardware_id: &HardwareId) -> Result<Vec<CatalogListing>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT hardware_id, version, release_date, provider, locator, sha256, size, kind,
                    publisher, signature
             FROM drivers
             WHERE bus = ?1 AND vendor_id = ?2 AND device_id = ?3
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(
                params![hardware_id.bus, hardware_id.vendor_id, hardware_id.device_id],
                |row| {
                    Ok(DriverRow {
                        hardware_id: row.get(0)?,
                        version: row.get(1)?,
                        release_date: row.get(2)?,
                        provider: row.get(3)?,
                        locator: row.get(4)?,
                        sha256: row.get(5)?,
                        size: row.get(6)?,
                        kind: row.get(7)?,
                        publisher: row.get(8)?,
                        signature: row.get(9)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(DriverRow::into_listing).collect()
    }

    /// Whether an exact (pattern, version, provider) row exists.
    pub fn contains(&self, pattern: &HardwareId, version: &str, provider: &str) -> Result<bool> {
        let conn = self.get_connection()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM drivers WHERE hardware_id = ?1 AND version = ?2 AND provider = ?3",
                params![pattern.to_string(), version, provider],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

struct DriverRow {
    hardware_id: String,
    version: String,
    release_date: Option<String>,
    provider: String,
    locator: String,
    sha256: String,
    size: Option<i64>,
    kind: String,
    publisher: Option<String>,
    signature: Option<String>,
}

impl DriverRow {
    fn into_listing(self) -> Result<CatalogListing> {
        let kind = match self.kind.as_str() {
            "inf" => PackageKind::Inf,
            "exe" => PackageKind::Exe,
            other => return Err(EngineError::Storage(format!("unknown package kind {:?}", other))),
        };
        let release_date = self
            .release_date
            .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
            .transpose()
            .map_err(|e| EngineError::Storage(format!("bad release date: {}", e)))?;
        let signature = match (self.publisher, self.signature) {
            (Some(publisher), Some(signature)) => Some(SignatureInfo { publisher, signature }),
            _ => None,
        };

        Ok(CatalogListing {
            version: self.version,
            release_date,
            package: DriverPackage {
                hardware_id: HardwareId::parse(&self.hardware_id)?,
                provider: self.provider,
                locator: Locator::from(self.locator),
                sha256: self.sha256,
                size: self.size.map(|s| s as u64),
                signature,
                kind,
            },
        })
    }
}

#[async_trait]
impl CatalogSource for LocalCatalog {
    fn name(&self) -> &str {
        "local"
    }

    async fn query(&self, hardware_id: &HardwareId) -> Result<Vec<CatalogListing>> {
        let catalog = self.clone();
        let hardware_id = hardware_id.clone();
        tokio::task::spawn_blocking(move || catalog.listings_for(&hardware_id))
            .await
            .map_err(|e| EngineError::Storage(format!("catalog query task failed: {}", e)))?
    }
}
