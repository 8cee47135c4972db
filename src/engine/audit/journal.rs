//! Installation Record Journal
//!
//! Append-only, line-delimited JSON log of installation records

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::engine::error::{EngineError, Result};
use crate::engine::installer::RecordSink;
use crate::engine::model::{HardwareId, InstallationRecord};

/// Current journal format version
pub const JOURNAL_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct JournalLine {
    version: u32,
    #[serde(flatten)]
    record: InstallationRecord,
}

pub struct RecordJournal {
    log_path: PathBuf,
    write_lock: Mutex<()>,
}

impl RecordJournal {
    pub fn new(log_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            log_path: log_path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// All records in append order. Lines from newer formats are skipped.
    pub fn read_all(&self) -> Result<Vec<InstallationRecord>> {
        if !self.log_path.exists() {
            return Ok(vec![]);
        }

        let file = fs::File::open(&self.log_path)?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalLine>(&line) {
                Ok(entry) if entry.version <= JOURNAL_VERSION => records.push(entry.record),
                Ok(entry) => warn!(line = number + 1, version = entry.version, "Skipping record from newer format"),
                // A torn final line from a crash mid-append
                Err(e) => warn!(line = number + 1, error = %e, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }

    pub fn for_device(&self, hardware_id: &HardwareId) -> Result<Vec<InstallationRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| &r.hardware_id == hardware_id)
            .collect())
    }

    pub fn needing_attention(&self) -> Result<Vec<InstallationRecord>> {
        Ok(self.read_all()?.into_iter().filter(|r| r.needs_attention).collect())
    }
}

impl RecordSink for RecordJournal {
    fn append(&self, record: &InstallationRecord) -> Result<()> {
        let line = serde_json::to_string(&JournalLine {
            version: JOURNAL_VERSION,
            record: record.clone(),
        })?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| EngineError::Storage("journal lock poisoned".to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::ErrorKind;
    use crate::engine::model::{
        CatalogEntry, CatalogOrigin, DeviceClass, DeviceRecord, DriverPackage, Locator, Outcome, PackageKind,
        UpdatePlan,
    };
    use crate::engine::version::DriverVersion;
    use tempfile::tempdir;

    fn plan(id: &str) -> UpdatePlan {
        let hardware_id = HardwareId::parse(id).unwrap();
        let device = DeviceRecord::new(hardware_id.clone(), DeviceClass::Audio, "Audio")
            .with_driver(DriverVersion::parse("1.0.0").unwrap(), "Realtek");
        let entry = CatalogEntry {
            version: DriverVersion::parse("1.2.0").unwrap(),
            package: DriverPackage {
                hardware_id,
                provider: "Realtek".to_string(),
                locator: Locator::Http("https://x/a.exe".into()),
                sha256: "00".to_string(),
                size: None,
                signature: None,
                kind: PackageKind::Exe,
            },
            origin: CatalogOrigin::Remote,
        };
        UpdatePlan::new(device, entry)
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let journal = RecordJournal::new(&dir.path().join("records").join("log.jsonl")).unwrap();
        let a = plan("HDAUDIO\\VEN_10EC&DEV_0887");
        let b = plan("PCI\\VEN_8086&DEV_15F3");

        journal.append(&InstallationRecord::new(&a, Outcome::Succeeded)).unwrap();
        journal
            .append(&InstallationRecord::new(&b, Outcome::RollbackFailed).with_error(ErrorKind::RollbackFailed, "x"))
            .unwrap();

        let all = journal.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].outcome, Outcome::Succeeded);
        assert_eq!(journal.for_device(&b.device.hardware_id).unwrap().len(), 1);
        assert_eq!(journal.needing_attention().unwrap().len(), 1);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let journal = RecordJournal::new(&path).unwrap();
        journal.append(&InstallationRecord::new(&plan("PCI\\VEN_8086&DEV_15F3"), Outcome::Succeeded)).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"version\":1,\"id\":").unwrap();

        assert_eq!(journal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_journal_is_empty() {
        let dir = tempdir().unwrap();
        let journal = RecordJournal::new(&dir.path().join("none.jsonl")).unwrap();
        assert!(journal.read_all().unwrap().is_empty());
    }
}
