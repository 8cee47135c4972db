//! Segment Ledger
//!
//! Persisted completion state for segmented downloads so an interrupted
//! transfer can pick up where it stopped. Lives next to the destination
//! file as `<name>.segments.json`; part files are `<name>.part<N>`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::engine::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentState {
    pub index: usize,
    /// First byte offset
    pub start: u64,
    /// Last byte offset, inclusive
    pub end: u64,
    pub done: bool,
}

impl SegmentState {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLedger {
    pub locator: String,
    pub total: u64,
    pub segments: Vec<SegmentState>,
}

impl SegmentLedger {
    /// Split `total` bytes into `count` contiguous segments; the last one takes the remainder.
    pub fn plan(locator: &str, total: u64, count: usize) -> Self {
        if total == 0 {
            return Self {
                locator: locator.to_string(),
                total,
                segments: Vec::new(),
            };
        }
        let count = (count as u64).clamp(1, total.max(1));
        let base = total / count;
        let segments = (0..count)
            .map(|i| {
                let start = i * base;
                let end = if i == count - 1 { total - 1 } else { start + base - 1 };
                SegmentState {
                    index: i as usize,
                    start,
                    end,
                    done: false,
                }
            })
            .collect();
        Self {
            locator: locator.to_string(),
            total,
            segments,
        }
    }

    pub fn ledger_path(dest: &Path) -> PathBuf {
        sibling(dest, "segments.json")
    }

    pub fn part_path(dest: &Path, index: usize) -> PathBuf {
        sibling(dest, &format!("part{}", index))
    }

    /// Load a ledger; unreadable or corrupt ledgers are treated as absent.
    pub fn load(dest: &Path) -> Option<Self> {
        let path = Self::ledger_path(dest);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(ledger) => Some(ledger),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding corrupt segment ledger");
                None
            }
        }
    }

    /// Save atomically: temp file, then rename.
    pub fn save(&self, dest: &Path) -> Result<()> {
        let path = Self::ledger_path(dest);
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    pub fn matches(&self, locator: &str, total: u64) -> bool {
        self.locator == locator && self.total == total
    }

    pub fn mark_done(&mut self, index: usize) {
        if let Some(segment) = self.segments.iter_mut().find(|s| s.index == index) {
            segment.done = true;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.segments.iter().all(|s| s.done)
    }

    /// Drop `done` flags whose part file is missing or the wrong length.
    /// Returns how many segments are still trusted.
    pub fn revalidate(&mut self, dest: &Path) -> usize {
        let mut trusted = 0;
        for segment in &mut self.segments {
            if !segment.done {
                continue;
            }
            let on_disk = fs::metadata(Self::part_path(dest, segment.index))
                .map(|m| m.len())
                .unwrap_or(0);
            if on_disk == segment.len() {
                trusted += 1;
            } else {
                warn!(segment = segment.index, expected = segment.len(), on_disk, "Segment failed revalidation");
                segment.done = false;
            }
        }
        trusted
    }

    /// Remove part files and the ledger itself.
    pub fn clear(&self, dest: &Path) {
        for segment in &self.segments {
            let _ = fs::remove_file(Self::part_path(dest, segment.index));
        }
        let _ = fs::remove_file(Self::ledger_path(dest));
    }
}

fn sibling(dest: &Path, extension: &str) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!("{}.{}", name, extension))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_plan_covers_every_byte() {
        let ledger = SegmentLedger::plan("https://x/a.bin", 10_000_003, 4);
        assert_eq!(ledger.segments.len(), 4);
        assert_eq!(ledger.segments[0].start, 0);
        assert_eq!(ledger.segments[3].end, 10_000_002);
        for pair in ledger.segments.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
        let sum: u64 = ledger.segments.iter().map(SegmentState::len).sum();
        assert_eq!(sum, 10_000_003);
    }

    #[test]
    fn test_plan_never_exceeds_bytes() {
        let ledger = SegmentLedger::plan("https://x/a.bin", 3, 8);
        assert_eq!(ledger.segments.len(), 3);
        assert!(ledger.segments.iter().all(|s| s.len() == 1));
    }

    #[test]
    fn test_save_load_and_revalidate() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("driver.exe");
        let mut ledger = SegmentLedger::plan("https://x/driver.exe", 100, 2);
        ledger.mark_done(0);
        ledger.mark_done(1);
        ledger.save(&dest).unwrap();

        fs::write(SegmentLedger::part_path(&dest, 0), vec![0u8; 50]).unwrap();
        fs::write(SegmentLedger::part_path(&dest, 1), vec![0u8; 10]).unwrap();

        let mut loaded = SegmentLedger::load(&dest).unwrap();
        assert!(loaded.matches("https://x/driver.exe", 100));
        assert!(!loaded.matches("https://x/other.exe", 100));
        assert_eq!(loaded.revalidate(&dest), 1);
        assert!(loaded.segments[0].done);
        assert!(!loaded.segments[1].done);
        assert!(!loaded.is_complete());

        loaded.clear(&dest);
        assert!(!SegmentLedger::ledger_path(&dest).exists());
        assert!(!SegmentLedger::part_path(&dest, 0).exists());
    }

    #[test]
    fn test_corrupt_ledger_is_ignored() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("driver.exe");
        fs::write(SegmentLedger::ledger_path(&dest), "{ not json").unwrap();
        assert!(SegmentLedger::load(&dest).is_none());
    }
}
