//! Backups and Installation Records
//!
//! Pre-install driver snapshots and the append-only record journal

pub mod backup;
pub mod journal;

pub use backup::{BackupSnapshot, DriverBackupStore};
pub use journal::RecordJournal;
