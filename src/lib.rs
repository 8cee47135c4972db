//! Hamster - driver matching and transactional update engine
//!
//! Matches installed device drivers against local and remote catalogs,
//! then downloads, verifies and installs newer packages with backup and
//! rollback.

pub mod engine;
