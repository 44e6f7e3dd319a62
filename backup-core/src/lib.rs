//! Backup Core Library
//!
//! Backup chain management, physical capture, integrity manifests and
//! restore-with-rollback for the research repository's database engine and
//! its on-disk asset tree.

pub mod archive;
pub mod capture;
pub mod chain;
pub mod config;
pub mod db;
pub mod engine;
pub mod events;
pub mod fs;
pub mod layout;
pub mod manifest;
pub mod orchestrator;
pub mod restore;
pub mod utils;

// Re-export commonly used types
pub use chain::record::{BackupRecord, BackupType};
pub use config::Config;
pub use orchestrator::Orchestrator;
pub use utils::errors::{BackupError, ErrorKind};
pub type Result<T> = std::result::Result<T, BackupError>;
