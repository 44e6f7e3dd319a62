//! Utility modules shared by the backup core.

pub mod errors;
pub mod logger;
pub mod retry;

pub use errors::{BackupError, ErrorKind, Result};
