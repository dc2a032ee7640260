//! Blockdump Agent Library
//!
//! Changed-block backup of virtual machine disks: binds a VM snapshot,
//! enumerates the extents that changed since the last backup and dumps them
//! concurrently into a block repository.

pub mod cbt;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod inventory;
pub mod report;
pub mod repository;
pub mod transfer;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupExecutor, BackupReport, BackupRequest, DumpOptions};
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
