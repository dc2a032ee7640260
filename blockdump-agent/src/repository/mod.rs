//! Where dumped blocks go.

pub mod directory;
pub mod memory;

use crate::cbt::extent::BlockExtent;
use crate::utils::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use directory::{Compression, DirectorySink};
pub use memory::MemorySink;

/// Destination for dumped extents.
///
/// Writing the same `(disk_id, extent)` twice must leave the repository as if
/// it had been written once, so resubmitted and resumed extents are safe.
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn write_block(&self, disk_id: &str, extent: BlockExtent, data: Bytes) -> Result<()>;
}
