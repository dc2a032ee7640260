//! Changed-block tracking: extents, checkpoints and enumeration.

pub mod checkpoint;
pub mod enumerator;
pub mod extent;

pub use checkpoint::{Checkpoint, CheckpointRecord, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use enumerator::BlockEnumerator;
pub use extent::BlockExtent;
