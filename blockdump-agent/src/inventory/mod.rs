pub mod disk;
pub mod entity;
pub mod snapshot;

pub use disk::{DiskConfig, VirtualDisk};
pub use entity::{EntityRef, ManagedRef};
pub use snapshot::{SnapshotBinder, SnapshotBinding, SnapshotTree};
