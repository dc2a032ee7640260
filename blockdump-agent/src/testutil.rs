//! Shared fixtures for unit tests.

use crate::cbt::checkpoint::Checkpoint;
use crate::executor::retry::RetryPolicy;
use crate::inventory::disk::{DiskConfig, VirtualDisk};
use crate::inventory::entity::ManagedRef;
use crate::inventory::snapshot::{PowerState, SnapshotTreeNode, VmSnapshotInfo};
use crate::transport::MemoryTransport;
use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

pub const INSTANCE_UUID: &str = "vc-test-instance";
pub const DISK_A: &str = "6000C29a-disk-a";
pub const DISK_A_KEY: i32 = 2000;
pub const DISK_B: &str = "6000C29b-disk-b";
pub const DISK_B_KEY: i32 = 2001;

pub fn vm_ref() -> ManagedRef {
    ManagedRef::vm("vm-42")
}

pub fn base_snapshot() -> ManagedRef {
    ManagedRef::snapshot("snapshot-1")
}

pub fn current_snapshot() -> ManagedRef {
    ManagedRef::snapshot("snapshot-2")
}

/// 100-byte disk with change tracking on.
pub fn disk_a() -> VirtualDisk {
    VirtualDisk {
        key: DISK_A_KEY,
        label: "Hard disk 1".into(),
        uuid: DISK_A.into(),
        capacity_bytes: 100,
        backing_path: "[ds1] web-01/web-01.vmdk".into(),
        change_tracking_enabled: true,
        change_id: Some("52 de 3a/12".into()),
    }
}

/// 64-byte disk with change tracking off.
pub fn disk_b() -> VirtualDisk {
    VirtualDisk {
        key: DISK_B_KEY,
        label: "Hard disk 2".into(),
        uuid: DISK_B.into(),
        capacity_bytes: 64,
        backing_path: "[ds1] web-01/web-01_1.vmdk".into(),
        change_tracking_enabled: false,
        change_id: None,
    }
}

pub fn disk_a_content() -> Vec<u8> {
    (0..100u32).map(|i| (i * 7 % 251) as u8).collect()
}

pub fn disk_b_content() -> Vec<u8> {
    (0..64u32).map(|i| (255 - i) as u8).collect()
}

pub fn config() -> DiskConfig {
    DiskConfig {
        disks: vec![disk_a(), disk_b()],
    }
}

fn node(snapshot: ManagedRef, name: &str, children: Vec<SnapshotTreeNode>) -> SnapshotTreeNode {
    SnapshotTreeNode {
        snapshot,
        name: name.into(),
        description: String::new(),
        create_time: Utc::now(),
        state: PowerState::PoweredOn,
        child_snapshot_list: children,
    }
}

/// VM `vm-42` ("web-01") with snapshots backup-1 → backup-2, backup-2 current.
pub fn transport() -> MemoryTransport {
    let transport = MemoryTransport::new(INSTANCE_UUID);
    let snapshots = VmSnapshotInfo {
        current_snapshot: Some(current_snapshot()),
        root_snapshot_list: vec![node(
            base_snapshot(),
            "backup-1",
            vec![node(current_snapshot(), "backup-2", vec![])],
        )],
    };
    transport.add_vm(vm_ref(), "web-01", config(), snapshots);
    transport.set_snapshot_config(&base_snapshot(), config());
    transport.set_snapshot_config(&current_snapshot(), config());
    transport.set_disk_content(DISK_A, disk_a_content());
    transport.set_disk_content(DISK_B, disk_b_content());
    transport
}

pub fn checkpoint(snapshot: &ManagedRef) -> Checkpoint {
    Checkpoint {
        snapshot: snapshot.clone(),
        change_id: Some("52 de 3a/7".into()),
        capacity_bytes: 100,
        operation_id: Uuid::new_v4(),
        completed_at: Utc::now(),
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}
