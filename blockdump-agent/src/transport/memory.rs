//! Scripted in-memory hypervisor endpoint.
//!
//! Holds VMs with their snapshot trees, per-snapshot disk configuration,
//! disk contents and changed-block sets, and can inject the failures the
//! engine has to cope with: denied objects, transient property errors and
//! failing block reads.

use super::{ChangedAreas, Session, Transport};
use crate::cbt::checkpoint::Checkpoint;
use crate::cbt::extent::BlockExtent;
use crate::inventory::disk::{DiskConfig, VirtualDisk};
use crate::inventory::entity::ManagedRef;
use crate::inventory::snapshot::{PowerState, SnapshotTreeNode, VmSnapshotInfo};
use crate::utils::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// How an injected read fault behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFault {
    /// Fail with `RemoteUnavailable` this many times, then succeed
    Transient(u32),
    /// Fail with `RemoteUnavailable` on every read
    Unavailable,
    /// Fail with `AccessDenied` on every read
    Denied,
}

struct MemoryVm {
    name: String,
    snapshots: VmSnapshotInfo,
    config: DiskConfig,
}

#[derive(Default)]
struct State {
    vms: HashMap<ManagedRef, MemoryVm>,
    snapshot_configs: HashMap<ManagedRef, DiskConfig>,
    contents: HashMap<String, Bytes>,
    changes: HashMap<(String, ManagedRef), Vec<BlockExtent>>,
    denied: HashSet<ManagedRef>,
    denied_change_queries: HashSet<String>,
    property_failures: HashMap<(ManagedRef, String), u32>,
    read_faults: HashMap<(String, u64), ReadFault>,
    removed_snapshots: Vec<ManagedRef>,
    read_log: Vec<(String, BlockExtent)>,
    page_size: Option<u64>,
    window_gap: u64,
    read_delay: Option<Duration>,
}

pub struct MemoryTransport {
    instance_uuid: String,
    state: Mutex<State>,
    next_snapshot: AtomicU64,
    bytes_read: AtomicU64,
}

impl MemoryTransport {
    pub fn new(instance_uuid: impl Into<String>) -> Self {
        Self {
            instance_uuid: instance_uuid.into(),
            state: Mutex::new(State::default()),
            next_snapshot: AtomicU64::new(1000),
            bytes_read: AtomicU64::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a VM with its current disk configuration and snapshot tree.
    pub fn add_vm(&self, vm: ManagedRef, name: &str, config: DiskConfig, snapshots: VmSnapshotInfo) {
        self.state().vms.insert(
            vm,
            MemoryVm {
                name: name.to_string(),
                snapshots,
                config,
            },
        );
    }

    /// Disk configuration returned by the `config` property of `snapshot`.
    pub fn set_snapshot_config(&self, snapshot: &ManagedRef, config: DiskConfig) {
        self.state().snapshot_configs.insert(snapshot.clone(), config);
    }

    pub fn set_disk_content(&self, disk_id: &str, content: Vec<u8>) {
        self.state().contents.insert(disk_id.to_string(), Bytes::from(content));
    }

    /// Areas of `disk_id` changed since `since` up to any later snapshot.
    pub fn set_changes(&self, disk_id: &str, since: &ManagedRef, extents: Vec<BlockExtent>) {
        self.state().changes.insert((disk_id.to_string(), since.clone()), extents);
    }

    /// Limit each changed-area answer to a window of `page_size` bytes.
    pub fn set_page_size(&self, page_size: u64) {
        self.state().page_size = Some(page_size.max(1));
    }

    /// Changed-area answers start `gap` bytes past the requested offset.
    pub fn set_change_window_gap(&self, gap: u64) {
        self.state().window_gap = gap;
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.state().read_delay = Some(delay);
    }

    /// Every property read of `object` fails with `AccessDenied`.
    pub fn deny(&self, object: &ManagedRef) {
        self.state().denied.insert(object.clone());
    }

    /// Changed-area queries for `disk_id` fail with `AccessDenied`.
    pub fn deny_changed_areas(&self, disk_id: &str) {
        self.state().denied_change_queries.insert(disk_id.to_string());
    }

    /// The next `times` reads of `property` fail with `RemoteUnavailable`.
    pub fn fail_property_reads(&self, object: &ManagedRef, property: &str, times: u32) {
        self.state()
            .property_failures
            .insert((object.clone(), property.to_string()), times);
    }

    /// Reads of `disk_id` covering `offset` fail as described by `fault`.
    pub fn fail_reads_at(&self, disk_id: &str, offset: u64, fault: ReadFault) {
        self.state().read_faults.insert((disk_id.to_string(), offset), fault);
    }

    /// Every successful block read so far.
    pub fn read_log(&self) -> Vec<(String, BlockExtent)> {
        self.state().read_log.clone()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn removed_snapshots(&self) -> Vec<ManagedRef> {
        self.state().removed_snapshots.clone()
    }

    pub fn current_snapshot(&self, vm: &ManagedRef) -> Option<ManagedRef> {
        self.state()
            .vms
            .get(vm)
            .and_then(|v| v.snapshots.current_snapshot.clone())
    }

    fn check_read_fault(state: &mut State, disk_id: &str, extent: BlockExtent) -> Result<()> {
        let hit = state
            .read_faults
            .iter()
            .find(|(key, _)| key.0 == disk_id && extent.contains_offset(key.1))
            .map(|(key, fault)| (key.clone(), *fault));

        let Some((key, fault)) = hit else {
            return Ok(());
        };

        match fault {
            ReadFault::Transient(0) => {
                state.read_faults.remove(&key);
                Ok(())
            }
            ReadFault::Transient(n) => {
                state.read_faults.insert(key, ReadFault::Transient(n - 1));
                Err(AgentError::RemoteUnavailable(format!("read of {} {} timed out", disk_id, extent)))
            }
            ReadFault::Unavailable => Err(AgentError::RemoteUnavailable(format!(
                "read of {} {} timed out",
                disk_id, extent
            ))),
            ReadFault::Denied => Err(AgentError::AccessDenied(format!("read of {} {} denied", disk_id, extent))),
        }
    }
}

fn remove_node(
    list: &mut Vec<SnapshotTreeNode>,
    target: &ManagedRef,
    parent: Option<&ManagedRef>,
) -> Option<Option<ManagedRef>> {
    if let Some(pos) = list.iter().position(|n| &n.snapshot == target) {
        let removed = list.remove(pos);
        for (i, child) in removed.child_snapshot_list.into_iter().enumerate() {
            list.insert(pos + i, child);
        }
        return Some(parent.cloned());
    }
    for node in list.iter_mut() {
        let me = node.snapshot.clone();
        if let Some(found) = remove_node(&mut node.child_snapshot_list, target, Some(&me)) {
            return Some(found);
        }
    }
    None
}

fn find_node_mut<'a>(list: &'a mut [SnapshotTreeNode], target: &ManagedRef) -> Option<&'a mut SnapshotTreeNode> {
    for node in list.iter_mut() {
        if &node.snapshot == target {
            return Some(node);
        }
        if let Some(found) = find_node_mut(&mut node.child_snapshot_list, target) {
            return Some(found);
        }
    }
    None
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Session> {
        Ok(Session {
            session_id: Uuid::new_v4().to_string(),
            instance_uuid: self.instance_uuid.clone(),
            connected_at: Utc::now(),
        })
    }

    async fn read_property(&self, object: &ManagedRef, property: &str) -> Result<serde_json::Value> {
        let mut state = self.state();

        if state.denied.contains(object) {
            return Err(AgentError::AccessDenied(format!("{} of {}", property, object)));
        }

        let key = (object.clone(), property.to_string());
        if let Some(remaining) = state.property_failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AgentError::RemoteUnavailable(format!("{} of {}", property, object)));
            }
        }

        let value = match (object.kind.as_str(), property) {
            (ManagedRef::VIRTUAL_MACHINE, "name") => state
                .vms
                .get(object)
                .map(|vm| serde_json::Value::String(vm.name.clone())),
            (ManagedRef::VIRTUAL_MACHINE, "snapshot") => state
                .vms
                .get(object)
                .map(|vm| serde_json::to_value(&vm.snapshots))
                .transpose()?,
            (ManagedRef::VIRTUAL_MACHINE, "config") => state
                .vms
                .get(object)
                .map(|vm| serde_json::to_value(&vm.config))
                .transpose()?,
            (ManagedRef::SNAPSHOT, "config") => state
                .snapshot_configs
                .get(object)
                .map(serde_json::to_value)
                .transpose()?,
            _ => None,
        };

        value.ok_or_else(|| AgentError::NotFound(format!("{} of {}", property, object)))
    }

    async fn read_blocks(
        &self,
        snapshot: &ManagedRef,
        disk: &VirtualDisk,
        extent: BlockExtent,
    ) -> Result<Bytes> {
        let delay = self.state().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if !state.snapshot_configs.contains_key(snapshot) {
            return Err(AgentError::NotFound(format!("snapshot {}", snapshot)));
        }
        Self::check_read_fault(&mut state, disk.disk_id(), extent)?;

        if extent.end() > disk.capacity_bytes {
            return Err(AgentError::RemoteProtocol(format!(
                "extent {} beyond capacity {} of {}",
                extent, disk.capacity_bytes, disk.label
            )));
        }

        // Unwritten regions read back as zeroes.
        let data = match state.contents.get(disk.disk_id()) {
            Some(content) => {
                let mut buf = vec![0u8; extent.length as usize];
                let start = (extent.offset as usize).min(content.len());
                let end = (extent.end() as usize).min(content.len());
                buf[..end - start].copy_from_slice(&content[start..end]);
                Bytes::from(buf)
            }
            None => Bytes::from(vec![0u8; extent.length as usize]),
        };

        state.read_log.push((disk.disk_id().to_string(), extent));
        self.bytes_read.fetch_add(extent.length, Ordering::Relaxed);
        Ok(data)
    }

    async fn query_changed_areas(
        &self,
        snapshot: &ManagedRef,
        disk: &VirtualDisk,
        since: &Checkpoint,
        start_offset: u64,
    ) -> Result<ChangedAreas> {
        let state = self.state();
        if !state.snapshot_configs.contains_key(snapshot) {
            return Err(AgentError::NotFound(format!("snapshot {}", snapshot)));
        }
        if state.denied_change_queries.contains(disk.disk_id()) {
            return Err(AgentError::AccessDenied(format!("changed areas of {}", disk.label)));
        }
        if !disk.change_tracking_enabled {
            return Err(AgentError::TrackingUnavailable(format!("disabled on {}", disk.label)));
        }

        let key = (disk.disk_id().to_string(), since.snapshot.clone());
        let Some(changes) = state.changes.get(&key) else {
            return Err(AgentError::TrackingUnavailable(format!(
                "no change set for {} since {}",
                disk.label, since.snapshot
            )));
        };

        let window_start = start_offset.saturating_add(state.window_gap);
        let remaining = disk.capacity_bytes.saturating_sub(window_start);
        let length = state.page_size.map_or(remaining, |p| p.min(remaining));
        let window = BlockExtent::new(window_start, length);

        let changed_area = changes
            .iter()
            .filter_map(|c| {
                let start = c.offset.max(window.offset);
                let end = c.end().min(window.end());
                (start < end).then(|| BlockExtent::new(start, end - start))
            })
            .collect();

        Ok(ChangedAreas {
            start_offset: window_start,
            length,
            changed_area,
        })
    }

    async fn create_snapshot(&self, vm: &ManagedRef, name: &str, description: &str) -> Result<ManagedRef> {
        let id = self.next_snapshot.fetch_add(1, Ordering::Relaxed);
        let snapshot = ManagedRef::snapshot(format!("snapshot-{}", id));

        let mut state = self.state();
        let entry = state
            .vms
            .get_mut(vm)
            .ok_or_else(|| AgentError::NotFound(format!("{}", vm)))?;

        let node = SnapshotTreeNode {
            snapshot: snapshot.clone(),
            name: name.to_string(),
            description: description.to_string(),
            create_time: Utc::now(),
            state: PowerState::PoweredOn,
            child_snapshot_list: Vec::new(),
        };

        let parent = entry.snapshots.current_snapshot.clone();
        let attached = match &parent {
            Some(parent) => match find_node_mut(&mut entry.snapshots.root_snapshot_list, parent) {
                Some(parent_node) => {
                    parent_node.child_snapshot_list.push(node.clone());
                    true
                }
                None => false,
            },
            None => false,
        };
        if !attached {
            entry.snapshots.root_snapshot_list.push(node);
        }
        entry.snapshots.current_snapshot = Some(snapshot.clone());

        let config = entry.config.clone();
        state.snapshot_configs.insert(snapshot.clone(), config);
        Ok(snapshot)
    }

    async fn remove_snapshot(&self, snapshot: &ManagedRef) -> Result<()> {
        let mut state = self.state();
        let mut removed = false;
        for vm in state.vms.values_mut() {
            if let Some(parent) = remove_node(&mut vm.snapshots.root_snapshot_list, snapshot, None) {
                if vm.snapshots.current_snapshot.as_ref() == Some(snapshot) {
                    vm.snapshots.current_snapshot = parent;
                }
                removed = true;
                break;
            }
        }
        if !removed {
            return Err(AgentError::NotFound(format!("snapshot {}", snapshot)));
        }
        state.snapshot_configs.remove(snapshot);
        state.removed_snapshots.push(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[tokio::test]
    async fn test_read_blocks_returns_disk_bytes() {
        let transport = testutil::transport();
        let disk = testutil::disk_a();
        let data = transport
            .read_blocks(&testutil::current_snapshot(), &disk, BlockExtent::new(10, 5))
            .await
            .unwrap();
        assert_eq!(&data[..], &testutil::disk_a_content()[10..15]);
        assert_eq!(transport.bytes_read(), 5);
    }

    #[tokio::test]
    async fn test_transient_read_fault_clears() {
        let transport = testutil::transport();
        let disk = testutil::disk_a();
        transport.fail_reads_at(testutil::DISK_A, 12, ReadFault::Transient(1));

        let extent = BlockExtent::new(10, 5);
        let first = transport.read_blocks(&testutil::current_snapshot(), &disk, extent).await;
        assert!(matches!(first, Err(AgentError::RemoteUnavailable(_))));

        let second = transport.read_blocks(&testutil::current_snapshot(), &disk, extent).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_create_and_remove_snapshot() {
        let transport = testutil::transport();
        let vm = testutil::vm_ref();

        let created = transport.create_snapshot(&vm, "adhoc", "").await.unwrap();
        assert_eq!(transport.current_snapshot(&vm), Some(created.clone()));
        let config = transport.read_property(&created, "config").await.unwrap();
        assert!(config.get("disks").is_some());

        transport.remove_snapshot(&created).await.unwrap();
        assert_eq!(transport.current_snapshot(&vm), Some(testutil::current_snapshot()));
        assert_eq!(transport.removed_snapshots(), vec![created.clone()]);

        let err = transport.remove_snapshot(&created).await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_property_is_not_found() {
        let transport = testutil::transport();
        let err = transport
            .read_property(&testutil::vm_ref(), "guest")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }
}
