//! Snapshot tree lookup and binding of a backup to the current snapshot.
//!
//! The VM's `snapshot` property is a nested tree. It is flattened into an
//! arena of nodes indexed by position, and the current snapshot is found with
//! a depth-first search by reference. The binding produced from it is owned
//! by the backup operation alone; nothing points back at it from the VM.

use super::disk::DiskConfig;
use super::entity::{EntityRef, ManagedRef};
use crate::executor::retry::RetryPolicy;
use crate::transport::{read_typed, Session, Transport};
use crate::utils::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// Node of the nested snapshot tree as reported by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTreeNode {
    pub snapshot: ManagedRef,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub create_time: DateTime<Utc>,
    pub state: PowerState,
    #[serde(default)]
    pub child_snapshot_list: Vec<SnapshotTreeNode>,
}

/// The VM's `snapshot` property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSnapshotInfo {
    #[serde(default)]
    pub current_snapshot: Option<ManagedRef>,
    #[serde(default)]
    pub root_snapshot_list: Vec<SnapshotTreeNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNode {
    pub snapshot: ManagedRef,
    pub name: String,
    pub description: String,
    pub create_time: DateTime<Utc>,
    pub state: PowerState,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Immutable, acyclic arena of snapshot nodes.
#[derive(Debug, Clone, Default)]
pub struct SnapshotTree {
    nodes: Vec<SnapshotNode>,
    roots: Vec<usize>,
}

impl SnapshotTree {
    pub fn from_info(info: &VmSnapshotInfo) -> Self {
        let mut tree = Self::default();
        for root in &info.root_snapshot_list {
            let idx = tree.insert(root, None);
            tree.roots.push(idx);
        }
        tree
    }

    fn insert(&mut self, node: &SnapshotTreeNode, parent: Option<usize>) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(SnapshotNode {
            snapshot: node.snapshot.clone(),
            name: node.name.clone(),
            description: node.description.clone(),
            create_time: node.create_time,
            state: node.state,
            parent,
            children: Vec::with_capacity(node.child_snapshot_list.len()),
        });
        for child in &node.child_snapshot_list {
            let child_idx = self.insert(child, Some(idx));
            self.nodes[idx].children.push(child_idx);
        }
        idx
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth-first search for the node holding `reference`.
    pub fn find(&self, reference: &ManagedRef) -> Result<&SnapshotNode> {
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if &node.snapshot == reference {
                return Ok(node);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        Err(AgentError::NotFound(format!(
            "snapshot {} is not in the snapshot tree",
            reference
        )))
    }

    /// Snapshot names from the root down to `reference`.
    pub fn path_to(&self, reference: &ManagedRef) -> Result<Vec<&str>> {
        let mut idx = self
            .nodes
            .iter()
            .position(|n| &n.snapshot == reference)
            .ok_or_else(|| AgentError::NotFound(format!("snapshot {} is not in the snapshot tree", reference)))?;
        let mut path = vec![self.nodes[idx].name.as_str()];
        while let Some(parent) = self.nodes[idx].parent {
            path.push(self.nodes[parent].name.as_str());
            idx = parent;
        }
        path.reverse();
        Ok(path)
    }
}

/// A backup operation's view of the snapshot it reads from.
#[derive(Debug, Clone)]
pub struct SnapshotBinding {
    vm: EntityRef,
    snapshot: EntityRef,
    create_time: DateTime<Utc>,
    description: String,
    power_state: PowerState,
    config: Arc<DiskConfig>,
}

impl SnapshotBinding {
    pub fn vm(&self) -> &EntityRef {
        &self.vm
    }

    pub fn snapshot(&self) -> &EntityRef {
        &self.snapshot
    }

    pub fn snapshot_ref(&self) -> &ManagedRef {
        self.snapshot.reference()
    }

    pub fn name(&self) -> &str {
        self.snapshot.name()
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn power_state(&self) -> PowerState {
        self.power_state
    }

    /// Disk layout frozen at the snapshot.
    pub fn config(&self) -> &Arc<DiskConfig> {
        &self.config
    }
}

/// Resolves the current snapshot of a VM and the disk layout frozen with it.
pub struct SnapshotBinder {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl SnapshotBinder {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Read the VM's snapshot tree.
    pub async fn fetch_tree(&self, vm: &EntityRef) -> Result<VmSnapshotInfo> {
        self.retry
            .run("snapshot tree read", || {
                read_typed::<VmSnapshotInfo>(self.transport.as_ref(), vm.reference(), "snapshot")
            })
            .await
    }

    /// Bind to the VM's current snapshot.
    ///
    /// Fails with `NotFound` when the VM has no current snapshot, or when the
    /// current snapshot is missing from the tree.
    pub async fn bind(
        &self,
        session: &Session,
        vm: &EntityRef,
        info: &VmSnapshotInfo,
    ) -> Result<SnapshotBinding> {
        let current = info.current_snapshot.as_ref().ok_or_else(|| {
            AgentError::NotFound(format!("{} has no current snapshot", vm))
        })?;

        let tree = SnapshotTree::from_info(info);
        let node = tree.find(current)?;
        debug!(
            vm = %vm,
            snapshot = %current,
            chain = ?tree.path_to(current).unwrap_or_default(),
            "Resolved current snapshot"
        );

        let config: DiskConfig = self
            .retry
            .run("snapshot config read", || {
                read_typed::<DiskConfig>(self.transport.as_ref(), current, "config")
            })
            .await?;

        info!(
            vm = %vm,
            snapshot = %node.name,
            disks = config.disks.len(),
            "Bound backup to snapshot"
        );

        Ok(SnapshotBinding {
            vm: vm.clone(),
            snapshot: session.entity(&node.name, node.snapshot.clone()),
            create_time: node.create_time,
            description: node.description.clone(),
            power_state: node.state,
            config: Arc::new(config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use crate::transport::MemoryTransport;

    fn node(value: &str, children: Vec<SnapshotTreeNode>) -> SnapshotTreeNode {
        SnapshotTreeNode {
            snapshot: ManagedRef::snapshot(value),
            name: format!("name-{}", value),
            description: String::new(),
            create_time: Utc::now(),
            state: PowerState::PoweredOn,
            child_snapshot_list: children,
        }
    }

    fn sample_info() -> VmSnapshotInfo {
        VmSnapshotInfo {
            current_snapshot: Some(ManagedRef::snapshot("s4")),
            root_snapshot_list: vec![
                node("s1", vec![node("s2", vec![]), node("s3", vec![node("s4", vec![])])]),
                node("s5", vec![]),
            ],
        }
    }

    #[test]
    fn test_tree_flattening_and_lookup() {
        let tree = SnapshotTree::from_info(&sample_info());
        assert_eq!(tree.len(), 5);

        let found = tree.find(&ManagedRef::snapshot("s4")).unwrap();
        assert_eq!(found.name, "name-s4");
        assert_eq!(
            tree.path_to(&ManagedRef::snapshot("s4")).unwrap(),
            vec!["name-s1", "name-s3", "name-s4"]
        );
        assert!(tree.find(&ManagedRef::snapshot("s5")).is_ok());
    }

    #[test]
    fn test_missing_reference_is_not_found() {
        let tree = SnapshotTree::from_info(&sample_info());
        let err = tree.find(&ManagedRef::snapshot("gone")).unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[test]
    fn test_snapshot_info_wire_format() {
        let json = r#"{
            "currentSnapshot": {"kind": "VirtualMachineSnapshot", "value": "snapshot-2"},
            "rootSnapshotList": [{
                "snapshot": {"kind": "VirtualMachineSnapshot", "value": "snapshot-1"},
                "name": "nightly",
                "createTime": "2024-05-01T02:00:00Z",
                "state": "poweredOn",
                "childSnapshotList": [{
                    "snapshot": {"kind": "VirtualMachineSnapshot", "value": "snapshot-2"},
                    "name": "hourly",
                    "description": "quiesced",
                    "createTime": "2024-05-01T03:00:00Z",
                    "state": "suspended"
                }]
            }]
        }"#;
        let info: VmSnapshotInfo = serde_json::from_str(json).unwrap();
        let tree = SnapshotTree::from_info(&info);
        let current = tree.find(info.current_snapshot.as_ref().unwrap()).unwrap();
        assert_eq!(current.name, "hourly");
        assert_eq!(current.state, PowerState::Suspended);
        assert_eq!(current.parent, Some(0));
    }

    #[tokio::test]
    async fn test_bind_resolves_current_snapshot_and_config() {
        let transport = Arc::new(testutil::transport());
        let session = transport.connect().await.unwrap();
        let vm = session.entity("web-01", testutil::vm_ref());
        let binder = SnapshotBinder::new(transport.clone(), testutil::fast_retry());

        let info = binder.fetch_tree(&vm).await.unwrap();
        let binding = binder.bind(&session, &vm, &info).await.unwrap();

        assert_eq!(binding.snapshot_ref(), &testutil::current_snapshot());
        assert_eq!(binding.name(), "backup-2");
        assert_eq!(binding.power_state(), PowerState::PoweredOn);
        assert_eq!(binding.config().disks.len(), 2);
        assert_eq!(binding.snapshot().endpoint_instance_id(), testutil::INSTANCE_UUID);
    }

    #[tokio::test]
    async fn test_bind_fails_when_current_snapshot_absent_from_tree() {
        let transport = Arc::new(testutil::transport());
        let session = transport.connect().await.unwrap();
        let vm = session.entity("web-01", testutil::vm_ref());
        let binder = SnapshotBinder::new(transport.clone(), testutil::fast_retry());

        let mut info = binder.fetch_tree(&vm).await.unwrap();
        info.current_snapshot = Some(ManagedRef::snapshot("snapshot-404"));

        let err = binder.bind(&session, &vm, &info).await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_bind_without_current_snapshot_is_not_found() {
        let transport = Arc::new(MemoryTransport::new("vc-1"));
        let session = transport.connect().await.unwrap();
        let vm = session.entity("empty", ManagedRef::vm("vm-9"));
        let binder = SnapshotBinder::new(transport.clone(), testutil::fast_retry());

        let err = binder.bind(&session, &vm, &VmSnapshotInfo::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_config_read_retries_transient_failures() {
        let transport = Arc::new(testutil::transport());
        transport.fail_property_reads(&testutil::current_snapshot(), "config", 2);
        let session = transport.connect().await.unwrap();
        let vm = session.entity("web-01", testutil::vm_ref());
        let binder = SnapshotBinder::new(transport.clone(), testutil::fast_retry());

        let info = binder.fetch_tree(&vm).await.unwrap();
        let binding = binder.bind(&session, &vm, &info).await.unwrap();
        assert_eq!(binding.config().disks.len(), 2);
    }

    #[tokio::test]
    async fn test_config_read_access_denied_is_fatal() {
        let transport = Arc::new(testutil::transport());
        transport.deny(&testutil::current_snapshot());
        let session = transport.connect().await.unwrap();
        let vm = session.entity("web-01", testutil::vm_ref());
        let binder = SnapshotBinder::new(transport.clone(), testutil::fast_retry());

        let info = binder.fetch_tree(&vm).await.unwrap();
        let err = binder.bind(&session, &vm, &info).await.unwrap_err();
        assert!(matches!(err, AgentError::AccessDenied(_)));
    }
}
