//! Session-authenticated access to the hypervisor management endpoint.
//!
//! Every call may fail with a transient (`RemoteUnavailable`, `Connection`)
//! or fatal error; retries belong to the layer issuing the call. A single
//! transport is shared by all workers of all running operations, so
//! implementations must be safe for concurrent use.

pub mod http;
pub mod memory;

use crate::cbt::checkpoint::Checkpoint;
use crate::cbt::extent::BlockExtent;
use crate::inventory::disk::VirtualDisk;
use crate::inventory::entity::{EntityRef, ManagedRef};
use crate::utils::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use http::HttpTransport;
pub use memory::MemoryTransport;

/// An established session with the management endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,

    /// Instance uuid of the endpoint that owns every object seen through
    /// this session
    pub instance_uuid: String,

    #[serde(default = "Utc::now")]
    pub connected_at: DateTime<Utc>,
}

impl Session {
    /// Mint an entity ref owned by this session's endpoint.
    pub fn entity(&self, name: impl Into<String>, reference: ManagedRef) -> EntityRef {
        EntityRef::new(name, reference, &self.instance_uuid)
    }
}

/// One window of a changed-block tracking report.
///
/// The endpoint answers for `[start_offset, start_offset + length)`; callers
/// continue from the end of the window until the disk is covered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedAreas {
    pub start_offset: u64,
    pub length: u64,
    #[serde(default)]
    pub changed_area: Vec<BlockExtent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Session>;

    /// Read one property of a managed object.
    async fn read_property(&self, object: &ManagedRef, property: &str) -> Result<serde_json::Value>;

    /// Read the bytes of `extent` from `disk` as frozen by `snapshot`.
    async fn read_blocks(
        &self,
        snapshot: &ManagedRef,
        disk: &VirtualDisk,
        extent: BlockExtent,
    ) -> Result<Bytes>;

    /// Changed areas of `disk` between `since` and `snapshot`, starting at
    /// `start_offset`. Fails with `TrackingUnavailable` when change tracking
    /// is off for the disk.
    async fn query_changed_areas(
        &self,
        snapshot: &ManagedRef,
        disk: &VirtualDisk,
        since: &Checkpoint,
        start_offset: u64,
    ) -> Result<ChangedAreas>;

    async fn create_snapshot(&self, vm: &ManagedRef, name: &str, description: &str) -> Result<ManagedRef>;

    async fn remove_snapshot(&self, snapshot: &ManagedRef) -> Result<()>;
}

/// Read a property and decode it into `T`.
pub async fn read_typed<T: DeserializeOwned>(
    transport: &dyn Transport,
    object: &ManagedRef,
    property: &str,
) -> Result<T> {
    let value = transport.read_property(object, property).await?;
    serde_json::from_value(value).map_err(|e| {
        AgentError::RemoteProtocol(format!("malformed {} of {}: {}", property, object, e))
    })
}
