//! Computes the extents a backup has to transfer.

use super::checkpoint::Checkpoint;
use super::extent::{merge_extents, BlockExtent};
use crate::executor::retry::RetryPolicy;
use crate::inventory::disk::VirtualDisk;
use crate::inventory::snapshot::SnapshotBinding;
use crate::transport::Transport;
use crate::utils::{AgentError, Result};
use std::sync::Arc;
use tracing::debug;

/// The whole disk as one extent.
pub fn full_extent(disk: &VirtualDisk) -> Vec<BlockExtent> {
    vec![BlockExtent::new(0, disk.capacity_bytes)]
}

pub struct BlockEnumerator {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl BlockEnumerator {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Extents of `disk` to transfer for a backup of `binding`.
    ///
    /// Without `since` this is the full disk. With `since`, it is the union of
    /// the areas changed between the checkpoint and the bound snapshot, merged
    /// and clamped to capacity; an empty list means nothing changed. Fails with
    /// `TrackingUnavailable` if change tracking is off for the disk, which the
    /// caller answers with a full backup.
    pub async fn enumerate(
        &self,
        binding: &SnapshotBinding,
        disk: &VirtualDisk,
        since: Option<&Checkpoint>,
    ) -> Result<Vec<BlockExtent>> {
        let Some(since) = since else {
            return Ok(full_extent(disk));
        };

        if !disk.change_tracking_enabled {
            return Err(AgentError::TrackingUnavailable(format!(
                "change tracking is disabled for {}",
                disk.label
            )));
        }

        let capacity = disk.capacity_bytes;
        let mut changed = Vec::new();
        let mut offset = 0u64;
        let mut windows = 0usize;

        while offset < capacity {
            let areas = self
                .retry
                .run("changed area query", || {
                    self.transport
                        .query_changed_areas(binding.snapshot_ref(), disk, since, offset)
                })
                .await?;
            windows += 1;

            if areas.start_offset > offset {
                return Err(AgentError::RemoteProtocol(format!(
                    "changed area window for {} starts at {}, expected {}",
                    disk.label, areas.start_offset, offset
                )));
            }
            let window_end = areas.start_offset.saturating_add(areas.length);
            if window_end <= offset {
                return Err(AgentError::RemoteProtocol(format!(
                    "changed area window at {} made no progress for {}",
                    offset, disk.label
                )));
            }

            changed.extend(areas.changed_area.iter().filter_map(|a| a.clip_to(capacity)));
            offset = window_end;
        }

        let merged = merge_extents(changed);
        debug!(
            disk = %disk.label,
            since = %since.snapshot,
            windows,
            extents = merged.len(),
            "Enumerated changed areas"
        );
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::snapshot::SnapshotBinder;
    use crate::testutil;
    use crate::transport::MemoryTransport;

    async fn bind(transport: &Arc<MemoryTransport>) -> SnapshotBinding {
        let session = transport.connect().await.unwrap();
        let vm = session.entity("web-01", testutil::vm_ref());
        let binder = SnapshotBinder::new(transport.clone(), testutil::fast_retry());
        let info = binder.fetch_tree(&vm).await.unwrap();
        binder.bind(&session, &vm, &info).await.unwrap()
    }

    #[tokio::test]
    async fn test_without_checkpoint_returns_full_disk() {
        let transport = Arc::new(testutil::transport());
        let binding = bind(&transport).await;
        let enumerator = BlockEnumerator::new(transport.clone(), testutil::fast_retry());

        for disk in &binding.config().disks {
            let extents = enumerator.enumerate(&binding, disk, None).await.unwrap();
            assert_eq!(extents, vec![BlockExtent::new(0, disk.capacity_bytes)]);
        }
    }

    #[tokio::test]
    async fn test_changed_areas_are_merged_across_windows() {
        let transport = Arc::new(testutil::transport());
        transport.set_changes(
            testutil::DISK_A,
            &testutil::base_snapshot(),
            vec![
                BlockExtent::new(0, 10),
                BlockExtent::new(10, 10),
                BlockExtent::new(40, 10),
                BlockExtent::new(95, 20),
            ],
        );
        transport.set_page_size(32);
        let binding = bind(&transport).await;
        let enumerator = BlockEnumerator::new(transport.clone(), testutil::fast_retry());
        let disk = binding.config().disk(testutil::DISK_A_KEY).unwrap();

        let since = testutil::checkpoint(&testutil::base_snapshot());
        let extents = enumerator.enumerate(&binding, disk, Some(&since)).await.unwrap();

        assert_eq!(
            extents,
            vec![
                BlockExtent::new(0, 20),
                BlockExtent::new(40, 10),
                BlockExtent::new(95, 5),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_changes_is_empty_not_error() {
        let transport = Arc::new(testutil::transport());
        transport.set_changes(testutil::DISK_A, &testutil::base_snapshot(), vec![]);
        let binding = bind(&transport).await;
        let enumerator = BlockEnumerator::new(transport.clone(), testutil::fast_retry());
        let disk = binding.config().disk(testutil::DISK_A_KEY).unwrap();

        let since = testutil::checkpoint(&testutil::base_snapshot());
        let extents = enumerator.enumerate(&binding, disk, Some(&since)).await.unwrap();
        assert!(extents.is_empty());
    }

    #[tokio::test]
    async fn test_tracking_disabled_fails_with_tracking_unavailable() {
        let transport = Arc::new(testutil::transport());
        let binding = bind(&transport).await;
        let enumerator = BlockEnumerator::new(transport.clone(), testutil::fast_retry());
        let disk = binding.config().disk(testutil::DISK_B_KEY).unwrap();
        assert!(!disk.change_tracking_enabled);

        let since = testutil::checkpoint(&testutil::base_snapshot());
        let err = enumerator.enumerate(&binding, disk, Some(&since)).await.unwrap_err();
        assert!(matches!(err, AgentError::TrackingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_tracking_reset_reported_by_endpoint() {
        // Tracking is on in the config but the endpoint has no change set
        // for the checkpoint's snapshot.
        let transport = Arc::new(testutil::transport());
        let binding = bind(&transport).await;
        let enumerator = BlockEnumerator::new(transport.clone(), testutil::fast_retry());
        let disk = binding.config().disk(testutil::DISK_A_KEY).unwrap();

        let since = testutil::checkpoint(&crate::inventory::entity::ManagedRef::snapshot("snapshot-old"));
        let err = enumerator.enumerate(&binding, disk, Some(&since)).await.unwrap_err();
        assert!(matches!(err, AgentError::TrackingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_window_leaving_a_gap_is_rejected() {
        let transport = Arc::new(testutil::transport());
        transport.set_changes(
            testutil::DISK_A,
            &testutil::base_snapshot(),
            vec![BlockExtent::new(10, 5), BlockExtent::new(60, 10)],
        );
        transport.set_page_size(50);
        transport.set_change_window_gap(50);
        let binding = bind(&transport).await;
        let enumerator = BlockEnumerator::new(transport.clone(), testutil::fast_retry());
        let disk = binding.config().disk(testutil::DISK_A_KEY).unwrap();

        let since = testutil::checkpoint(&testutil::base_snapshot());
        let err = enumerator.enumerate(&binding, disk, Some(&since)).await.unwrap_err();
        assert!(matches!(err, AgentError::RemoteProtocol(_)));
    }
}
