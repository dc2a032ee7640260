//! In-memory repository with fault injection.

use super::BlockSink;
use crate::cbt::extent::BlockExtent;
use crate::utils::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    blocks: BTreeMap<(String, BlockExtent), Bytes>,
    fail_offsets: HashSet<(String, u64)>,
    panic_offsets: HashSet<(String, u64)>,
    writes: usize,
}

#[derive(Default)]
pub struct MemorySink {
    inner: Mutex<Inner>,
    write_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every write of an extent starting at `offset` on `disk_id` fails with
    /// a storage error.
    pub fn fail_writes_at(&self, disk_id: &str, offset: u64) {
        self.inner().fail_offsets.insert((disk_id.to_string(), offset));
    }

    /// Every write of an extent starting at `offset` on `disk_id` panics.
    pub fn panic_writes_at(&self, disk_id: &str, offset: u64) {
        self.inner().panic_offsets.insert((disk_id.to_string(), offset));
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    pub fn block(&self, disk_id: &str, extent: BlockExtent) -> Option<Bytes> {
        self.inner().blocks.get(&(disk_id.to_string(), extent)).cloned()
    }

    /// Extents stored for `disk_id`, in offset order.
    pub fn extents(&self, disk_id: &str) -> Vec<BlockExtent> {
        self.inner()
            .blocks
            .keys()
            .filter(|(disk, _)| disk == disk_id)
            .map(|(_, extent)| *extent)
            .collect()
    }

    /// Reassemble the stored bytes of `disk_id` into a disk image of
    /// `capacity` bytes; unwritten ranges are zero.
    pub fn image(&self, disk_id: &str, capacity: u64) -> Vec<u8> {
        let mut image = vec![0u8; capacity as usize];
        for ((disk, extent), data) in self.inner().blocks.iter() {
            if disk != disk_id {
                continue;
            }
            let start = extent.offset as usize;
            let end = (start + data.len()).min(image.len());
            if start < end {
                image[start..end].copy_from_slice(&data[..end - start]);
            }
        }
        image
    }

    /// Successful writes, counting rewrites.
    pub fn write_count(&self) -> usize {
        self.inner().writes
    }

    /// Highest number of writes observed in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlockSink for MemorySink {
    async fn write_block(&self, disk_id: &str, extent: BlockExtent, data: Bytes) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.write_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let key = (disk_id.to_string(), extent.offset);
        let (fail, panic) = {
            let inner = self.inner();
            (inner.fail_offsets.contains(&key), inner.panic_offsets.contains(&key))
        };
        if panic {
            panic!("injected sink panic at {} of {}", extent, disk_id);
        }
        if fail {
            return Err(AgentError::Storage(format!(
                "injected write failure at {} of {}",
                extent, disk_id
            )));
        }

        let mut inner = self.inner();
        inner.blocks.insert((disk_id.to_string(), extent), data);
        inner.writes += 1;
        Ok(())
    }
}
