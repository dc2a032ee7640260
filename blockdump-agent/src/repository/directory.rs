//! Filesystem repository: one file per written extent.
//!
//! Layout: `<root>/<disk_id>/<offset:016x>-<length:x>.blk`, with a `.zst`
//! suffix when compression is on. Files are written to a temporary name and
//! renamed into place, so a rewrite of the same extent replaces the file whole.

use super::BlockSink;
use crate::cbt::extent::BlockExtent;
use crate::utils::{path_component, AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Blocks at or above this size are compressed on the blocking pool.
const INLINE_COMPRESS_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "codec", content = "level", rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd(i32),
}

impl Compression {
    fn suffix(&self) -> &'static str {
        match self {
            Compression::None => "blk",
            Compression::Zstd(_) => "blk.zst",
        }
    }
}

pub struct DirectorySink {
    root: PathBuf,
    compression: Compression,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>, compression: Compression) -> Self {
        Self {
            root: root.into(),
            compression,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn block_path(&self, disk_id: &str, extent: BlockExtent) -> PathBuf {
        self.root.join(path_component(disk_id)).join(format!(
            "{:016x}-{:x}.{}",
            extent.offset,
            extent.length,
            self.compression.suffix()
        ))
    }

    /// Read back a stored extent, decompressing if needed.
    pub async fn read_block(&self, disk_id: &str, extent: BlockExtent) -> Result<Bytes> {
        let path = self.block_path(disk_id, extent);
        let raw = tokio::fs::read(&path).await.map_err(|e| {
            AgentError::Storage(format!("failed to read {}: {}", path.display(), e))
        })?;

        match self.compression {
            Compression::None => Ok(Bytes::from(raw)),
            Compression::Zstd(_) => {
                let decoded = tokio::task::spawn_blocking(move || zstd::stream::decode_all(raw.as_slice()))
                    .await
                    .map_err(|e| AgentError::WorkerFault(format!("decompression task failed: {}", e)))?
                    .map_err(|e| AgentError::Storage(format!("corrupt block {}: {}", path.display(), e)))?;
                Ok(Bytes::from(decoded))
            }
        }
    }

    async fn encode(&self, data: Bytes) -> Result<Bytes> {
        let Compression::Zstd(level) = self.compression else {
            return Ok(data);
        };

        let encoded = if data.len() < INLINE_COMPRESS_LIMIT {
            zstd::bulk::compress(&data, level)
        } else {
            tokio::task::spawn_blocking(move || zstd::bulk::compress(&data, level))
                .await
                .map_err(|e| AgentError::WorkerFault(format!("compression task failed: {}", e)))?
        };
        encoded
            .map(Bytes::from)
            .map_err(|e| AgentError::Storage(format!("zstd compression failed: {}", e)))
    }
}

#[async_trait]
impl BlockSink for DirectorySink {
    async fn write_block(&self, disk_id: &str, extent: BlockExtent, data: Bytes) -> Result<()> {
        let path = self.block_path(disk_id, extent);
        let storage = |e: std::io::Error| AgentError::Storage(format!("{}: {}", path.display(), e));

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage)?;
        }

        let raw_len = data.len();
        let payload = self.encode(data).await?;

        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &payload).await.map_err(storage)?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(storage(e));
        }

        debug!(
            disk = disk_id,
            %extent,
            bytes = raw_len,
            stored = payload.len(),
            "Stored block"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read_back_uncompressed() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path(), Compression::None);
        let extent = BlockExtent::new(4096, 5);

        sink.write_block("6000C29a", extent, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let path = dir.path().join("6000C29a").join("0000000000001000-5.blk");
        assert!(path.exists());
        assert_eq!(sink.read_block("6000C29a", extent).await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_zstd_compression() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path(), Compression::Zstd(3));
        let extent = BlockExtent::new(0, 128 * 1024);
        let data = Bytes::from(vec![7u8; 128 * 1024]);

        sink.write_block("d1", extent, data.clone()).await.unwrap();

        let path = sink.block_path("d1", extent);
        assert!(path.to_string_lossy().ends_with(".blk.zst"));
        let stored = std::fs::metadata(&path).unwrap().len();
        assert!(stored < data.len() as u64);
        assert_eq!(sink.read_block("d1", extent).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_rewrite_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path(), Compression::None);
        let extent = BlockExtent::new(0, 3);

        sink.write_block("d1", extent, Bytes::from_static(b"abc")).await.unwrap();
        sink.write_block("d1", extent, Bytes::from_static(b"abc")).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("d1")).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(sink.read_block("d1", extent).await.unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn test_unwritable_root_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let sink = DirectorySink::new(&blocker, Compression::None);
        let err = sink
            .write_block("d1", BlockExtent::new(0, 1), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Storage(_)));
    }
}
