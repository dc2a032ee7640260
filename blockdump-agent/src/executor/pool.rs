//! Bounded concurrent transfer of extents from a snapshot into the repository.
//!
//! The pool owns a set of permits shared by every disk dumped through it.
//! A dispatcher task admits extents in order, one per free permit, and each
//! admitted extent runs in its own task that reads it through the transport
//! and writes it to the sink. Every admitted extent produces exactly one
//! [`ExBlockOutcome`] on the returned stream; errors and panics become
//! failure outcomes, nothing is retried here.

use super::outcome::ExBlockOutcome;
use crate::cbt::extent::BlockExtent;
use crate::inventory::disk::{DiskConfig, VirtualDisk};
use crate::inventory::entity::ManagedRef;
use crate::repository::BlockSink;
use crate::transport::Transport;
use crate::utils::{AgentError, Result};
use futures_util::{FutureExt, Stream};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a transfer task needs to move one disk's extents.
pub struct DumpContext {
    config: Arc<DiskConfig>,
    disk_index: usize,
    snapshot: ManagedRef,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn BlockSink>,
    max_io_size: u64,
}

impl DumpContext {
    pub fn new(
        config: Arc<DiskConfig>,
        disk_key: i32,
        snapshot: ManagedRef,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn BlockSink>,
        max_io_size: u64,
    ) -> Result<Self> {
        let disk_index = config
            .position(disk_key)
            .ok_or_else(|| AgentError::NotFound(format!("disk {} in snapshot config", disk_key)))?;

        Ok(Self {
            config,
            disk_index,
            snapshot,
            transport,
            sink,
            max_io_size: max_io_size.max(1),
        })
    }

    pub fn disk(&self) -> &VirtualDisk {
        &self.config.disks[self.disk_index]
    }
}

/// Operation-wide transfer pool.
#[derive(Clone)]
pub struct DumpWorkerPool {
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl DumpWorkerPool {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Start dumping `extents` of the disk described by `ctx`.
    ///
    /// `attempt` is stamped on every outcome. Once `cancel` fires no further
    /// extent is admitted; transfers already running finish normally.
    pub fn dump(
        &self,
        ctx: Arc<DumpContext>,
        extents: Vec<BlockExtent>,
        attempt: u32,
        cancel: CancellationToken,
    ) -> DumpStream {
        let (tx, rx) = mpsc::channel(self.concurrency * 2);
        let permits = self.permits.clone();

        let dispatcher = tokio::spawn(async move {
            let total = extents.len();
            let mut admitted = 0usize;
            let mut tasks = JoinSet::new();

            for extent in extents {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                if cancel.is_cancelled() {
                    break;
                }

                admitted += 1;
                let ctx = ctx.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    let outcome = AssertUnwindSafe(transfer(&ctx, extent, attempt))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            let err = AgentError::WorkerFault(panic_message(&*panic));
                            warn!(disk = %ctx.disk().label, %extent, "Transfer task panicked: {}", err);
                            ExBlockOutcome::failure(extent, &err, 0, attempt)
                        });
                    drop(permit);
                    let _ = tx.send(outcome).await;
                });
            }

            if admitted < total {
                debug!(
                    disk = %ctx.disk().label,
                    admitted,
                    skipped = total - admitted,
                    "Stopped admitting extents after cancellation"
                );
            }

            while tasks.join_next().await.is_some() {}
            admitted
        });

        DumpStream { rx, dispatcher }
    }
}

/// Outcomes of one [`DumpWorkerPool::dump`] call, in completion order.
pub struct DumpStream {
    rx: mpsc::Receiver<ExBlockOutcome>,
    dispatcher: JoinHandle<usize>,
}

impl DumpStream {
    /// Wait for the dispatcher and every admitted transfer. Returns how many
    /// extents were admitted and the outcomes not yet read from the stream.
    pub async fn finish(mut self) -> Result<(usize, Vec<ExBlockOutcome>)> {
        let mut unread = Vec::new();
        while let Some(outcome) = self.rx.recv().await {
            unread.push(outcome);
        }
        let admitted = self
            .dispatcher
            .await
            .map_err(|e| AgentError::WorkerFault(format!("dispatcher failed: {}", e)))?;
        Ok((admitted, unread))
    }
}

impl Stream for DumpStream {
    type Item = ExBlockOutcome;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

async fn transfer(ctx: &DumpContext, extent: BlockExtent, attempt: u32) -> ExBlockOutcome {
    let disk = ctx.disk();
    let mut written = 0u64;

    for piece in extent.pieces(ctx.max_io_size) {
        if let Err(e) = transfer_piece(ctx, disk, piece).await {
            debug!(disk = %disk.label, %extent, %piece, attempt, "Transfer failed: {}", e);
            return ExBlockOutcome::failure(extent, &e, written, attempt);
        }
        written += piece.length;
    }

    ExBlockOutcome::success(extent, written, attempt)
}

async fn transfer_piece(ctx: &DumpContext, disk: &VirtualDisk, piece: BlockExtent) -> Result<()> {
    let data = ctx.transport.read_blocks(&ctx.snapshot, disk, piece).await?;
    if data.len() as u64 != piece.length {
        return Err(AgentError::RemoteProtocol(format!(
            "read of {} returned {} bytes",
            piece,
            data.len()
        )));
    }
    ctx.sink.write_block(disk.disk_id(), piece, data).await
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "transfer task panicked".to_string()
    }
}
