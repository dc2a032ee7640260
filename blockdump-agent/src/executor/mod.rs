//! Backup executor - orchestrates a changed-block backup of one VM.
//!
//! An operation goes through these steps:
//! - connect and resolve the VM
//! - bind the current snapshot (optionally creating it first)
//! - enumerate extents for every selected disk
//! - dump all disks through one shared worker pool, resubmitting extents
//!   that failed transiently
//! - record checkpoints and report totals per disk

pub mod ledger;
pub mod outcome;
pub mod pool;
pub mod retry;
pub mod state;
pub mod tracker;

pub use ledger::{BlockLedger, TotalBlocksInfo};
pub use outcome::{BlockOutcome, ExBlockOutcome};
pub use pool::{DumpContext, DumpStream, DumpWorkerPool};
pub use retry::RetryPolicy;
pub use state::{DumpPhase, OperationState, PhaseTracker};
pub use tracker::OperationTracker;

use crate::cbt::checkpoint::{apply_resume_filter, Checkpoint, CheckpointRecord, CheckpointStore, PartialRun};
use crate::cbt::enumerator::{full_extent, BlockEnumerator};
use crate::cbt::extent::{total_length, BlockExtent};
use crate::inventory::disk::{DiskConfig, VirtualDisk};
use crate::inventory::entity::{EntityRef, ManagedRef};
use crate::inventory::snapshot::{SnapshotBinder, SnapshotBinding};
use crate::report::{notify, DiskReporter, Reporter};
use crate::repository::BlockSink;
use crate::transport::{read_typed, Session, Transport};
use crate::utils::{AgentError, ErrorDetail, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tuning of a backup operation.
#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// Maximum concurrent extent transfers across all disks
    pub concurrency: usize,

    /// Largest single read/write; longer extents are moved in pieces
    pub max_io_size: u64,

    pub retry: RetryPolicy,

    /// Take a fresh snapshot instead of backing up the current one
    pub create_snapshot: bool,

    /// Remove a snapshot this agent created once the backup succeeded
    pub remove_snapshot_after: bool,

    pub snapshot_prefix: String,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_io_size: 4 * 1024 * 1024,
            retry: RetryPolicy::default(),
            create_snapshot: false,
            remove_snapshot_after: true,
            snapshot_prefix: "blockdump".to_string(),
        }
    }
}

/// Backup job configuration
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub operation_id: Uuid,
    pub vm: ManagedRef,

    /// Device keys of the disks to back up; all disks when `None`
    pub disks: Option<Vec<i32>>,

    /// Ignore checkpoints and dump every disk in full
    pub full: bool,
}

impl BackupRequest {
    pub fn new(vm: ManagedRef) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            vm,
            disks: None,
            full: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DumpMode {
    Full,
    Incremental,
    /// Incremental was requested but change tracking was unavailable
    FullFallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskReport {
    pub totals: TotalBlocksInfo,
    pub state: OperationState,

    /// `None` when the operation aborted before this disk was enumerated
    pub mode: Option<DumpMode>,

    /// Extents skipped because an earlier run already stored them
    pub resumed_extents: usize,

    /// Extents never admitted because the operation was cancelled
    pub not_admitted: usize,

    pub failed_extents: Vec<BlockExtent>,
}

/// Backup execution result
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub operation_id: Uuid,
    pub vm: ManagedRef,
    pub vm_name: Option<String>,
    pub snapshot: Option<EntityRef>,
    pub state: OperationState,
    pub disks: Vec<DiskReport>,

    /// Why the operation was aborted, when it was
    pub abort_reason: Option<ErrorDetail>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupReport {
    fn new(request: &BackupRequest) -> Self {
        Self {
            operation_id: request.operation_id,
            vm: request.vm.clone(),
            vm_name: None,
            snapshot: None,
            state: OperationState::Running,
            disks: Vec::new(),
            abort_reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn disk(&self, disk_id: &str) -> Option<&DiskReport> {
        self.disks
            .iter()
            .find(|d| d.totals.disk.reference().value == disk_id)
    }
}

/// Per-disk state of a running operation.
struct DiskRun {
    disk: VirtualDisk,
    reporter: Arc<dyn DiskReporter>,
    phase: PhaseTracker,
    ledger: BlockLedger,
    record: Option<CheckpointRecord>,
    mode: Option<DumpMode>,
    base: Option<ManagedRef>,
    extents: Vec<BlockExtent>,

    /// Extents stored by an earlier run and skipped by this one
    carried: Vec<BlockExtent>,

    completed: Vec<BlockExtent>,
    failed: Vec<BlockExtent>,
    not_admitted: usize,
}

impl DiskRun {
    fn new(disk: VirtualDisk, entity: EntityRef, reporter: Arc<dyn DiskReporter>) -> Self {
        Self {
            disk,
            reporter,
            phase: PhaseTracker::new(),
            ledger: BlockLedger::new(entity),
            record: None,
            mode: None,
            base: None,
            extents: Vec::new(),
            carried: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            not_admitted: 0,
        }
    }

    fn settle(&mut self, outcome: ExBlockOutcome) {
        self.ledger.record(&outcome);
        if outcome.is_success() {
            self.completed.push(outcome.extent);
            notify("block_succeeded", || self.reporter.block_succeeded(&outcome));
        } else {
            self.failed.push(outcome.extent);
            notify("block_failed", || self.reporter.block_failed(&outcome));
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.phase.phase(), DumpPhase::Finished(_))
    }

    fn finish(&mut self, state: OperationState) -> Result<()> {
        self.phase.finish(state)?;
        let totals = self.ledger.snapshot();
        notify("dump_finished", || self.reporter.dump_finished(state, &totals));
        Ok(())
    }

    fn abort(&mut self) {
        if self.is_finished() {
            return;
        }
        if let Err(e) = self.finish(OperationState::Aborted) {
            error!(disk = %self.disk.label, "Failed to abort disk dump: {}", e);
        }
    }

    fn report(&self) -> DiskReport {
        let mut failed_extents = self.failed.clone();
        failed_extents.sort_unstable();
        DiskReport {
            totals: self.ledger.snapshot(),
            state: self.phase.phase().state(),
            mode: self.mode,
            resumed_extents: self.carried.len(),
            not_admitted: self.not_admitted,
            failed_extents,
        }
    }
}

/// Main backup executor
pub struct BackupExecutor {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn BlockSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    reporter: Arc<dyn Reporter>,
    options: DumpOptions,
    cancel_token: CancellationToken,
    cleanup: Mutex<Vec<JoinHandle<()>>>,
}

impl BackupExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn BlockSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        reporter: Arc<dyn Reporter>,
        options: DumpOptions,
    ) -> Self {
        Self {
            transport,
            sink,
            checkpoints,
            reporter,
            options,
            cancel_token: CancellationToken::new(),
            cleanup: Mutex::new(Vec::new()),
        }
    }

    /// Use `cancel_token` to stop the operation from outside.
    pub fn with_cancel(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Run one backup operation. Never fails: fatal errors end the operation
    /// in `Aborted` with the cause in [`BackupReport::abort_reason`].
    pub async fn execute(&self, request: BackupRequest) -> BackupReport {
        let mut report = BackupReport::new(&request);
        info!(
            operation = %request.operation_id,
            vm = %request.vm,
            full = request.full,
            concurrency = self.options.concurrency,
            "Starting backup execution"
        );

        if let Err(e) = self.run(&request, &mut report).await {
            match &e {
                AgentError::Cancelled => warn!(operation = %request.operation_id, "Backup cancelled"),
                _ => error!(operation = %request.operation_id, "Backup aborted: {}", e),
            }
            report.state = OperationState::Aborted;
            report.abort_reason = Some(ErrorDetail::from(&e));
        }

        report.finished_at = Some(Utc::now());
        notify("operation_finished", || self.reporter.operation_finished(&report));
        report
    }

    /// Wait for background snapshot removals started by earlier operations.
    pub async fn wait_for_cleanup(&self) {
        let handles = std::mem::take(&mut *self.cleanup.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Snapshot cleanup task failed: {}", e);
            }
        }
    }

    async fn run(&self, request: &BackupRequest, report: &mut BackupReport) -> Result<()> {
        let retry = &self.options.retry;
        if self.cancel_token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let session = retry
            .run("session connect", || self.transport.connect())
            .await?;
        let name: String = retry
            .run("vm name read", || {
                read_typed(self.transport.as_ref(), &request.vm, "name")
            })
            .await?;
        report.vm_name = Some(name.clone());
        let vm = session.entity(name, request.vm.clone());
        notify("operation_started", || {
            self.reporter.operation_started(request.operation_id, &vm)
        });

        let binder = SnapshotBinder::new(self.transport.clone(), retry.clone());
        let (binding, owned_snapshot) = self.bind_snapshot(&binder, &session, &vm, request).await?;
        report.snapshot = Some(binding.snapshot().clone());
        info!(
            vm = %binding.vm(),
            snapshot = %binding.snapshot(),
            created = %binding.create_time(),
            power_state = ?binding.power_state(),
            description = binding.description(),
            disks = binding.config().disks.len(),
            "Bound snapshot"
        );

        let mut runs: Vec<DiskRun> = select_disks(binding.config(), request.disks.as_deref())?
            .into_iter()
            .map(|disk| {
                let entity = disk.entity(&session.instance_uuid);
                let reporter = crate::report::disk_reporter(self.reporter.as_ref(), &entity);
                DiskRun::new(disk.clone(), entity, reporter)
            })
            .collect();

        let result = self.dump_disks(request, &vm, &binding, &mut runs).await;
        report.disks = runs.iter().map(DiskRun::report).collect();
        result?;

        if self.cancel_token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        report.state = OperationState::combine(report.disks.iter().map(|d| d.state));

        if report.state == OperationState::CompletedSuccess && self.options.remove_snapshot_after {
            if let Some(snapshot) = owned_snapshot {
                self.schedule_removal(snapshot);
            }
        }
        Ok(())
    }

    /// Bind the snapshot to back up. Returns the binding and, when the
    /// snapshot belongs to this agent, its reference.
    async fn bind_snapshot(
        &self,
        binder: &SnapshotBinder,
        session: &Session,
        vm: &EntityRef,
        request: &BackupRequest,
    ) -> Result<(SnapshotBinding, Option<ManagedRef>)> {
        let info = binder.fetch_tree(vm).await?;
        if !self.options.create_snapshot {
            return Ok((binder.bind(session, vm, &info).await?, None));
        }

        let existing = match binder.bind(session, vm, &info).await {
            Ok(binding) => Some(binding),
            Err(AgentError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if let Some(binding) = existing {
            if self.is_unfinished_target(vm, &binding, request).await? {
                info!(
                    vm = %vm,
                    snapshot = %binding.snapshot(),
                    "Reusing snapshot of an unfinished backup"
                );
                let owned = binding.snapshot_ref().clone();
                return Ok((binding, Some(owned)));
            }
        }

        let name = format!("{}-{}", self.options.snapshot_prefix, Utc::now().format("%Y%m%dT%H%M%S"));
        let description = format!("Changed-block backup {}", request.operation_id);
        let created = self
            .transport
            .create_snapshot(vm.reference(), &name, &description)
            .await?;
        info!(vm = %vm, snapshot = %created, name = %name, "Created backup snapshot");

        let info = binder.fetch_tree(vm).await?;
        let binding = binder.bind(session, vm, &info).await?;
        if binding.snapshot_ref() != &created {
            warn!(snapshot = %created, "Backup snapshot left behind");
            return Err(AgentError::RemoteProtocol(format!(
                "current snapshot is {} right after creating {}",
                binding.snapshot_ref(),
                created
            )));
        }
        Ok((binding, Some(created)))
    }

    /// Whether `binding` is an agent snapshot that an earlier run of this VM
    /// left unfinished.
    async fn is_unfinished_target(
        &self,
        vm: &EntityRef,
        binding: &SnapshotBinding,
        request: &BackupRequest,
    ) -> Result<bool> {
        if !binding.name().starts_with(&self.options.snapshot_prefix) {
            return Ok(false);
        }
        for disk in select_disks(binding.config(), request.disks.as_deref())? {
            let record = self.checkpoints.load(vm.reference(), disk.disk_id()).await?;
            let unfinished = record
                .and_then(|r| r.partial)
                .is_some_and(|p| &p.target == binding.snapshot_ref());
            if unfinished {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn dump_disks(
        &self,
        request: &BackupRequest,
        vm: &EntityRef,
        binding: &SnapshotBinding,
        runs: &mut [DiskRun],
    ) -> Result<()> {
        // Every disk is enumerated before the first transfer starts.
        let enumerator = BlockEnumerator::new(self.transport.clone(), self.options.retry.clone());
        for i in 0..runs.len() {
            if self.cancel_token.is_cancelled() {
                runs.iter_mut().for_each(DiskRun::abort);
                return Err(AgentError::Cancelled);
            }
            if let Err(e) = self.enumerate_disk(&enumerator, request, vm, binding, &mut runs[i]).await {
                runs.iter_mut().for_each(DiskRun::abort);
                return Err(e);
            }
        }
        if self.cancel_token.is_cancelled() {
            runs.iter_mut().for_each(DiskRun::abort);
            return Err(AgentError::Cancelled);
        }

        let pool = DumpWorkerPool::new(self.options.concurrency);
        let results = join_all(
            runs.iter_mut()
                .map(|run| self.dump_disk(&pool, request, binding, run)),
        )
        .await;

        runs.iter_mut().for_each(DiskRun::abort);
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn enumerate_disk(
        &self,
        enumerator: &BlockEnumerator,
        request: &BackupRequest,
        vm: &EntityRef,
        binding: &SnapshotBinding,
        run: &mut DiskRun,
    ) -> Result<()> {
        run.phase.advance(DumpPhase::EnumeratingBlocks)?;
        notify("enumeration_started", || run.reporter.enumeration_started());

        let disk = &run.disk;
        let record = self
            .checkpoints
            .load(vm.reference(), disk.disk_id())
            .await?
            .unwrap_or_else(|| CheckpointRecord::new(vm.reference().clone(), disk.disk_id()));

        let since = if request.full {
            None
        } else {
            record.last_success.as_ref().filter(|checkpoint| {
                let same_size = checkpoint.capacity_bytes == disk.capacity_bytes;
                if !same_size {
                    info!(
                        disk = %disk.label,
                        was = checkpoint.capacity_bytes,
                        now = disk.capacity_bytes,
                        "Disk was resized since the last backup, dumping in full"
                    );
                }
                same_size
            })
        };

        let (extents, mode) = match enumerator.enumerate(binding, disk, since).await {
            Ok(extents) if since.is_some() => (extents, DumpMode::Incremental),
            Ok(extents) => (extents, DumpMode::Full),
            Err(AgentError::TrackingUnavailable(reason)) => {
                warn!(
                    disk = %disk.label,
                    "Changed-block tracking unavailable ({}), falling back to a full dump",
                    reason
                );
                (full_extent(disk), DumpMode::FullFallback)
            }
            Err(e) => return Err(e),
        };
        let base = match mode {
            DumpMode::Incremental => since.map(|c| c.snapshot.clone()),
            _ => None,
        };

        let (extents, carried) = match record.resumable(binding.snapshot_ref(), base.as_ref()) {
            Some(done) => {
                let carried: Vec<BlockExtent> = extents.iter().filter(|e| done.contains(*e)).copied().collect();
                let (remaining, skipped) = apply_resume_filter(extents, &done);
                info!(
                    disk = %disk.label,
                    skipped,
                    remaining = remaining.len(),
                    "Resuming unfinished backup"
                );
                (remaining, carried)
            }
            None => (extents, Vec::new()),
        };

        let mut expected = TotalBlocksInfo::new(run.ledger.disk().clone());
        expected.attempted = extents.len() as u64;
        expected.total_bytes = total_length(&extents);
        debug!(
            disk = %disk.label,
            ?mode,
            extents = expected.attempted,
            bytes = expected.total_bytes,
            "Enumeration finished"
        );
        notify("enumeration_finished", || run.reporter.enumeration_finished(&expected));

        run.record = Some(record);
        run.mode = Some(mode);
        run.base = base;
        run.extents = extents;
        run.carried = carried;
        Ok(())
    }

    /// Aggregation loop of one disk: submits extents to the pool, records
    /// every outcome and resubmits transient failures in rounds.
    async fn dump_disk(
        &self,
        pool: &DumpWorkerPool,
        request: &BackupRequest,
        binding: &SnapshotBinding,
        run: &mut DiskRun,
    ) -> Result<()> {
        run.phase.advance(DumpPhase::Dumping)?;
        notify("dump_started", || run.reporter.dump_started());

        let ctx = Arc::new(DumpContext::new(
            binding.config().clone(),
            run.disk.key,
            binding.snapshot_ref().clone(),
            self.transport.clone(),
            self.sink.clone(),
            self.options.max_io_size,
        )?);
        let retry = &self.options.retry;

        let mut pending = run.extents.clone();
        // Failure outcomes of extents being resubmitted, by extent
        let mut held: HashMap<BlockExtent, ExBlockOutcome> = HashMap::new();
        let mut attempt = 1u32;

        while !pending.is_empty() {
            let round = std::mem::take(&mut pending);
            let mut stream = pool.dump(ctx.clone(), round.clone(), attempt, self.cancel_token.clone());
            let mut received = HashSet::new();
            let mut resubmit: HashMap<BlockExtent, ExBlockOutcome> = HashMap::new();

            let mut absorb = |outcome: ExBlockOutcome| {
                received.insert(outcome.extent);
                held.remove(&outcome.extent);
                if outcome.is_retryable() && retry.allows_retry(attempt) && !self.cancel_token.is_cancelled() {
                    resubmit.insert(outcome.extent, outcome);
                } else {
                    run.settle(outcome);
                }
            };
            while let Some(outcome) = stream.next().await {
                absorb(outcome);
            }
            let (admitted, unread) = stream.finish().await?;
            for outcome in unread {
                absorb(outcome);
            }
            let admitted = admitted.min(round.len());

            let (admitted_extents, skipped_extents) = round.split_at(admitted);
            for extent in skipped_extents {
                // Extents admitted in an earlier round keep their last outcome.
                match held.remove(extent) {
                    Some(previous) => run.settle(previous),
                    None => run.not_admitted += 1,
                }
            }
            for extent in admitted_extents.iter().filter(|e| !received.contains(*e)) {
                let outcome = held.remove(extent).unwrap_or_else(|| {
                    let err = AgentError::WorkerFault("transfer ended without an outcome".into());
                    ExBlockOutcome::failure(*extent, &err, 0, attempt)
                });
                run.settle(outcome);
            }

            if resubmit.is_empty() {
                break;
            }

            let delay = retry.backoff(attempt);
            info!(
                disk = %run.disk.label,
                extents = resubmit.len(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Resubmitting extents after transient failures"
            );
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = self.cancel_token.cancelled() => true,
            };
            if cancelled {
                for (_, outcome) in resubmit {
                    run.settle(outcome);
                }
                break;
            }

            pending = round.iter().filter(|e| resubmit.contains_key(*e)).copied().collect();
            held = resubmit;
            attempt += 1;
        }

        let totals = run.ledger.snapshot();
        // Cancellation seen after the last admission still aborts the disk.
        let cancelled = run.not_admitted > 0 || self.cancel_token.is_cancelled();
        let state = OperationState::conclude(cancelled, totals.failed);

        self.save_checkpoint(request, binding, run, state).await;
        run.finish(state)
    }

    async fn save_checkpoint(
        &self,
        request: &BackupRequest,
        binding: &SnapshotBinding,
        run: &mut DiskRun,
        state: OperationState,
    ) {
        let Some(record) = run.record.as_mut() else {
            return;
        };

        if state == OperationState::CompletedSuccess {
            record.last_success = Some(Checkpoint {
                snapshot: binding.snapshot_ref().clone(),
                change_id: run.disk.change_id.clone(),
                capacity_bytes: run.disk.capacity_bytes,
                operation_id: request.operation_id,
                completed_at: Utc::now(),
            });
            record.partial = None;
        } else {
            let mut completed = run.carried.clone();
            completed.extend(run.completed.iter().copied());
            completed.sort_unstable();
            let mut failed = run.failed.clone();
            failed.sort_unstable();

            record.partial = Some(PartialRun {
                target: binding.snapshot_ref().clone(),
                base: run.base.clone(),
                completed,
                failed,
                updated_at: Utc::now(),
            });
        }

        match self.checkpoints.save(record).await {
            Ok(()) => debug!(disk = %run.disk.label, %state, "Checkpoint saved"),
            Err(e) => error!(disk = %run.disk.label, "Failed to save checkpoint: {}", e),
        }
    }

    fn schedule_removal(&self, snapshot: ManagedRef) {
        let transport = self.transport.clone();
        let retry = self.options.retry.clone();
        let handle = tokio::spawn(async move {
            match retry
                .run("snapshot removal", || transport.remove_snapshot(&snapshot))
                .await
            {
                Ok(()) => info!(snapshot = %snapshot, "Removed backup snapshot"),
                Err(e) => warn!(snapshot = %snapshot, "Failed to remove backup snapshot: {}", e),
            }
        });
        self.cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }
}

fn select_disks<'a>(config: &'a DiskConfig, keys: Option<&[i32]>) -> Result<Vec<&'a VirtualDisk>> {
    match keys {
        None => Ok(config.disks.iter().collect()),
        Some(keys) => {
            let mut seen = HashSet::new();
            keys.iter()
                .filter(|key| seen.insert(**key))
                .map(|key| {
                    config
                        .disk(*key)
                        .ok_or_else(|| AgentError::NotFound(format!("disk {} in snapshot config", key)))
                })
                .collect()
        }
    }
}
