//! Reporter writing structured `tracing` lines, with throttled live progress.

use super::{DiskReporter, Reporter};
use crate::executor::ledger::TotalBlocksInfo;
use crate::executor::outcome::ExBlockOutcome;
use crate::executor::state::OperationState;
use crate::executor::BackupReport;
use crate::inventory::entity::EntityRef;
use crate::transfer::progress::{format_bytes, format_duration, format_speed, ProgressTracker};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct TracingReporter {
    progress_interval: Duration,
}

impl TracingReporter {
    /// `progress_interval` is the minimum time between two progress lines
    /// of the same disk.
    pub fn new(progress_interval: Duration) -> Self {
        Self { progress_interval }
    }
}

impl Default for TracingReporter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

struct TracingDiskReporter {
    entity: EntityRef,
    interval: Duration,
    tracker: Mutex<Option<ProgressTracker>>,
}

impl TracingDiskReporter {
    fn with_tracker(&self, f: impl FnOnce(&mut ProgressTracker)) {
        let mut guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tracker) = guard.as_mut() else {
            return;
        };
        f(tracker);

        if tracker.since_sample() >= self.interval {
            let progress = tracker.sample();
            info!(
                disk = %self.entity,
                done = progress.extents_done,
                failed = progress.extents_failed,
                total = progress.total_extents,
                "{:.1}% of {} at {}, ETA {}",
                progress.percent_complete,
                format_bytes(progress.total_bytes),
                format_speed(progress.bytes_per_second),
                format_duration(progress.eta_seconds)
            );
        }
    }
}

impl DiskReporter for TracingDiskReporter {
    fn entity(&self) -> &EntityRef {
        &self.entity
    }

    fn enumeration_started(&self) -> anyhow::Result<()> {
        debug!(disk = %self.entity, "Enumerating blocks");
        Ok(())
    }

    fn enumeration_finished(&self, expected: &TotalBlocksInfo) -> anyhow::Result<()> {
        info!(
            disk = %self.entity,
            extents = expected.attempted,
            "Enumerated {} to dump",
            format_bytes(expected.total_bytes)
        );
        let mut guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(ProgressTracker::new(expected.total_bytes, expected.attempted));
        Ok(())
    }

    fn dump_started(&self) -> anyhow::Result<()> {
        debug!(disk = %self.entity, "Dump started");
        Ok(())
    }

    fn block_succeeded(&self, outcome: &ExBlockOutcome) -> anyhow::Result<()> {
        self.with_tracker(|t| t.extent_succeeded(outcome.extent.length));
        Ok(())
    }

    fn block_failed(&self, outcome: &ExBlockOutcome) -> anyhow::Result<()> {
        let reason = outcome
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        warn!(
            disk = %self.entity,
            extent = %outcome.extent,
            attempts = outcome.attempts,
            "Block failed: {}",
            reason
        );
        self.with_tracker(|t| t.extent_failed(outcome.extent.length));
        Ok(())
    }

    fn dump_finished(&self, state: OperationState, totals: &TotalBlocksInfo) -> anyhow::Result<()> {
        let guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        let (elapsed, speed) = guard
            .as_ref()
            .map(|t| (t.elapsed().as_secs(), t.average_speed()))
            .unwrap_or_default();

        let line = format!(
            "Dump {}: {}/{} extents, {} failed, {} in {} ({})",
            state,
            totals.succeeded,
            totals.attempted,
            totals.failed,
            format_bytes(totals.total_bytes),
            format_duration(elapsed),
            format_speed(speed)
        );
        match state {
            OperationState::CompletedSuccess => info!(disk = %self.entity, "{}", line),
            OperationState::Aborted => error!(disk = %self.entity, "{}", line),
            _ => warn!(disk = %self.entity, "{}", line),
        }
        Ok(())
    }
}

impl Reporter for TracingReporter {
    fn operation_started(&self, operation_id: Uuid, vm: &EntityRef) -> anyhow::Result<()> {
        info!(operation = %operation_id, vm = %vm, "Backup started");
        Ok(())
    }

    fn for_disk(&self, disk: &EntityRef) -> Arc<dyn DiskReporter> {
        Arc::new(TracingDiskReporter {
            entity: disk.clone(),
            interval: self.progress_interval,
            tracker: Mutex::new(None),
        })
    }

    fn operation_finished(&self, report: &BackupReport) -> anyhow::Result<()> {
        let (succeeded, failed, bytes) = report.disks.iter().fold((0, 0, 0), |acc, d| {
            (
                acc.0 + d.totals.succeeded,
                acc.1 + d.totals.failed,
                acc.2 + d.totals.total_bytes,
            )
        });

        match &report.abort_reason {
            Some(reason) => error!(
                operation = %report.operation_id,
                vm = %report.vm,
                state = %report.state,
                "Backup aborted: {}",
                reason
            ),
            None => info!(
                operation = %report.operation_id,
                vm = %report.vm,
                state = %report.state,
                disks = report.disks.len(),
                succeeded,
                failed,
                "Backup finished, {} written",
                format_bytes(bytes)
            ),
        }
        Ok(())
    }
}
