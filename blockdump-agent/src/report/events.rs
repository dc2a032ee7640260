//! Reporter publishing serialisable events on a broadcast channel.

use super::{DiskReporter, Reporter};
use crate::cbt::extent::BlockExtent;
use crate::executor::ledger::TotalBlocksInfo;
use crate::executor::outcome::ExBlockOutcome;
use crate::executor::state::OperationState;
use crate::executor::BackupReport;
use crate::inventory::entity::EntityRef;
use crate::utils::ErrorDetail;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{trace, warn};
use uuid::Uuid;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DumpEvent {
    #[serde(rename = "operation:started")]
    OperationStarted { operation_id: Uuid, vm: EntityRef },

    #[serde(rename = "enumeration:started")]
    EnumerationStarted { disk: EntityRef },

    #[serde(rename = "enumeration:finished")]
    EnumerationFinished { expected: TotalBlocksInfo },

    #[serde(rename = "dump:started")]
    DumpStarted { disk: EntityRef },

    /// One extent finished
    #[serde(rename = "dump:block")]
    Block {
        disk_id: String,
        extent: BlockExtent,
        success: bool,
        bytes: u64,
        attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorDetail>,
    },

    #[serde(rename = "dump:finished")]
    DumpFinished {
        state: OperationState,
        totals: TotalBlocksInfo,
    },

    #[serde(rename = "operation:finished")]
    OperationFinished {
        operation_id: Uuid,
        state: OperationState,
        disks: Vec<TotalBlocksInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        abort_reason: Option<ErrorDetail>,
    },
}

#[derive(Clone)]
pub struct EventReporter {
    tx: broadcast::Sender<DumpEvent>,
}

impl EventReporter {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DumpEvent> {
        self.tx.subscribe()
    }

    fn publish(tx: &broadcast::Sender<DumpEvent>, event: DumpEvent) {
        // No subscribers is not an error for a reporter.
        if let Ok(count) = tx.send(event) {
            trace!("Published dump event to {} subscriber(s)", count);
        }
    }
}

/// Write every event from `rx` to `out` as one JSON line until the channel
/// closes. Returns the number of lines written.
pub async fn write_json_lines<W: Write>(mut rx: broadcast::Receiver<DumpEvent>, mut out: W) -> u64 {
    let mut written = 0;
    loop {
        match rx.recv().await {
            Ok(event) => {
                let line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to encode event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = writeln!(out, "{}", line) {
                    warn!("Event output closed: {}", e);
                    break;
                }
                written += 1;
            }
            Err(RecvError::Lagged(n)) => {
                warn!("Event output lagged by {} events", n);
            }
            Err(RecvError::Closed) => break,
        }
    }
    if let Err(e) = out.flush() {
        warn!("Failed to flush event output: {}", e);
    }
    written
}

impl Default for EventReporter {
    fn default() -> Self {
        Self::new()
    }
}

struct EventDiskReporter {
    entity: EntityRef,
    tx: broadcast::Sender<DumpEvent>,
}

impl EventDiskReporter {
    fn block(&self, outcome: &ExBlockOutcome) {
        EventReporter::publish(
            &self.tx,
            DumpEvent::Block {
                disk_id: self.entity.reference().value.clone(),
                extent: outcome.extent,
                success: outcome.is_success(),
                bytes: outcome.bytes_transferred,
                attempts: outcome.attempts,
                error: outcome.error.clone(),
            },
        );
    }
}

impl DiskReporter for EventDiskReporter {
    fn entity(&self) -> &EntityRef {
        &self.entity
    }

    fn enumeration_started(&self) -> anyhow::Result<()> {
        EventReporter::publish(
            &self.tx,
            DumpEvent::EnumerationStarted {
                disk: self.entity.clone(),
            },
        );
        Ok(())
    }

    fn enumeration_finished(&self, expected: &TotalBlocksInfo) -> anyhow::Result<()> {
        EventReporter::publish(
            &self.tx,
            DumpEvent::EnumerationFinished {
                expected: expected.clone(),
            },
        );
        Ok(())
    }

    fn dump_started(&self) -> anyhow::Result<()> {
        EventReporter::publish(
            &self.tx,
            DumpEvent::DumpStarted {
                disk: self.entity.clone(),
            },
        );
        Ok(())
    }

    fn block_succeeded(&self, outcome: &ExBlockOutcome) -> anyhow::Result<()> {
        self.block(outcome);
        Ok(())
    }

    fn block_failed(&self, outcome: &ExBlockOutcome) -> anyhow::Result<()> {
        self.block(outcome);
        Ok(())
    }

    fn dump_finished(&self, state: OperationState, totals: &TotalBlocksInfo) -> anyhow::Result<()> {
        EventReporter::publish(
            &self.tx,
            DumpEvent::DumpFinished {
                state,
                totals: totals.clone(),
            },
        );
        Ok(())
    }
}

impl Reporter for EventReporter {
    fn operation_started(&self, operation_id: Uuid, vm: &EntityRef) -> anyhow::Result<()> {
        Self::publish(
            &self.tx,
            DumpEvent::OperationStarted {
                operation_id,
                vm: vm.clone(),
            },
        );
        Ok(())
    }

    fn for_disk(&self, disk: &EntityRef) -> Arc<dyn DiskReporter> {
        Arc::new(EventDiskReporter {
            entity: disk.clone(),
            tx: self.tx.clone(),
        })
    }

    fn operation_finished(&self, report: &BackupReport) -> anyhow::Result<()> {
        Self::publish(
            &self.tx,
            DumpEvent::OperationFinished {
                operation_id: report.operation_id,
                state: report.state,
                disks: report.disks.iter().map(|d| d.totals.clone()).collect(),
                abort_reason: report.abort_reason.clone(),
            },
        );
        Ok(())
    }
}
