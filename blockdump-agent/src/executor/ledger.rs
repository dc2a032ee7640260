//! Per-disk outcome counters.

use super::outcome::ExBlockOutcome;
use crate::inventory::entity::EntityRef;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalBlocksInfo {
    pub disk: EntityRef,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,

    /// Bytes handed to the repository, successful extents only
    pub total_bytes: u64,
}

impl TotalBlocksInfo {
    pub fn new(disk: EntityRef) -> Self {
        Self {
            disk,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            total_bytes: 0,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.attempted == self.succeeded + self.failed
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    attempted: u64,
    succeeded: u64,
    failed: u64,
    total_bytes: u64,
}

/// Aggregates outcomes for one disk.
///
/// `record` may be called from any task; each call updates every counter
/// under one lock, so `snapshot` never observes a half-applied outcome.
#[derive(Debug)]
pub struct BlockLedger {
    disk: EntityRef,
    counters: Mutex<Counters>,
}

impl BlockLedger {
    pub fn new(disk: EntityRef) -> Self {
        Self {
            disk,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn disk(&self) -> &EntityRef {
        &self.disk
    }

    pub fn record(&self, outcome: &ExBlockOutcome) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.attempted += 1;
        if outcome.is_success() {
            counters.succeeded += 1;
            counters.total_bytes += outcome.bytes_transferred;
        } else {
            counters.failed += 1;
        }
    }

    pub fn snapshot(&self) -> TotalBlocksInfo {
        let counters = *self.counters.lock().unwrap_or_else(|e| e.into_inner());
        TotalBlocksInfo {
            disk: self.disk.clone(),
            attempted: counters.attempted,
            succeeded: counters.succeeded,
            failed: counters.failed,
            total_bytes: counters.total_bytes,
        }
    }
}
