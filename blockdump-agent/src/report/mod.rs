//! Observers of a backup operation.
//!
//! The executor calls hooks from its per-disk aggregation loops. Hooks are
//! synchronous and should be cheap. A hook that fails or panics is logged
//! and otherwise ignored: reporting never changes the outcome of a dump.

pub mod events;
pub mod logging;

use crate::executor::ledger::TotalBlocksInfo;
use crate::executor::outcome::ExBlockOutcome;
use crate::executor::state::OperationState;
use crate::executor::BackupReport;
use crate::inventory::entity::EntityRef;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub use events::{write_json_lines, DumpEvent, EventReporter};
pub use logging::TracingReporter;

/// Hooks for one disk of an operation.
#[allow(unused_variables)]
pub trait DiskReporter: Send + Sync {
    /// The disk this reporter observes.
    fn entity(&self) -> &EntityRef;

    fn enumeration_started(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// `expected.attempted` is the number of extents about to be dumped and
    /// `expected.total_bytes` their combined length.
    fn enumeration_finished(&self, expected: &TotalBlocksInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn dump_started(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn block_succeeded(&self, outcome: &ExBlockOutcome) -> anyhow::Result<()> {
        Ok(())
    }

    fn block_failed(&self, outcome: &ExBlockOutcome) -> anyhow::Result<()> {
        Ok(())
    }

    fn dump_finished(&self, state: OperationState, totals: &TotalBlocksInfo) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Operation-level hooks and the factory for per-disk reporters.
#[allow(unused_variables)]
pub trait Reporter: Send + Sync {
    fn operation_started(&self, operation_id: Uuid, vm: &EntityRef) -> anyhow::Result<()> {
        Ok(())
    }

    fn for_disk(&self, disk: &EntityRef) -> Arc<dyn DiskReporter>;

    fn operation_finished(&self, report: &BackupReport) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Run a reporter hook, logging instead of propagating errors and panics.
pub fn notify<F>(hook: &str, f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(hook, "Reporter hook failed: {:#}", e),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(hook, "Reporter hook panicked: {}", message);
        }
    }
}

/// Ask `reporter` for a disk reporter; a panicking factory yields one that
/// ignores everything.
pub fn disk_reporter(reporter: &dyn Reporter, disk: &EntityRef) -> Arc<dyn DiskReporter> {
    catch_unwind(AssertUnwindSafe(|| reporter.for_disk(disk))).unwrap_or_else(|_| {
        warn!(disk = %disk, "Reporter panicked creating disk reporter");
        Arc::new(NoopDiskReporter { entity: disk.clone() })
    })
}

/// Reporter that ignores everything.
pub struct NoopReporter;

struct NoopDiskReporter {
    entity: EntityRef,
}

impl DiskReporter for NoopDiskReporter {
    fn entity(&self) -> &EntityRef {
        &self.entity
    }
}

impl Reporter for NoopReporter {
    fn for_disk(&self, disk: &EntityRef) -> Arc<dyn DiskReporter> {
        Arc::new(NoopDiskReporter { entity: disk.clone() })
    }
}

/// Forwards every hook to several reporters. Each target is guarded on its
/// own, so one failing reporter does not starve the others.
pub struct FanoutReporter {
    targets: Vec<Arc<dyn Reporter>>,
}

impl FanoutReporter {
    pub fn new(targets: Vec<Arc<dyn Reporter>>) -> Self {
        Self { targets }
    }
}

struct FanoutDiskReporter {
    entity: EntityRef,
    targets: Vec<Arc<dyn DiskReporter>>,
}

impl FanoutDiskReporter {
    fn each(&self, hook: &str, f: impl Fn(&dyn DiskReporter) -> anyhow::Result<()>) -> anyhow::Result<()> {
        for target in &self.targets {
            notify(hook, || f(target.as_ref()));
        }
        Ok(())
    }
}

impl DiskReporter for FanoutDiskReporter {
    fn entity(&self) -> &EntityRef {
        &self.entity
    }

    fn enumeration_started(&self) -> anyhow::Result<()> {
        self.each("enumeration_started", |r| r.enumeration_started())
    }

    fn enumeration_finished(&self, expected: &TotalBlocksInfo) -> anyhow::Result<()> {
        self.each("enumeration_finished", |r| r.enumeration_finished(expected))
    }

    fn dump_started(&self) -> anyhow::Result<()> {
        self.each("dump_started", |r| r.dump_started())
    }

    fn block_succeeded(&self, outcome: &ExBlockOutcome) -> anyhow::Result<()> {
        self.each("block_succeeded", |r| r.block_succeeded(outcome))
    }

    fn block_failed(&self, outcome: &ExBlockOutcome) -> anyhow::Result<()> {
        self.each("block_failed", |r| r.block_failed(outcome))
    }

    fn dump_finished(&self, state: OperationState, totals: &TotalBlocksInfo) -> anyhow::Result<()> {
        self.each("dump_finished", |r| r.dump_finished(state, totals))
    }
}

impl Reporter for FanoutReporter {
    fn operation_started(&self, operation_id: Uuid, vm: &EntityRef) -> anyhow::Result<()> {
        for target in &self.targets {
            notify("operation_started", || target.operation_started(operation_id, vm));
        }
        Ok(())
    }

    fn for_disk(&self, disk: &EntityRef) -> Arc<dyn DiskReporter> {
        let targets = self
            .targets
            .iter()
            .map(|target| disk_reporter(target.as_ref(), disk))
            .collect();
        Arc::new(FanoutDiskReporter {
            entity: disk.clone(),
            targets,
        })
    }

    fn operation_finished(&self, report: &BackupReport) -> anyhow::Result<()> {
        for target in &self.targets {
            notify("operation_finished", || target.operation_finished(report));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::entity::ManagedRef;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        entity: EntityRef,
        started: Arc<AtomicUsize>,
    }

    impl DiskReporter for Counting {
        fn entity(&self) -> &EntityRef {
            &self.entity
        }

        fn dump_started(&self) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingReporter(Arc<AtomicUsize>);

    impl Reporter for CountingReporter {
        fn for_disk(&self, disk: &EntityRef) -> Arc<dyn DiskReporter> {
            Arc::new(Counting {
                entity: disk.clone(),
                started: self.0.clone(),
            })
        }
    }

    struct Exploding {
        entity: EntityRef,
    }

    impl DiskReporter for Exploding {
        fn entity(&self) -> &EntityRef {
            &self.entity
        }

        fn dump_started(&self) -> anyhow::Result<()> {
            panic!("reporter blew up");
        }
    }

    struct ExplodingReporter;

    impl Reporter for ExplodingReporter {
        fn for_disk(&self, disk: &EntityRef) -> Arc<dyn DiskReporter> {
            Arc::new(Exploding { entity: disk.clone() })
        }
    }

    fn disk() -> EntityRef {
        EntityRef::new("Hard disk 1", ManagedRef::disk("d1"), "vc-1")
    }

    #[test]
    fn test_notify_swallows_errors_and_panics() {
        notify("failing", || Err(anyhow::anyhow!("nope")));
        notify("panicking", || panic!("boom"));
    }

    #[test]
    fn test_fanout_isolates_failing_targets() {
        let counter = Arc::new(AtomicUsize::new(0));
        let fanout = FanoutReporter::new(vec![
            Arc::new(ExplodingReporter),
            Arc::new(CountingReporter(counter.clone())),
        ]);

        let reporter = fanout.for_disk(&disk());
        assert_eq!(reporter.entity(), &disk());
        reporter.dump_started().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
