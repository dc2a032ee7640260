//! Lifecycle of a dump.

use crate::utils::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationState {
    Running,
    CompletedSuccess,
    CompletedWithFailures,
    Aborted,
}

impl OperationState {
    /// Terminal state for a dump that drained with `failed` failures.
    pub fn conclude(cancelled: bool, failed: u64) -> Self {
        if cancelled {
            OperationState::Aborted
        } else if failed > 0 {
            OperationState::CompletedWithFailures
        } else {
            OperationState::CompletedSuccess
        }
    }

    pub fn is_terminal(self) -> bool {
        self != OperationState::Running
    }

    /// Combine per-disk terminal states into the operation's.
    pub fn combine(states: impl IntoIterator<Item = OperationState>) -> Self {
        states.into_iter().fold(OperationState::CompletedSuccess, |acc, s| match (acc, s) {
            (OperationState::Aborted, _) | (_, OperationState::Aborted) => OperationState::Aborted,
            (OperationState::Running, _) | (_, OperationState::Running) => OperationState::Running,
            (OperationState::CompletedWithFailures, _) | (_, OperationState::CompletedWithFailures) => {
                OperationState::CompletedWithFailures
            }
            _ => OperationState::CompletedSuccess,
        })
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationState::Running => "running",
            OperationState::CompletedSuccess => "completedSuccess",
            OperationState::CompletedWithFailures => "completedWithFailures",
            OperationState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DumpPhase {
    NotStarted,
    EnumeratingBlocks,
    Dumping,
    Finished(OperationState),
}

impl DumpPhase {
    fn can_advance_to(self, next: DumpPhase) -> bool {
        use DumpPhase::*;
        match (self, next) {
            (NotStarted, EnumeratingBlocks) => true,
            (EnumeratingBlocks, Dumping) => true,
            (NotStarted | EnumeratingBlocks, Finished(OperationState::Aborted)) => true,
            (Dumping, Finished(state)) => state.is_terminal(),
            _ => false,
        }
    }

    pub fn state(self) -> OperationState {
        match self {
            DumpPhase::Finished(state) => state,
            _ => OperationState::Running,
        }
    }
}

impl fmt::Display for DumpPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpPhase::NotStarted => f.write_str("notStarted"),
            DumpPhase::EnumeratingBlocks => f.write_str("enumeratingBlocks"),
            DumpPhase::Dumping => f.write_str("dumping"),
            DumpPhase::Finished(state) => write!(f, "{}", state),
        }
    }
}

/// Enforces the dump state machine:
/// `NotStarted -> EnumeratingBlocks -> Dumping -> finished`, with `Aborted`
/// also reachable before dumping starts. Finished states are final.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    phase: DumpPhase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: DumpPhase::NotStarted,
        }
    }

    pub fn phase(&self) -> DumpPhase {
        self.phase
    }

    pub fn advance(&mut self, next: DumpPhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(AgentError::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        self.phase = next;
        Ok(())
    }

    pub fn finish(&mut self, state: OperationState) -> Result<()> {
        self.advance(DumpPhase::Finished(state))
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut tracker = PhaseTracker::new();
        tracker.advance(DumpPhase::EnumeratingBlocks).unwrap();
        tracker.advance(DumpPhase::Dumping).unwrap();
        tracker.finish(OperationState::CompletedWithFailures).unwrap();
        assert_eq!(tracker.phase().state(), OperationState::CompletedWithFailures);
    }

    #[test]
    fn test_abort_before_dumping() {
        let mut tracker = PhaseTracker::new();
        tracker.finish(OperationState::Aborted).unwrap();

        let mut tracker = PhaseTracker::new();
        tracker.advance(DumpPhase::EnumeratingBlocks).unwrap();
        tracker.finish(OperationState::Aborted).unwrap();
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut tracker = PhaseTracker::new();
        let err = tracker.advance(DumpPhase::Dumping).unwrap_err();
        assert!(matches!(err, AgentError::InvalidTransition { .. }));

        tracker.advance(DumpPhase::EnumeratingBlocks).unwrap();
        assert!(tracker.finish(OperationState::CompletedSuccess).is_err());
        assert!(tracker.finish(OperationState::Running).is_err());

        tracker.advance(DumpPhase::Dumping).unwrap();
        assert!(tracker.finish(OperationState::Running).is_err());
        tracker.finish(OperationState::CompletedSuccess).unwrap();

        // terminal is final
        let err = tracker.finish(OperationState::Aborted).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid state transition: completedSuccess -> aborted"
        );
    }

    #[test]
    fn test_conclude_and_combine() {
        assert_eq!(OperationState::conclude(false, 0), OperationState::CompletedSuccess);
        assert_eq!(OperationState::conclude(false, 2), OperationState::CompletedWithFailures);
        assert_eq!(OperationState::conclude(true, 0), OperationState::Aborted);

        assert_eq!(
            OperationState::combine([OperationState::CompletedSuccess, OperationState::CompletedWithFailures]),
            OperationState::CompletedWithFailures
        );
        assert_eq!(
            OperationState::combine([OperationState::CompletedWithFailures, OperationState::Aborted]),
            OperationState::Aborted
        );
        assert_eq!(OperationState::combine([]), OperationState::CompletedSuccess);
    }
}
