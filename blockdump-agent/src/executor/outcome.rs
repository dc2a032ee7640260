use crate::cbt::extent::BlockExtent;
use crate::utils::{AgentError, ErrorDetail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOutcome {
    Success,
    Failure,
}

/// Result of transferring one extent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExBlockOutcome {
    pub extent: BlockExtent,
    pub outcome: BlockOutcome,
    pub bytes_transferred: u64,
    pub error: Option<ErrorDetail>,

    /// Submission round that produced this outcome, starting at 1
    pub attempts: u32,
}

impl ExBlockOutcome {
    pub fn success(extent: BlockExtent, bytes_transferred: u64, attempts: u32) -> Self {
        Self {
            extent,
            outcome: BlockOutcome::Success,
            bytes_transferred,
            error: None,
            attempts,
        }
    }

    pub fn failure(extent: BlockExtent, error: &AgentError, bytes_transferred: u64, attempts: u32) -> Self {
        Self {
            extent,
            outcome: BlockOutcome::Failure,
            bytes_transferred,
            error: Some(ErrorDetail::from(error)),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == BlockOutcome::Success
    }

    /// Whether resubmitting the extent could change the outcome.
    pub fn is_retryable(&self) -> bool {
        self.outcome == BlockOutcome::Failure
            && self.error.as_ref().is_some_and(|e| e.kind.is_transient())
    }
}
