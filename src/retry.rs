//! Bounded retries for failed increments.

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_FAILURE_RETRIES;
use crate::error::TransformError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Transient; try again on the next tick if budget remains.
    Retryable,
    /// Halts the job regardless of budget.
    Fatal,
    /// This node no longer owns the job. Not a failure of the job itself.
    AssignmentLost,
}

/// Consecutive-failure budget of one task. Rebuilt at zero on every
/// (re)assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub max_retries: u32,
    pub attempts_since_last_success: u32,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_RETRIES)
    }
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts_since_last_success: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempts_since_last_success = 0;
    }

    pub fn record_failure(&mut self) {
        self.attempts_since_last_success = self.attempts_since_last_success.saturating_add(1);
    }
}

/// What to do after a failed increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail,
    /// Drop local state without touching the budget.
    Abandon,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn classify(error: &TransformError) -> FailureClass {
        match error {
            TransformError::TransientIo(_)
            | TransformError::CheckpointPersistence(_)
            | TransformError::Io(_)
            | TransformError::ChannelClosed => FailureClass::Retryable,
            TransformError::AssignmentLost { .. } | TransformError::CheckpointConflict { .. } => {
                FailureClass::AssignmentLost
            }
            TransformError::Configuration(_)
            | TransformError::DestinationRejection(_)
            | TransformError::NotFound(_)
            | TransformError::InvalidState { .. }
            | TransformError::Serialization(_) => FailureClass::Fatal,
        }
    }

    pub fn should_retry(budget: &RetryBudget) -> bool {
        budget.attempts_since_last_success < budget.max_retries
    }

    /// Classify `error` and update `budget` accordingly.
    pub fn on_failure(budget: &mut RetryBudget, error: &TransformError) -> RetryDecision {
        match Self::classify(error) {
            FailureClass::AssignmentLost => RetryDecision::Abandon,
            FailureClass::Fatal => RetryDecision::Fail,
            FailureClass::Retryable => {
                let retry = Self::should_retry(budget);
                budget.record_failure();
                if retry {
                    RetryDecision::Retry
                } else {
                    RetryDecision::Fail
                }
            }
        }
    }
}
