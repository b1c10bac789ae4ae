use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformError};

/// Opaque source cursor. `None` means "from the beginning".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position(Option<String>);

impl Position {
    pub fn initial() -> Self {
        Self(None)
    }

    pub fn at(cursor: impl Into<String>) -> Self {
        Self(Some(cursor.into()))
    }

    pub fn cursor(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_initial(&self) -> bool {
        self.0.is_none()
    }
}

/// Cumulative counters carried from one checkpoint to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub documents_processed: u64,
    pub documents_indexed: u64,
    pub pages_processed: u64,
}

impl CheckpointStats {
    pub fn add_page(self, processed: u64, indexed: u64) -> Self {
        Self {
            documents_processed: self.documents_processed + processed,
            documents_indexed: self.documents_indexed + indexed,
            pages_processed: self.pages_processed + 1,
        }
    }
}

/// Durable marker of a job's last fully processed position. Never mutated
/// after it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub sequence_number: u64,
    pub position: Position,
    pub timestamp: DateTime<Utc>,
    pub stats: CheckpointStats,
}

/// Request to append a checkpoint.
///
/// `base_sequence` is the sequence the writer resumed from (`None` if it
/// started from scratch). The store only accepts the request if that is still
/// the latest checkpoint and `allocation_id` is not below the job's fence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRequest {
    pub job_id: String,
    pub allocation_id: u64,
    pub base_sequence: Option<u64>,
    pub position: Position,
    pub stats: CheckpointStats,
}

impl CheckpointRequest {
    /// Reject the request if a newer allocation already fenced the job.
    pub fn check_fence(&self, fence: u64) -> Result<()> {
        if self.allocation_id < fence {
            return Err(TransformError::AssignmentLost {
                job_id: self.job_id.clone(),
                allocation_id: self.allocation_id,
            });
        }
        Ok(())
    }

    /// Build the next checkpoint on top of `latest`, or fail with a conflict.
    pub fn into_checkpoint(self, latest: Option<u64>) -> Result<Checkpoint> {
        if self.base_sequence != latest {
            return Err(TransformError::CheckpointConflict {
                job_id: self.job_id,
                expected: self.base_sequence,
                actual: latest,
            });
        }
        Ok(Checkpoint {
            sequence_number: latest.map_or(1, |seq| seq + 1),
            job_id: self.job_id,
            position: self.position,
            timestamp: Utc::now(),
            stats: self.stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(base: Option<u64>) -> CheckpointRequest {
        CheckpointRequest {
            job_id: "t1".into(),
            allocation_id: 3,
            base_sequence: base,
            position: Position::at("10"),
            stats: CheckpointStats::default(),
        }
    }

    #[test]
    fn first_checkpoint_is_sequence_one() {
        let cp = request(None).into_checkpoint(None).unwrap();
        assert_eq!(cp.sequence_number, 1);
        assert_eq!(cp.position.cursor(), Some("10"));
    }

    #[test]
    fn stale_base_is_a_conflict() {
        let err = request(Some(3)).into_checkpoint(Some(4)).unwrap_err();
        match err {
            TransformError::CheckpointConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, Some(3));
                assert_eq!(actual, Some(4));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn older_allocation_is_fenced_out() {
        let req = request(Some(1));
        assert!(req.check_fence(3).is_ok());
        assert!(req.check_fence(2).is_ok());
        match req.check_fence(4).unwrap_err() {
            TransformError::AssignmentLost { allocation_id, .. } => assert_eq!(allocation_id, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn stats_accumulate_per_page() {
        let stats = CheckpointStats::default().add_page(10, 10).add_page(5, 4);
        assert_eq!(stats.documents_processed, 15);
        assert_eq!(stats.documents_indexed, 14);
        assert_eq!(stats.pages_processed, 2);
    }
}
