use thiserror::Error;

use crate::transform::TaskStatus;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Destination rejected write: {0}")]
    DestinationRejection(String),

    #[error("Failed to persist checkpoint: {0}")]
    CheckpointPersistence(String),

    #[error(
        "Checkpoint conflict for transform {job_id}: writer expected base {expected:?}, store is at {actual:?}"
    )]
    CheckpointConflict {
        job_id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Assignment lost for transform {job_id} (allocation {allocation_id})")]
    AssignmentLost { job_id: String, allocation_id: u64 },

    #[error("Transform not found: {0}")]
    NotFound(String),

    #[error("Transform {job_id} cannot do this while {status}")]
    InvalidState { job_id: String, status: TaskStatus },

    #[error("Internal channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TransformError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TransformError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for TransformError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        TransformError::ChannelClosed
    }
}

pub type Result<T> = std::result::Result<T, TransformError>;
