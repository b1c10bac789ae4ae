//! Durable job progress and definitions.
//!
//! The store is an opaque persistence API. Checkpoints form an append-only
//! history per job; only the latest one is "current". Stores keep the
//! latest checkpoint plus a bounded tail of older ones.

use async_trait::async_trait;

use crate::error::Result;
use crate::transform::JobDefinition;

pub mod file;
pub mod memory;
pub mod model;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use model::{Checkpoint, CheckpointRequest, CheckpointStats, Position};

/// Checkpoints kept per job, latest included, unless a store is configured
/// otherwise.
pub const DEFAULT_RETAINED_CHECKPOINTS: usize = 16;

#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// Latest checkpoint for a job, if any was ever written.
    async fn get_latest(&self, job_id: &str) -> Result<Option<Checkpoint>>;

    /// Append a checkpoint, assigning it the next sequence number.
    ///
    /// Creation is serialized per job. Fails with `AssignmentLost` when
    /// `request.allocation_id` is below the job's fence, with
    /// `CheckpointConflict` when `request.base_sequence` is no longer the
    /// latest sequence, and with `CheckpointPersistence` when the write is
    /// not durable. Checkpoints past the retention limit are pruned.
    async fn create(&self, request: CheckpointRequest) -> Result<Checkpoint>;

    /// Raise the job's fence to `allocation_id`. Creates from older
    /// allocations fail from then on.
    ///
    /// Fails with `AssignmentLost` if a newer allocation already holds the
    /// fence.
    async fn fence(&self, job_id: &str, allocation_id: u64) -> Result<()>;

    /// Remove the whole history of a job.
    async fn delete(&self, job_id: &str) -> Result<()>;

    /// Retained history, oldest first.
    async fn list(&self, job_id: &str) -> Result<Vec<Checkpoint>>;
}

#[async_trait]
pub trait DefinitionStore: Send + Sync + 'static {
    async fn put_definition(&self, definition: &JobDefinition) -> Result<()>;

    async fn get_definition(&self, job_id: &str) -> Result<Option<JobDefinition>>;

    /// Returns whether a definition was removed.
    async fn delete_definition(&self, job_id: &str) -> Result<bool>;

    async fn list_definitions(&self) -> Result<Vec<JobDefinition>>;
}
