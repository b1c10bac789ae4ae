use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::checkpoint::{
    Checkpoint, CheckpointRequest, CheckpointStore, DefinitionStore, DEFAULT_RETAINED_CHECKPOINTS,
};
use crate::error::{Result, TransformError};
use crate::transform::JobDefinition;

#[derive(Debug, Default)]
struct JobHistory {
    checkpoints: VecDeque<Checkpoint>,
    fence: u64,
}

/// In-process store for both keyspaces.
#[derive(Debug)]
pub struct MemoryStore {
    checkpoints: Mutex<HashMap<String, JobHistory>>,
    definitions: RwLock<BTreeMap<String, JobDefinition>>,
    failing_creates: AtomicU32,
    retained: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            checkpoints: Mutex::default(),
            definitions: RwLock::default(),
            failing_creates: AtomicU32::new(0),
            retained: DEFAULT_RETAINED_CHECKPOINTS,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retained` checkpoints per job. Never less than one.
    pub fn with_retention(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    /// Make the next `count` creates fail as if the backing store were
    /// unavailable.
    pub fn fail_next_creates(&self, count: u32) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get_latest(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.lock().await;
        Ok(checkpoints
            .get(job_id)
            .and_then(|h| h.checkpoints.back())
            .cloned())
    }

    async fn create(&self, request: CheckpointRequest) -> Result<Checkpoint> {
        let mut checkpoints = self.checkpoints.lock().await;
        if self.take_injected_failure() {
            return Err(TransformError::CheckpointPersistence(format!(
                "store unavailable while writing checkpoint for {}",
                request.job_id
            )));
        }
        let history = checkpoints.entry(request.job_id.clone()).or_default();
        request.check_fence(history.fence)?;
        history.fence = request.allocation_id;

        let latest = history.checkpoints.back().map(|c| c.sequence_number);
        let checkpoint = request.into_checkpoint(latest)?;
        history.checkpoints.push_back(checkpoint.clone());
        while history.checkpoints.len() > self.retained {
            history.checkpoints.pop_front();
        }
        Ok(checkpoint)
    }

    async fn fence(&self, job_id: &str, allocation_id: u64) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock().await;
        let history = checkpoints.entry(job_id.to_string()).or_default();
        if allocation_id < history.fence {
            return Err(TransformError::AssignmentLost {
                job_id: job_id.to_string(),
                allocation_id,
            });
        }
        history.fence = allocation_id;
        Ok(())
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        self.checkpoints.lock().await.remove(job_id);
        Ok(())
    }

    async fn list(&self, job_id: &str) -> Result<Vec<Checkpoint>> {
        let checkpoints = self.checkpoints.lock().await;
        Ok(checkpoints
            .get(job_id)
            .map(|h| h.checkpoints.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn put_definition(&self, definition: &JobDefinition) -> Result<()> {
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn get_definition(&self, job_id: &str) -> Result<Option<JobDefinition>> {
        Ok(self.definitions.read().await.get(job_id).cloned())
    }

    async fn delete_definition(&self, job_id: &str) -> Result<bool> {
        Ok(self.definitions.write().await.remove(job_id).is_some())
    }

    async fn list_definitions(&self) -> Result<Vec<JobDefinition>> {
        Ok(self.definitions.read().await.values().cloned().collect())
    }
}
