use std::sync::Arc;

use serde::Serialize;

use crate::checkpoint::{Checkpoint, CheckpointStore, DefinitionStore};
use crate::cluster::{Assignment, ClusterService, TaskStatusReport};
use crate::error::{Result, TransformError};
use crate::transform::model::{JobDefinition, TaskStatus};

#[derive(Debug, Clone, Serialize)]
pub struct TransformStats {
    pub definition: JobDefinition,
    pub assignment: Option<Assignment>,
    pub status: Option<TaskStatusReport>,
    pub checkpoint: Option<Checkpoint>,
}

/// Operator-facing transform management.
#[derive(Clone)]
pub struct TransformService {
    definitions: Arc<dyn DefinitionStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    cluster: Arc<ClusterService>,
}

impl TransformService {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        cluster: Arc<ClusterService>,
    ) -> Self {
        Self {
            definitions,
            checkpoints,
            cluster,
        }
    }

    /// Create a new transform. Fails if one with the same id exists.
    pub async fn put(&self, definition: JobDefinition) -> Result<()> {
        definition.validate()?;
        if self.definitions.get_definition(&definition.id).await?.is_some() {
            return Err(TransformError::Configuration(format!(
                "Transform with id [{}] already exists",
                definition.id
            )));
        }
        self.definitions.put_definition(&definition).await?;
        tracing::info!(job_id = %definition.id, "Transform created");
        Ok(())
    }

    /// Replace an existing definition. A running task picks the change up on
    /// its next tick.
    pub async fn update(&self, definition: JobDefinition) -> Result<()> {
        definition.validate()?;
        if self.definitions.get_definition(&definition.id).await?.is_none() {
            return Err(TransformError::NotFound(definition.id));
        }
        self.definitions.put_definition(&definition).await?;
        tracing::info!(job_id = %definition.id, "Transform updated");
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<JobDefinition> {
        self.definitions
            .get_definition(job_id)
            .await?
            .ok_or_else(|| TransformError::NotFound(job_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<JobDefinition>> {
        self.definitions.list_definitions().await
    }

    /// Ask the cluster to run a transform. Returns the assignment if an
    /// eligible node took it.
    pub async fn start(&self, job_id: &str) -> Result<Option<Assignment>> {
        let definition = self.get(job_id).await?;
        if !definition.enabled {
            return Err(TransformError::Configuration(format!(
                "Transform [{}] is disabled and cannot be started",
                job_id
            )));
        }
        let assignment = self.cluster.start_job(job_id).await?;
        tracing::info!(
            job_id = %job_id,
            node_id = ?assignment.as_ref().map(|a| a.node_id),
            "Transform start requested"
        );
        Ok(assignment)
    }

    pub async fn stop(&self, job_id: &str) -> Result<()> {
        self.cluster.request_stop(job_id).await
    }

    /// Remove a transform that is not running, with its checkpoints.
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        if self.cluster.is_desired(job_id).await {
            let status = self
                .cluster
                .task_status(job_id)
                .await
                .map_or(TaskStatus::Unassigned, |r| r.status);
            return Err(TransformError::InvalidState {
                job_id: job_id.to_string(),
                status,
            });
        }
        if !self.definitions.delete_definition(job_id).await? {
            return Err(TransformError::NotFound(job_id.to_string()));
        }
        self.checkpoints.delete(job_id).await?;
        tracing::info!(job_id = %job_id, "Transform deleted");
        Ok(())
    }

    pub async fn stats(&self, job_id: &str) -> Result<TransformStats> {
        let definition = self.get(job_id).await?;
        Ok(TransformStats {
            definition,
            assignment: self.cluster.assignment(job_id).await,
            status: self.cluster.task_status(job_id).await,
            checkpoint: self.checkpoints.get_latest(job_id).await?,
        })
    }
}
