use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::checkpoint::{
    Checkpoint, CheckpointRequest, CheckpointStore, DefinitionStore, DEFAULT_RETAINED_CHECKPOINTS,
};
use crate::error::{Result, TransformError};
use crate::transform::JobDefinition;

const CHECKPOINT_DIR: &str = "checkpoints";
const DEFINITION_DIR: &str = "definitions";

/// Store that keeps JSON documents under a data directory.
///
/// Each checkpoint is its own file, `checkpoints/<job>/<sequence>.json`, and
/// each definition lives in `definitions/<job>.json`. Every write goes to a
/// temporary file that is then renamed over the target, so readers see either
/// the previous document or the new one.
///
/// Allocation fences are process-local: allocation ids restart with the
/// cluster, so persisting them would fence out every new owner.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    retained: usize,
    /// Held for every write. Also holds the per-job allocation fences.
    fences: Mutex<HashMap<String, u64>>,
}

impl FileStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join(CHECKPOINT_DIR)).await?;
        tokio::fs::create_dir_all(root.join(DEFINITION_DIR)).await?;
        tracing::info!(path = %root.display(), "Opened file store");
        Ok(Self {
            root,
            retained: DEFAULT_RETAINED_CHECKPOINTS,
            fences: Mutex::new(HashMap::new()),
        })
    }

    /// Keep at most `retained` checkpoint files per job. Never less than one.
    pub fn with_retention(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(CHECKPOINT_DIR).join(job_id)
    }

    fn checkpoint_path(&self, job_id: &str, sequence: u64) -> PathBuf {
        self.job_dir(job_id).join(format!("{:020}.json", sequence))
    }

    fn definition_path(&self, job_id: &str) -> PathBuf {
        self.root.join(DEFINITION_DIR).join(format!("{}.json", job_id))
    }

    /// Sequence numbers on disk for a job, ascending.
    async fn sequences(&self, job_id: &str) -> Result<Vec<u64>> {
        let mut entries = match tokio::fs::read_dir(self.job_dir(job_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persistence(e)),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(persistence)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                out.push(seq);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    async fn read_checkpoint(&self, job_id: &str, sequence: u64) -> Result<Checkpoint> {
        let bytes = tokio::fs::read(self.checkpoint_path(job_id, sequence))
            .await
            .map_err(persistence)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn persistence(e: std::io::Error) -> TransformError {
    TransformError::CheckpointPersistence(e.to_string())
}

async fn write_atomic(path: &Path, bytes: Vec<u8>) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    let file = tokio::fs::File::open(&tmp).await?;
    file.sync_all().await?;
    tokio::fs::rename(&tmp, path).await
}

async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn get_latest(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        // A concurrent create may prune the files being listed
        let _guard = self.fences.lock().await;
        match self.sequences(job_id).await?.last() {
            Some(&seq) => Ok(Some(self.read_checkpoint(job_id, seq).await?)),
            None => Ok(None),
        }
    }

    async fn create(&self, request: CheckpointRequest) -> Result<Checkpoint> {
        let mut fences = self.fences.lock().await;
        let fence = fences.entry(request.job_id.clone()).or_insert(0);
        request.check_fence(*fence)?;
        *fence = request.allocation_id;

        let job_id = request.job_id.clone();
        let mut sequences = self.sequences(&job_id).await?;
        let checkpoint = request.into_checkpoint(sequences.last().copied())?;

        tokio::fs::create_dir_all(self.job_dir(&job_id))
            .await
            .map_err(persistence)?;
        let bytes = serde_json::to_vec_pretty(&checkpoint)?;
        write_atomic(&self.checkpoint_path(&job_id, checkpoint.sequence_number), bytes)
            .await
            .map_err(persistence)?;
        sequences.push(checkpoint.sequence_number);

        // The checkpoint is durable at this point, pruning is best-effort
        let excess = sequences.len().saturating_sub(self.retained);
        for &seq in &sequences[..excess] {
            if let Err(e) = remove_if_exists(&self.checkpoint_path(&job_id, seq)).await {
                tracing::warn!(
                    job_id = %job_id,
                    sequence = seq,
                    error = %e,
                    "Failed to prune old checkpoint"
                );
            }
        }
        tracing::debug!(
            job_id = %checkpoint.job_id,
            sequence = checkpoint.sequence_number,
            pruned = excess,
            "Checkpoint written"
        );
        Ok(checkpoint)
    }

    async fn fence(&self, job_id: &str, allocation_id: u64) -> Result<()> {
        let mut fences = self.fences.lock().await;
        let fence = fences.entry(job_id.to_string()).or_insert(0);
        if allocation_id < *fence {
            return Err(TransformError::AssignmentLost {
                job_id: job_id.to_string(),
                allocation_id,
            });
        }
        *fence = allocation_id;
        Ok(())
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        let mut fences = self.fences.lock().await;
        match tokio::fs::remove_dir_all(self.job_dir(job_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(persistence(e)),
        }
        fences.remove(job_id);
        Ok(())
    }

    async fn list(&self, job_id: &str) -> Result<Vec<Checkpoint>> {
        let _guard = self.fences.lock().await;
        let mut out = Vec::new();
        for seq in self.sequences(job_id).await? {
            out.push(self.read_checkpoint(job_id, seq).await?);
        }
        Ok(out)
    }
}

#[async_trait]
impl DefinitionStore for FileStore {
    async fn put_definition(&self, definition: &JobDefinition) -> Result<()> {
        let _guard = self.fences.lock().await;
        let bytes = serde_json::to_vec_pretty(definition)?;
        write_atomic(&self.definition_path(&definition.id), bytes).await?;
        Ok(())
    }

    async fn get_definition(&self, job_id: &str) -> Result<Option<JobDefinition>> {
        match tokio::fs::read(self.definition_path(job_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_definition(&self, job_id: &str) -> Result<bool> {
        let _guard = self.fences.lock().await;
        Ok(remove_if_exists(&self.definition_path(job_id)).await?)
    }

    async fn list_definitions(&self) -> Result<Vec<JobDefinition>> {
        let mut entries = tokio::fs::read_dir(self.root.join(DEFINITION_DIR)).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            out.push(serde_json::from_slice::<JobDefinition>(&bytes)?);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
