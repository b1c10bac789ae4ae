use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::checkpoint::{Checkpoint, CheckpointRequest, CheckpointStore, Position};
use crate::error::{Result, TransformError};
use crate::transform::io::{DestinationWriter, SourceReader};
use crate::transform::model::JobDefinition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// A page was written and its checkpoint persisted.
    Progressed(Checkpoint),
    /// Nothing new to read.
    Idle,
    /// Cancelled before the destination write began.
    Cancelled,
}

/// Runs one read-write-checkpoint increment for a job.
pub struct Indexer {
    source: Arc<dyn SourceReader>,
    dest: Arc<dyn DestinationWriter>,
    checkpoints: Arc<dyn CheckpointStore>,
    io_timeout: Duration,
}

impl Indexer {
    pub fn new(
        source: Arc<dyn SourceReader>,
        dest: Arc<dyn DestinationWriter>,
        checkpoints: Arc<dyn CheckpointStore>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            source,
            dest,
            checkpoints,
            io_timeout,
        }
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransformError::TransientIo(format!(
                "{} timed out after {:?}",
                what, self.io_timeout
            ))),
        }
    }

    /// Resume from the latest checkpoint and process at most one page.
    ///
    /// Cancellation is observed before the read and before the write. Once the
    /// write starts the increment runs to the end, checkpoint included, so the
    /// destination never holds data the checkpoint does not account for.
    /// The checkpoint is written under `allocation_id`, so a newer owner's
    /// fence rejects it.
    pub async fn run_increment(
        &self,
        definition: &JobDefinition,
        allocation_id: u64,
        cancel: &CancellationToken,
    ) -> Result<IncrementOutcome> {
        let job_id = definition.id.as_str();

        let latest = self
            .bounded("checkpoint load", self.checkpoints.get_latest(job_id))
            .await
            .map_err(|e| match e {
                TransformError::TransientIo(_) | TransformError::CheckpointPersistence(_) => e,
                other => TransformError::CheckpointPersistence(other.to_string()),
            })?;
        let base_sequence = latest.as_ref().map(|c| c.sequence_number);
        let (position, stats) = match latest {
            Some(c) => (c.position, c.stats),
            None => (Position::initial(), Default::default()),
        };

        if cancel.is_cancelled() {
            return Ok(IncrementOutcome::Cancelled);
        }

        let page = self
            .bounded(
                "source read",
                self.source
                    .read(&definition.source, &position, definition.max_page_size),
            )
            .await?;
        if page.documents.is_empty() {
            tracing::debug!(job_id = %job_id, "No new documents");
            return Ok(IncrementOutcome::Idle);
        }

        if cancel.is_cancelled() {
            return Ok(IncrementOutcome::Cancelled);
        }

        let indexed = self
            .bounded(
                "destination write",
                self.dest.write(&definition.dest, &page.documents),
            )
            .await?;

        let request = CheckpointRequest {
            job_id: job_id.to_string(),
            allocation_id,
            base_sequence,
            position: page.next_position,
            stats: stats.add_page(page.documents.len() as u64, indexed as u64),
        };
        let checkpoint = self
            .bounded("checkpoint write", self.checkpoints.create(request))
            .await?;

        tracing::debug!(
            job_id = %job_id,
            sequence = checkpoint.sequence_number,
            documents = page.documents.len(),
            "Increment complete"
        );
        Ok(IncrementOutcome::Progressed(checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::checkpoint::MemoryStore;
    use crate::transform::io::{Document, MemoryDestination, Page, VecSource};
    use crate::transform::model::SourceConfig;

    struct SlowSource;

    #[async_trait]
    impl SourceReader for SlowSource {
        async fn read(&self, _: &SourceConfig, _: &Position, _: usize) -> Result<Page> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    struct Fixture {
        source: Arc<VecSource>,
        dest: Arc<MemoryDestination>,
        store: Arc<MemoryStore>,
        indexer: Indexer,
    }

    async fn fixture(docs: usize) -> Fixture {
        let source = Arc::new(VecSource::new());
        source
            .append(
                "src",
                (0..docs).map(|i| Document::new(format!("d{i}"), json!({ "i": i }))),
            )
            .await;
        let dest = Arc::new(MemoryDestination::new());
        let store = Arc::new(MemoryStore::new());
        let indexer = Indexer::new(
            source.clone(),
            dest.clone(),
            store.clone(),
            Duration::from_secs(5),
        );
        Fixture {
            source,
            dest,
            store,
            indexer,
        }
    }

    fn definition() -> JobDefinition {
        JobDefinition::new("t1", "src", "dst").with_max_page_size(10)
    }

    #[tokio::test]
    async fn increments_advance_checkpoint() {
        let f = fixture(25).await;
        let cancel = CancellationToken::new();

        for expected_seq in 1..=3 {
            match f.indexer.run_increment(&definition(), 1, &cancel).await.unwrap() {
                IncrementOutcome::Progressed(cp) => assert_eq!(cp.sequence_number, expected_seq),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(
            f.indexer.run_increment(&definition(), 1, &cancel).await.unwrap(),
            IncrementOutcome::Idle
        );

        let latest = f.store.get_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.position.cursor(), Some("25"));
        assert_eq!(latest.stats.documents_indexed, 25);
        assert_eq!(latest.stats.pages_processed, 3);
        assert_eq!(f.dest.count("dst").await, 25);
        assert_eq!(f.source.doc_count("src").await, 25);
    }

    #[tokio::test]
    async fn cancelled_increment_writes_nothing() {
        let f = fixture(5).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            f.indexer.run_increment(&definition(), 1, &cancel).await.unwrap(),
            IncrementOutcome::Cancelled
        );
        assert_eq!(f.dest.count("dst").await, 0);
        assert!(f.store.get_latest("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_failure_is_retryable_and_not_advanced() {
        let f = fixture(5).await;
        f.store.fail_next_creates(1);
        let err = f
            .indexer
            .run_increment(&definition(), 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::CheckpointPersistence(_)));
        assert!(f.store.get_latest("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn superseded_allocation_cannot_checkpoint() {
        let f = fixture(20).await;
        let cancel = CancellationToken::new();
        f.indexer.run_increment(&definition(), 1, &cancel).await.unwrap();
        f.store.fence("t1", 2).await.unwrap();

        let err = f
            .indexer
            .run_increment(&definition(), 1, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::AssignmentLost { .. }));
        assert_eq!(f.store.get_latest("t1").await.unwrap().unwrap().sequence_number, 1);

        match f.indexer.run_increment(&definition(), 2, &cancel).await.unwrap() {
            IncrementOutcome::Progressed(cp) => assert_eq!(cp.sequence_number, 2),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_read_times_out_as_transient() {
        let store = Arc::new(MemoryStore::new());
        let indexer = Indexer::new(
            Arc::new(SlowSource),
            Arc::new(MemoryDestination::new()),
            store,
            Duration::from_secs(30),
        );
        let err = indexer
            .run_increment(&definition(), 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::TransientIo(_)));
    }
}
