//! Failover tests for node loss and task reassignment.
//!
//! These tests verify that a transform has one active owner at a time, that a
//! new owner resumes from the last durable checkpoint, and that a node which
//! lost its assignment cannot advance the checkpoint history.

mod test_harness;

use std::collections::BTreeSet;

use test_harness::{test_definition, TestCluster, DEST_INDEX};
use transform_lite::checkpoint::CheckpointStore;
use transform_lite::transform::{AuditKind, TaskStatus};

const JOB: &str = "orders-pivot";

async fn progress_to(cluster: &TestCluster, node_id: u64, sequence: u64) {
    for _ in 0..sequence {
        cluster.tick(node_id, JOB).await;
    }
    assert_eq!(cluster.latest_sequence(JOB).await, Some(sequence));
}

/// A node lost mid-increment hands off at the last durable checkpoint
#[tokio::test]
async fn test_resume_from_last_checkpoint_after_node_loss() {
    let mut cluster = TestCluster::with_nodes(2, 100, 10).await;
    let owner = cluster.create_and_start(test_definition(JOB)).await;
    assert_eq!(owner, Some(1), "Lowest id wins among equally loaded nodes");
    progress_to(&cluster, 1, 5).await;

    // Park node 1 inside its sixth read, then take it out of the cluster
    cluster.source.gate.arm();
    let in_flight = cluster.spawn_tick(1, JOB);
    cluster.source.gate.wait_entered().await;
    cluster.partition_node(1).await;

    assert_eq!(cluster.owner(JOB).await, Some(2));
    let state = cluster.status(2, JOB).await.unwrap();
    assert_eq!(state.status, TaskStatus::Started);
    assert_eq!(state.current_checkpoint, Some(5));
    assert!(cluster.status(1, JOB).await.is_none());
    assert_eq!(cluster.audit.count(JOB, AuditKind::AssignmentLost), 1);

    // The old owner observes cancellation before writing anything
    cluster.source.gate.release();
    in_flight.await.unwrap().unwrap();
    assert_eq!(cluster.latest_sequence(JOB).await, Some(5));
    assert_eq!(cluster.dest.inner.count(DEST_INDEX).await, 50);

    cluster.tick(2, JOB).await;
    let latest = cluster.store.get_latest(JOB).await.unwrap().unwrap();
    assert_eq!(latest.sequence_number, 6);
    assert_eq!(latest.position.cursor(), Some("60"));
    assert_eq!(cluster.sequences(JOB).await, (1..=6).collect::<Vec<_>>());
    assert_eq!(cluster.dest.inner.count(DEST_INDEX).await, 60);

    let started_on_2 = cluster
        .audit
        .events_for(JOB)
        .into_iter()
        .filter(|e| e.kind == AuditKind::Started && e.node_id == 2)
        .count();
    assert_eq!(started_on_2, 1);

    cluster.shutdown().await;
}

/// A stale owner finishing its write cannot add a checkpoint
#[tokio::test]
async fn test_stale_owner_checkpoint_is_rejected() {
    let mut cluster = TestCluster::with_nodes(2, 100, 10).await;
    cluster.create_and_start(test_definition(JOB)).await;
    progress_to(&cluster, 1, 5).await;

    // Node 1 is past its read and parked in the destination write
    cluster.dest.gate.arm();
    let in_flight = cluster.spawn_tick(1, JOB);
    cluster.dest.gate.wait_entered().await;
    cluster.partition_node(1).await;

    cluster.tick(2, JOB).await;
    assert_eq!(cluster.latest_sequence(JOB).await, Some(6));

    cluster.dest.gate.release();
    in_flight.await.unwrap().unwrap();

    assert_eq!(
        cluster.sequences(JOB).await,
        (1..=6).collect::<Vec<_>>(),
        "History must stay gapless without duplicate sequences"
    );
    assert_eq!(cluster.dest.inner.count(DEST_INDEX).await, 60);
    assert_eq!(cluster.audit.count(JOB, AuditKind::CheckpointCreated), 6);

    cluster.shutdown().await;
}

/// A fenced owner whose write lands before the new owner's first tick adds
/// no checkpoint
#[tokio::test]
async fn test_fenced_owner_write_before_new_owner_ticks() {
    let mut cluster = TestCluster::with_nodes(2, 100, 10).await;
    cluster.create_and_start(test_definition(JOB)).await;
    progress_to(&cluster, 1, 5).await;

    cluster.dest.gate.arm();
    let in_flight = cluster.spawn_tick(1, JOB);
    cluster.dest.gate.wait_entered().await;
    cluster.partition_node(1).await;
    assert_eq!(cluster.owner(JOB).await, Some(2));

    // Node 2 has not ticked yet, so the checkpoint base still matches
    cluster.dest.gate.release();
    in_flight.await.unwrap().unwrap();
    assert_eq!(cluster.latest_sequence(JOB).await, Some(5));
    assert_eq!(cluster.audit.count(JOB, AuditKind::CheckpointCreated), 5);

    cluster.tick(2, JOB).await;
    let latest = cluster.store.get_latest(JOB).await.unwrap().unwrap();
    assert_eq!(latest.sequence_number, 6);
    assert_eq!(latest.position.cursor(), Some("60"));
    assert_eq!(cluster.sequences(JOB).await, (1..=6).collect::<Vec<_>>());
    assert_eq!(cluster.dest.inner.count(DEST_INDEX).await, 60);

    cluster.shutdown().await;
}

/// A failed transform is still failed on the node that takes it over
#[tokio::test]
async fn test_failed_state_survives_reassignment() {
    let mut cluster = TestCluster::with_nodes(2, 100, 0).await;
    cluster.create_and_start(test_definition(JOB)).await;
    progress_to(&cluster, 1, 2).await;
    cluster.source.fail_next_reads(1);
    cluster.tick(1, JOB).await;
    assert_eq!(cluster.status(1, JOB).await.unwrap().status, TaskStatus::Failed);

    cluster.kill_node(1).await;
    assert_eq!(cluster.owner(JOB).await, Some(2));
    let state = cluster.status(2, JOB).await.unwrap();
    assert_eq!(state.status, TaskStatus::Failed);
    assert!(state.last_failure.unwrap().contains("source timed out"));
    assert!(!cluster.node(2).engine.is_registered(JOB).await);
    let takeover: Vec<AuditKind> = cluster
        .audit
        .events_for(JOB)
        .into_iter()
        .filter(|e| e.node_id == 2)
        .map(|e| e.kind)
        .collect();
    assert_eq!(takeover, vec![AuditKind::Failed]);
    assert_eq!(
        cluster.cluster.task_status(JOB).await.unwrap().status,
        TaskStatus::Failed
    );

    cluster.tick(2, JOB).await;
    assert_eq!(cluster.latest_sequence(JOB).await, Some(2));
    assert_eq!(cluster.dest.inner.count(DEST_INDEX).await, 20);

    // Stopping clears the failure, a fresh start indexes again
    cluster.service.stop(JOB).await.unwrap();
    cluster.sync_all().await;
    cluster.service.start(JOB).await.unwrap();
    cluster.sync_all().await;
    assert_eq!(cluster.status(2, JOB).await.unwrap().status, TaskStatus::Started);
    cluster.tick(2, JOB).await;
    assert_eq!(cluster.latest_sequence(JOB).await, Some(3));

    cluster.shutdown().await;
}

/// Each transform is held by exactly one node, before and after a crash
#[tokio::test]
async fn test_single_active_owner_per_job() {
    let mut cluster = TestCluster::with_nodes(3, 100, 10).await;
    let jobs = ["job-a", "job-b", "job-c"];

    let mut owners = BTreeSet::new();
    for job in jobs {
        let owner = cluster
            .create_and_start(test_definition(job))
            .await
            .expect("an eligible node should take the job");
        owners.insert(owner);
    }
    assert_eq!(owners.len(), 3, "Jobs should spread across nodes");

    for job in jobs {
        let owner = cluster.owner(job).await.unwrap();
        assert_eq!(cluster.holders(job).await, vec![owner]);
    }

    let victim = cluster.owner("job-a").await.unwrap();
    assert!(cluster.kill_node(victim).await);

    for job in jobs {
        let owner = cluster.owner(job).await.expect("job should be reassigned");
        assert_ne!(owner, victim);
        assert_eq!(cluster.holders(job).await, vec![owner]);
    }

    cluster.shutdown().await;
}

/// Checkpoint sequences stay gapless across several reassignments
#[tokio::test]
async fn test_gapless_history_across_reassignments() {
    let mut cluster = TestCluster::with_nodes(3, 200, 10).await;
    cluster.create_and_start(test_definition(JOB)).await;

    for _ in 0..3 {
        cluster.tick_owner(JOB).await;
    }
    let first = cluster.owner(JOB).await.unwrap();
    cluster.kill_node(first).await;

    for _ in 0..3 {
        cluster.tick_owner(JOB).await;
    }
    let second = cluster.owner(JOB).await.unwrap();
    assert_ne!(first, second);
    cluster.kill_node(second).await;

    for _ in 0..3 {
        cluster.tick_owner(JOB).await;
    }

    assert_eq!(cluster.sequences(JOB).await, (1..=9).collect::<Vec<_>>());
    let checkpoints = cluster.store.list(JOB).await.unwrap();
    for pair in checkpoints.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
        assert!(pair[0].stats.documents_processed < pair[1].stats.documents_processed);
    }

    cluster.shutdown().await;
}

/// Losing the only eligible node leaves the job unassigned until one joins
#[tokio::test]
async fn test_job_waits_for_eligible_node() {
    let mut cluster = TestCluster::with_nodes(1, 100, 10).await;
    cluster.create_and_start(test_definition(JOB)).await;
    progress_to(&cluster, 1, 2).await;

    cluster.kill_node(1).await;
    assert!(cluster.owner(JOB).await.is_none());
    assert!(cluster.cluster.is_desired(JOB).await);

    cluster.start_node(4).await.unwrap();
    assert_eq!(cluster.owner(JOB).await, Some(4));
    assert_eq!(
        cluster.status(4, JOB).await.unwrap().current_checkpoint,
        Some(2)
    );

    cluster.tick(4, JOB).await;
    assert_eq!(cluster.latest_sequence(JOB).await, Some(3));

    cluster.shutdown().await;
}

/// Replaying after a crash produces the same destination state as a clean run
#[tokio::test]
async fn test_resumption_is_idempotent() {
    // Clean run to completion
    let mut clean = TestCluster::with_nodes(1, 50, 10).await;
    clean.create_and_start(test_definition(JOB)).await;
    for _ in 0..6 {
        clean.tick(1, JOB).await;
    }
    assert_eq!(clean.latest_sequence(JOB).await, Some(5));
    let expected = clean.dest.inner.documents(DEST_INDEX).await;
    clean.shutdown().await;

    // Node 1 writes page three but crashes before its checkpoint is durable
    let mut crashed = TestCluster::with_nodes(2, 50, 10).await;
    crashed.create_and_start(test_definition(JOB)).await;
    progress_to(&crashed, 1, 2).await;
    crashed.store.fail_next_creates(1);
    crashed.tick(1, JOB).await;
    assert_eq!(crashed.latest_sequence(JOB).await, Some(2));
    assert_eq!(crashed.dest.inner.count(DEST_INDEX).await, 30);
    crashed.kill_node(1).await;

    for _ in 0..4 {
        crashed.tick(2, JOB).await;
    }

    assert_eq!(crashed.sequences(JOB).await, (1..=5).collect::<Vec<_>>());
    assert_eq!(crashed.dest.inner.documents(DEST_INDEX).await, expected);

    crashed.shutdown().await;
}
