//! Per-node owner of every transform task assigned to that node.
//!
//! A single event loop holds all task state. It reacts to cluster state
//! changes, scheduler ticks, stop requests and increment completions, and
//! drives each task through the transitions in [`crate::transform::state`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, DefinitionStore};
use crate::cluster::{Assignment, ClusterService, ClusterState, TaskStatusReport};
use crate::config::{TransformSettings, DEFAULT_FREQUENCY};
use crate::error::{Result, TransformError};
use crate::retry::{RetryBudget, RetryDecision, RetryPolicy};
use crate::scheduler::{SchedulerEngine, TickHandler};
use crate::transform::audit::{AuditKind, AuditSink};
use crate::transform::indexer::{IncrementOutcome, Indexer};
use crate::transform::model::{TaskState, TaskStatus};
use crate::transform::state::TaskEvent;

const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Everything a coordinator talks to.
pub struct CoordinatorDeps {
    pub node_id: u64,
    pub cluster: Arc<ClusterService>,
    pub engine: Arc<SchedulerEngine>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub definitions: Arc<dyn DefinitionStore>,
    pub indexer: Arc<Indexer>,
    pub audit: Arc<dyn AuditSink>,
    pub settings: watch::Receiver<TransformSettings>,
}

enum CoordinatorEvent {
    Tick {
        job_id: String,
        done: oneshot::Sender<()>,
    },
    IncrementFinished {
        job_id: String,
        allocation_id: u64,
        result: Result<IncrementOutcome>,
        done: oneshot::Sender<()>,
    },
    Stop {
        job_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        job_id: String,
        reply: oneshot::Sender<Option<TaskState>>,
    },
    Sync {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point into a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    /// Run one tick for `job_id` and wait until its outcome has been applied.
    pub async fn tick(&self, job_id: &str) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorEvent::Tick {
                job_id: job_id.to_string(),
                done,
            })
            .await?;
        rx.await?;
        Ok(())
    }

    /// Stop a task owned by this node.
    pub async fn stop(&self, job_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorEvent::Stop {
                job_id: job_id.to_string(),
                reply,
            })
            .await?;
        rx.await?
    }

    pub async fn status(&self, job_id: &str) -> Result<Option<TaskState>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorEvent::Status {
                job_id: job_id.to_string(),
                reply,
            })
            .await?;
        Ok(rx.await?)
    }

    /// Apply the latest cluster state and every event queued before this call.
    pub async fn sync(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CoordinatorEvent::Sync { reply }).await?;
        rx.await?;
        Ok(())
    }
}

/// Forwards scheduler ticks into the coordinator's queue.
struct TickBridge {
    handle: CoordinatorHandle,
}

#[async_trait]
impl TickHandler for TickBridge {
    async fn on_tick(&self, job_id: &str, _fired_at: Instant) {
        if let Err(e) = self.handle.tick(job_id).await {
            tracing::debug!(job_id = %job_id, error = %e, "Tick not delivered");
        }
    }
}

struct TaskSlot {
    state: TaskState,
    budget: RetryBudget,
    frequency: Duration,
    /// Set while an increment is running.
    cancel: Option<CancellationToken>,
}

pub struct Coordinator {
    deps: CoordinatorDeps,
    slots: HashMap<String, TaskSlot>,
    events_rx: mpsc::Receiver<CoordinatorEvent>,
    events_tx: mpsc::Sender<CoordinatorEvent>,
    cluster_rx: watch::Receiver<Arc<ClusterState>>,
    ticks: Arc<dyn TickHandler>,
}

async fn report_status(cluster: &ClusterService, job_id: &str, state: &TaskState) {
    let report = TaskStatusReport {
        node_id: state.node_id,
        allocation_id: state.allocation_id,
        status: state.status,
        checkpoint: state.current_checkpoint,
        retry_count: state.retry_count,
        last_failure: state.last_failure.clone(),
    };
    if let Err(e) = cluster
        .report_status(job_id, state.allocation_id, report)
        .await
    {
        tracing::debug!(job_id = %job_id, error = %e, "Status report rejected");
    }
}

/// Move a task to `Failed`, stop scheduling it and make the failure stick
/// to the job in cluster state.
async fn fail_terminally(deps: &CoordinatorDeps, job_id: &str, slot: &mut TaskSlot, reason: &str) {
    slot.state.apply(TaskEvent::Failed {
        reason: reason.to_string(),
        retry_count: slot.budget.attempts_since_last_success,
        terminal: true,
    });
    deps.audit.record(
        deps.node_id,
        job_id,
        AuditKind::Failed,
        &format!("task encountered irrecoverable failure: {}", reason),
    );
    deps.engine.deregister(job_id).await;
    if let Err(e) = deps
        .cluster
        .mark_failed(job_id, slot.state.allocation_id, reason)
        .await
    {
        tracing::debug!(job_id = %job_id, error = %e, "Failure not recorded in cluster state");
    }
}

impl Coordinator {
    pub fn new(deps: CoordinatorDeps) -> (Self, CoordinatorHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let handle = CoordinatorHandle {
            tx: events_tx.clone(),
        };
        let cluster_rx = deps.cluster.subscribe();
        let ticks: Arc<dyn TickHandler> = Arc::new(TickBridge {
            handle: handle.clone(),
        });
        let coordinator = Self {
            deps,
            slots: HashMap::new(),
            events_rx,
            events_tx,
            cluster_rx,
            ticks,
        };
        (coordinator, handle)
    }

    fn max_retries(&self) -> u32 {
        self.deps.settings.borrow().max_retries
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(node_id = self.deps.node_id, "Transform coordinator started");
        let initial = self.cluster_rx.borrow_and_update().clone();
        self.reconcile(&initial).await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                changed = self.cluster_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = self.cluster_rx.borrow_and_update().clone();
                    self.reconcile(&state).await;
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }
            }
        }

        for (job_id, slot) in self.slots.drain() {
            if let Some(cancel) = slot.cancel {
                cancel.cancel();
            }
            self.deps.engine.deregister(&job_id).await;
        }
        tracing::info!(node_id = self.deps.node_id, "Transform coordinator stopped");
    }

    async fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Tick { job_id, done } => self.on_tick(&job_id, done).await,
            CoordinatorEvent::IncrementFinished {
                job_id,
                allocation_id,
                result,
                done,
            } => {
                self.on_increment_finished(&job_id, allocation_id, result)
                    .await;
                let _ = done.send(());
            }
            CoordinatorEvent::Stop { job_id, reply } => {
                let result = if self.slots.contains_key(&job_id) {
                    self.begin_stop(&job_id).await;
                    Ok(())
                } else {
                    Err(TransformError::NotFound(job_id))
                };
                let _ = reply.send(result);
            }
            CoordinatorEvent::Status { job_id, reply } => {
                let _ = reply.send(self.slots.get(&job_id).map(|s| s.state.clone()));
            }
            CoordinatorEvent::Sync { reply } => {
                let state = self.cluster_rx.borrow_and_update().clone();
                self.reconcile(&state).await;
                let _ = reply.send(());
            }
        }
    }

    /// Bring local tasks in line with the assignments in `state`.
    async fn reconcile(&mut self, state: &ClusterState) {
        let node_id = self.deps.node_id;

        let lost: Vec<String> = self
            .slots
            .iter()
            .filter(|(job_id, slot)| match state.assignment(job_id) {
                Some(a) => a.node_id != node_id || a.allocation_id != slot.state.allocation_id,
                None => true,
            })
            .map(|(job_id, _)| job_id.clone())
            .collect();
        for job_id in lost {
            self.release_lost(&job_id).await;
        }

        let mine: Vec<Assignment> = state.assignments_for(node_id).cloned().collect();
        for assignment in mine {
            if !self.slots.contains_key(&assignment.job_id) {
                self.accept(&assignment).await;
            }
            if assignment.stop_requested {
                self.begin_stop(&assignment.job_id).await;
            }
        }
    }

    async fn accept(&mut self, assignment: &Assignment) {
        let job_id = assignment.job_id.as_str();
        let node_id = self.deps.node_id;

        match self.deps.checkpoints.fence(job_id, assignment.allocation_id).await {
            Ok(()) => {}
            Err(e @ TransformError::AssignmentLost { .. }) => {
                tracing::debug!(job_id = %job_id, error = %e, "Assignment already superseded");
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Could not fence older allocations");
            }
        }

        let frequency = match self.deps.definitions.get_definition(job_id).await {
            Ok(Some(def)) => def.frequency,
            _ => DEFAULT_FREQUENCY,
        };
        let checkpoint = match self.deps.checkpoints.get_latest(job_id).await {
            Ok(latest) => latest.map(|c| c.sequence_number),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Could not load checkpoint, will retry on first tick");
                None
            }
        };

        let mut state = TaskState::new(node_id, assignment.allocation_id, checkpoint);
        match &assignment.failure {
            Some(reason) => {
                state.apply(TaskEvent::AssignedFailed {
                    reason: reason.clone(),
                });
                tracing::warn!(
                    job_id = %job_id,
                    node_id,
                    allocation_id = assignment.allocation_id,
                    reason = %reason,
                    "Transform task taken over in failed state"
                );
                self.deps.audit.record(
                    node_id,
                    job_id,
                    AuditKind::Failed,
                    &format!(
                        "allocation {} took over failed task: {}",
                        assignment.allocation_id, reason
                    ),
                );
            }
            None => {
                state.apply(TaskEvent::Assigned);
                self.deps
                    .engine
                    .register(job_id, frequency, self.ticks.clone())
                    .await;

                tracing::info!(
                    job_id = %job_id,
                    node_id,
                    allocation_id = assignment.allocation_id,
                    checkpoint = ?checkpoint,
                    "Transform task started"
                );
                self.deps.audit.record(
                    node_id,
                    job_id,
                    AuditKind::Started,
                    &format!(
                        "allocation {} resuming after checkpoint {:?}",
                        assignment.allocation_id, checkpoint
                    ),
                );
            }
        }
        report_status(&self.deps.cluster, job_id, &state).await;

        self.slots.insert(
            job_id.to_string(),
            TaskSlot {
                state,
                budget: RetryBudget::new(self.max_retries()),
                frequency,
                cancel: None,
            },
        );
    }

    async fn release_lost(&mut self, job_id: &str) {
        let Some(mut slot) = self.slots.remove(job_id) else {
            return;
        };
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
        }
        slot.state.apply(TaskEvent::Unassigned);
        self.deps.engine.deregister(job_id).await;

        tracing::warn!(
            job_id = %job_id,
            node_id = self.deps.node_id,
            allocation_id = slot.state.allocation_id,
            "Transform assignment lost"
        );
        self.deps.audit.record(
            self.deps.node_id,
            job_id,
            AuditKind::AssignmentLost,
            &format!("allocation {} is no longer owned by this node", slot.state.allocation_id),
        );
    }

    async fn begin_stop(&mut self, job_id: &str) {
        let node_id = self.deps.node_id;
        let Some(slot) = self.slots.get_mut(job_id) else {
            return;
        };
        if slot.state.apply(TaskEvent::StopRequested).is_none() {
            return;
        }
        let in_flight = slot.cancel.as_ref().map(CancellationToken::clone);

        tracing::info!(job_id = %job_id, node_id, "Stopping transform task");
        self.deps
            .audit
            .record(node_id, job_id, AuditKind::Stopping, "stop requested");
        self.deps.engine.deregister(job_id).await;

        match in_flight {
            Some(cancel) => {
                cancel.cancel();
                report_status(&self.deps.cluster, job_id, &slot.state).await;
            }
            None => self.finish_stop(job_id).await,
        }
    }

    async fn finish_stop(&mut self, job_id: &str) {
        let Some(mut slot) = self.slots.remove(job_id) else {
            return;
        };
        slot.state.apply(TaskEvent::StopCompleted);
        report_status(&self.deps.cluster, job_id, &slot.state).await;

        tracing::info!(job_id = %job_id, node_id = self.deps.node_id, "Transform task stopped");
        self.deps
            .audit
            .record(self.deps.node_id, job_id, AuditKind::Stopped, "stopped");

        if let Err(e) = self
            .deps
            .cluster
            .complete_stop(job_id, slot.state.allocation_id)
            .await
        {
            tracing::debug!(job_id = %job_id, error = %e, "Assignment already released");
        }
    }

    async fn on_tick(&mut self, job_id: &str, done: oneshot::Sender<()>) {
        let Some(status) = self.slots.get(job_id).map(|s| s.state.status) else {
            let _ = done.send(());
            return;
        };
        if status != TaskStatus::Started {
            tracing::debug!(job_id = %job_id, status = %status, "Tick ignored");
            let _ = done.send(());
            return;
        }

        let definition = match self.deps.definitions.get_definition(job_id).await {
            Ok(Some(def)) => def,
            Ok(None) => {
                self.fail_before_increment(job_id, TransformError::NotFound(job_id.to_string()))
                    .await;
                let _ = done.send(());
                return;
            }
            Err(e) => {
                self.fail_before_increment(job_id, e).await;
                let _ = done.send(());
                return;
            }
        };

        if !definition.enabled {
            tracing::debug!(job_id = %job_id, "Transform disabled, tick skipped");
            let _ = done.send(());
            return;
        }

        let max_retries = self.max_retries();
        let Some(slot) = self.slots.get_mut(job_id) else {
            let _ = done.send(());
            return;
        };

        // The retry limit may have been lowered below the failures already seen
        slot.budget.max_retries = max_retries;
        if slot.budget.attempts_since_last_success > max_retries {
            let reason = slot
                .state
                .last_failure
                .clone()
                .unwrap_or_else(|| "retry budget exhausted".to_string());
            tracing::error!(
                job_id = %job_id,
                attempts = slot.budget.attempts_since_last_success,
                max_retries,
                "Failures already exceed the retry limit, transform failed"
            );
            fail_terminally(&self.deps, job_id, slot, &reason).await;
            report_status(&self.deps.cluster, job_id, &slot.state).await;
            let _ = done.send(());
            return;
        }
        if definition.frequency != slot.frequency {
            slot.frequency = definition.frequency;
            self.deps
                .engine
                .reschedule(job_id, definition.frequency)
                .await;
            tracing::info!(
                job_id = %job_id,
                frequency_ms = definition.frequency.as_millis() as u64,
                "Transform frequency updated"
            );
        }

        slot.state.apply(TaskEvent::TickFired);
        let cancel = CancellationToken::new();
        slot.cancel = Some(cancel.clone());
        let allocation_id = slot.state.allocation_id;
        report_status(&self.deps.cluster, job_id, &slot.state).await;
        tracing::debug!(job_id = %job_id, allocation_id, "Increment started");
        self.deps.audit.record(
            self.deps.node_id,
            job_id,
            AuditKind::IndexingStarted,
            &format!("allocation {}", allocation_id),
        );

        let indexer = self.deps.indexer.clone();
        let events = self.events_tx.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let result = indexer
                .run_increment(&definition, allocation_id, &cancel)
                .await;
            let _ = events
                .send(CoordinatorEvent::IncrementFinished {
                    job_id,
                    allocation_id,
                    result,
                    done,
                })
                .await;
        });
    }

    /// Route a failure that happened before the increment could start through
    /// the normal completion path.
    async fn fail_before_increment(&mut self, job_id: &str, error: TransformError) {
        let Some(slot) = self.slots.get_mut(job_id) else {
            return;
        };
        slot.state.apply(TaskEvent::TickFired);
        let allocation_id = slot.state.allocation_id;
        self.deps.audit.record(
            self.deps.node_id,
            job_id,
            AuditKind::IndexingStarted,
            &format!("allocation {}", allocation_id),
        );
        self.on_increment_finished(job_id, allocation_id, Err(error))
            .await;
    }

    async fn on_increment_finished(
        &mut self,
        job_id: &str,
        allocation_id: u64,
        result: Result<IncrementOutcome>,
    ) {
        let node_id = self.deps.node_id;
        let max_retries = self.max_retries();
        let Some(slot) = self
            .slots
            .get_mut(job_id)
            .filter(|s| s.state.allocation_id == allocation_id)
        else {
            tracing::debug!(job_id = %job_id, allocation_id, "Discarding result of a stale increment");
            return;
        };
        slot.cancel = None;

        if slot.state.status == TaskStatus::Stopping {
            match result {
                Ok(IncrementOutcome::Progressed(checkpoint)) => {
                    slot.state.apply(TaskEvent::Succeeded {
                        checkpoint: Some(checkpoint.sequence_number),
                    });
                    self.deps.audit.record(
                        node_id,
                        job_id,
                        AuditKind::CheckpointCreated,
                        &format!("sequence {}", checkpoint.sequence_number),
                    );
                }
                Ok(_) => {
                    slot.state.apply(TaskEvent::Interrupted);
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Increment failed while stopping");
                }
            }
            self.finish_stop(job_id).await;
            return;
        }

        match result {
            Ok(IncrementOutcome::Progressed(checkpoint)) => {
                slot.budget.reset();
                slot.state.apply(TaskEvent::Succeeded {
                    checkpoint: Some(checkpoint.sequence_number),
                });
                tracing::info!(
                    job_id = %job_id,
                    sequence = checkpoint.sequence_number,
                    documents_indexed = checkpoint.stats.documents_indexed,
                    "Checkpoint created"
                );
                self.deps.audit.record(
                    node_id,
                    job_id,
                    AuditKind::CheckpointCreated,
                    &format!("sequence {}", checkpoint.sequence_number),
                );
                self.deps.audit.record(
                    node_id,
                    job_id,
                    AuditKind::IndexingFinished,
                    &format!("checkpoint {}", checkpoint.sequence_number),
                );
            }
            Ok(IncrementOutcome::Idle) => {
                slot.budget.reset();
                slot.state.apply(TaskEvent::Succeeded { checkpoint: None });
                self.deps.audit.record(
                    node_id,
                    job_id,
                    AuditKind::IndexingFinished,
                    "no new documents",
                );
            }
            Ok(IncrementOutcome::Cancelled) => {
                slot.state.apply(TaskEvent::Interrupted);
                self.deps
                    .audit
                    .record(node_id, job_id, AuditKind::IndexingFinished, "interrupted");
            }
            Err(e) => {
                slot.budget.max_retries = max_retries;
                let decision = RetryPolicy::on_failure(&mut slot.budget, &e);
                let attempts = slot.budget.attempts_since_last_success;
                match decision {
                    RetryDecision::Retry => {
                        tracing::warn!(
                            job_id = %job_id,
                            error = %e,
                            attempt = attempts,
                            max_retries,
                            "Increment failed, will retry"
                        );
                        slot.state.apply(TaskEvent::Failed {
                            reason: e.to_string(),
                            retry_count: attempts,
                            terminal: false,
                        });
                        self.deps.audit.record(
                            node_id,
                            job_id,
                            AuditKind::Failure,
                            &format!("{} (attempt {} of {})", e, attempts, max_retries),
                        );
                        self.deps.audit.record(
                            node_id,
                            job_id,
                            AuditKind::IndexingFinished,
                            "failed, retrying on next tick",
                        );
                    }
                    RetryDecision::Fail => {
                        tracing::error!(
                            job_id = %job_id,
                            error = %e,
                            attempt = attempts,
                            max_retries,
                            "Transform failed"
                        );
                        self.deps
                            .audit
                            .record(node_id, job_id, AuditKind::Failure, &e.to_string());
                        fail_terminally(&self.deps, job_id, slot, &e.to_string()).await;
                    }
                    RetryDecision::Abandon => {
                        tracing::warn!(
                            job_id = %job_id,
                            error = %e,
                            "Checkpoint moved underneath this task, reloading on next tick"
                        );
                        slot.state.apply(TaskEvent::Interrupted);
                        self.deps.audit.record(
                            node_id,
                            job_id,
                            AuditKind::IndexingFinished,
                            "abandoned, checkpoint moved",
                        );
                    }
                }
            }
        }

        report_status(&self.deps.cluster, job_id, &slot.state).await;
    }
}
