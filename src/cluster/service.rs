use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, RwLock};

use crate::cluster::eligibility::EligibilityOptions;
use crate::cluster::state::{Assignment, ClusterState, DiscoveryNode, TaskStatusReport};
use crate::error::{Result, TransformError};

#[derive(Debug)]
struct Inner {
    state: ClusterState,
    /// Jobs the operator has started and not yet stopped.
    desired: BTreeSet<String>,
    heartbeats: HashMap<u64, Instant>,
    statuses: HashMap<String, TaskStatusReport>,
    /// Failure reasons of jobs in the failed state, by job id.
    failures: HashMap<String, String>,
    next_allocation_id: u64,
}

impl Inner {
    /// Assign every desired job that has no owner.
    fn allocate_pending(&mut self, options: &EligibilityOptions) -> Vec<Assignment> {
        let pending: Vec<String> = self
            .desired
            .iter()
            .filter(|job_id| !self.state.assignments.contains_key(*job_id))
            .cloned()
            .collect();

        let mut assigned = Vec::new();
        for job_id in pending {
            let Some(node_id) = self.state.pick_node(options) else {
                tracing::warn!(job_id = %job_id, "No eligible node for transform");
                continue;
            };
            self.next_allocation_id += 1;
            let assignment = Assignment {
                job_id: job_id.clone(),
                node_id,
                allocation_id: self.next_allocation_id,
                stop_requested: false,
                failure: self.failures.get(&job_id).cloned(),
            };
            tracing::info!(
                job_id = %job_id,
                node_id,
                allocation_id = assignment.allocation_id,
                failed = assignment.failure.is_some(),
                "Transform assigned"
            );
            self.state.assignments.insert(job_id, assignment.clone());
            assigned.push(assignment);
        }
        assigned
    }

    fn remove_node(&mut self, node_id: u64) -> bool {
        if self.state.nodes.remove(&node_id).is_none() {
            return false;
        }
        self.heartbeats.remove(&node_id);
        let orphaned: Vec<String> = self
            .state
            .assignments_for(node_id)
            .map(|a| a.job_id.clone())
            .collect();
        for job_id in orphaned {
            self.state.assignments.remove(&job_id);
            self.statuses.remove(&job_id);
            tracing::warn!(job_id = %job_id, node_id, "Transform unassigned, owner left the cluster");
        }
        true
    }
}

/// In-process cluster membership and persistent-task assignment.
///
/// Publishes an immutable [`ClusterState`] snapshot on every change. The
/// allocation id of an assignment acts as the fencing token for everything the
/// owning node writes back (status reports, stop completion).
#[derive(Debug)]
pub struct ClusterService {
    inner: RwLock<Inner>,
    tx: watch::Sender<Arc<ClusterState>>,
    options: EligibilityOptions,
    node_timeout: Duration,
}

impl ClusterService {
    pub fn new(options: EligibilityOptions, node_timeout: Duration) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ClusterState::default()));
        Self {
            inner: RwLock::new(Inner {
                state: ClusterState::default(),
                desired: BTreeSet::new(),
                heartbeats: HashMap::new(),
                statuses: HashMap::new(),
                failures: HashMap::new(),
                next_allocation_id: 0,
            }),
            tx,
            options,
            node_timeout,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> Arc<ClusterState> {
        self.tx.borrow().clone()
    }

    fn publish(&self, inner: &mut Inner) {
        inner.state.version += 1;
        self.tx.send_replace(Arc::new(inner.state.clone()));
    }

    /// Add (or replace) a member and hand it any unowned jobs.
    pub async fn join(&self, node: DiscoveryNode) {
        let mut inner = self.inner.write().await;
        let node_id = node.id;
        let eligible = node.is_transform_eligible(&self.options);
        inner.heartbeats.insert(node_id, Instant::now());
        inner.state.nodes.insert(node_id, node);
        inner.allocate_pending(&self.options);
        self.publish(&mut inner);
        tracing::info!(node_id, eligible, "Node joined cluster");
    }

    /// Remove a member, unassign its jobs and reassign them elsewhere.
    pub async fn leave(&self, node_id: u64) -> Vec<Assignment> {
        let mut inner = self.inner.write().await;
        if !inner.remove_node(node_id) {
            return Vec::new();
        }
        let reassigned = inner.allocate_pending(&self.options);
        self.publish(&mut inner);
        tracing::info!(node_id, reassigned = reassigned.len(), "Node left cluster");
        reassigned
    }

    pub async fn heartbeat(&self, node_id: u64) {
        let mut inner = self.inner.write().await;
        if inner.state.nodes.contains_key(&node_id) {
            inner.heartbeats.insert(node_id, Instant::now());
        }
    }

    /// Drop members whose last heartbeat is older than the node timeout.
    pub async fn reap_dead_nodes(&self) -> Vec<u64> {
        let mut inner = self.inner.write().await;
        let dead: Vec<u64> = inner
            .heartbeats
            .iter()
            .filter(|(_, seen)| seen.elapsed() >= self.node_timeout)
            .map(|(&id, _)| id)
            .collect();
        if dead.is_empty() {
            return dead;
        }
        for &node_id in &dead {
            inner.remove_node(node_id);
            tracing::warn!(node_id, "Node missed heartbeats, removed from cluster");
        }
        inner.allocate_pending(&self.options);
        self.publish(&mut inner);
        dead
    }

    /// Mark a job as wanted and assign it if an eligible node exists.
    ///
    /// Returns the current assignment, which is `None` while no eligible node
    /// is available.
    pub async fn start_job(&self, job_id: &str) -> Result<Option<Assignment>> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.state.assignments.get(job_id) {
            if existing.stop_requested {
                return Err(TransformError::Configuration(format!(
                    "Transform {} is stopping, wait for the stop to complete",
                    job_id
                )));
            }
            return Ok(Some(existing.clone()));
        }
        inner.desired.insert(job_id.to_string());
        inner.allocate_pending(&self.options);
        self.publish(&mut inner);
        Ok(inner.state.assignments.get(job_id).cloned())
    }

    /// Ask the owner of a job to stop it.
    pub async fn request_stop(&self, job_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.desired.contains(job_id) {
            return Err(TransformError::NotFound(job_id.to_string()));
        }
        match inner.state.assignments.get_mut(job_id) {
            Some(assignment) => {
                assignment.stop_requested = true;
            }
            None => {
                inner.desired.remove(job_id);
                inner.failures.remove(job_id);
            }
        }
        self.publish(&mut inner);
        tracing::info!(job_id = %job_id, "Stop requested");
        Ok(())
    }

    /// Release an assignment once its owner has stopped the task.
    pub async fn complete_stop(&self, job_id: &str, allocation_id: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        Self::check_allocation(&inner.state, job_id, allocation_id)?;
        inner.state.assignments.remove(job_id);
        inner.desired.remove(job_id);
        inner.statuses.remove(job_id);
        inner.failures.remove(job_id);
        self.publish(&mut inner);
        tracing::info!(job_id = %job_id, allocation_id, "Transform released");
        Ok(())
    }

    /// Record that a job failed terminally. The failure sticks to the job
    /// across reassignments until it is stopped.
    pub async fn mark_failed(&self, job_id: &str, allocation_id: u64, reason: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        Self::check_allocation(&inner.state, job_id, allocation_id)?;
        inner.failures.insert(job_id.to_string(), reason.to_string());
        if let Some(assignment) = inner.state.assignments.get_mut(job_id) {
            assignment.failure = Some(reason.to_string());
        }
        self.publish(&mut inner);
        tracing::warn!(job_id = %job_id, allocation_id, reason = %reason, "Transform marked failed");
        Ok(())
    }

    /// Publish the owner's view of a task. Reports from a stale allocation are
    /// rejected.
    pub async fn report_status(
        &self,
        job_id: &str,
        allocation_id: u64,
        report: TaskStatusReport,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        Self::check_allocation(&inner.state, job_id, allocation_id)?;
        inner.statuses.insert(job_id.to_string(), report);
        Ok(())
    }

    pub async fn task_status(&self, job_id: &str) -> Option<TaskStatusReport> {
        self.inner.read().await.statuses.get(job_id).cloned()
    }

    pub async fn assignment(&self, job_id: &str) -> Option<Assignment> {
        self.inner.read().await.state.assignments.get(job_id).cloned()
    }

    pub async fn is_desired(&self, job_id: &str) -> bool {
        self.inner.read().await.desired.contains(job_id)
    }

    fn check_allocation(state: &ClusterState, job_id: &str, allocation_id: u64) -> Result<()> {
        match state.assignments.get(job_id) {
            Some(a) if a.allocation_id == allocation_id => Ok(()),
            _ => Err(TransformError::AssignmentLost {
                job_id: job_id.to_string(),
                allocation_id,
            }),
        }
    }
}
