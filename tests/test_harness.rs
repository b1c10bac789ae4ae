//! Test harness for multi-node transform cluster integration tests.
//!
//! Nodes share one cluster service, store, source and destination. Time is a
//! `ManualClock` and scheduler engines are polled by the test, so every tick
//! is explicit.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use transform_lite::checkpoint::{CheckpointStore, MemoryStore, Position};
use transform_lite::cluster::eligibility::NODE_ROLES_SETTING;
use transform_lite::cluster::{ClusterService, EligibilityOptions};
use transform_lite::config::{DynamicSettings, NodeConfig, TransformSettings};
use transform_lite::node::{Node, NodeDeps};
use transform_lite::scheduler::{ManualClock, SchedulerEngine};
use transform_lite::transform::{
    CoordinatorHandle, DestConfig, DestinationWriter, Document, JobDefinition, MemoryAuditor,
    MemoryDestination, Page, SourceConfig, SourceReader, TaskState, TransformService, VecSource,
};
use transform_lite::{Result, TransformError};

pub const SOURCE_INDEX: &str = "orders";
pub const DEST_INDEX: &str = "orders_pivot";

/// Makes the next call block until released.
#[derive(Default)]
pub struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until a call is parked at the gate.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

/// `VecSource` with injectable failures and a gate in front of reads.
#[derive(Default)]
pub struct ScriptedSource {
    pub inner: VecSource,
    pub gate: Gate,
    failures: Mutex<VecDeque<TransformError>>,
}

impl ScriptedSource {
    pub fn fail_next_reads(&self, count: usize) {
        let mut failures = self.failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(TransformError::TransientIo("source timed out".into()));
        }
    }

    pub fn fail_next_read_with(&self, error: TransformError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }
}

#[async_trait]
impl SourceReader for ScriptedSource {
    async fn read(
        &self,
        source: &SourceConfig,
        position: &Position,
        page_size: usize,
    ) -> Result<Page> {
        self.gate.pass().await;
        let injected = self.failures.lock().unwrap().pop_front();
        if let Some(error) = injected {
            return Err(error);
        }
        self.inner.read(source, position, page_size).await
    }
}

/// `MemoryDestination` with a gate in front of writes.
#[derive(Default)]
pub struct GatedDestination {
    pub inner: MemoryDestination,
    pub gate: Gate,
}

#[async_trait]
impl DestinationWriter for GatedDestination {
    async fn write(&self, dest: &DestConfig, documents: &[Document]) -> Result<usize> {
        self.gate.pass().await;
        self.inner.write(dest, documents).await
    }
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: u64,
    pub handle: CoordinatorHandle,
    pub engine: Arc<SchedulerEngine>,
    shutdown: CancellationToken,
    coordinator: JoinHandle<()>,
}

pub struct TestCluster {
    pub cluster: Arc<ClusterService>,
    pub store: Arc<MemoryStore>,
    pub source: Arc<ScriptedSource>,
    pub dest: Arc<GatedDestination>,
    pub audit: Arc<MemoryAuditor>,
    pub clock: Arc<ManualClock>,
    pub settings: DynamicSettings,
    pub service: TransformService,
    nodes: HashMap<u64, TestNode>,
}

/// Settings with short timeouts for faster tests
pub fn test_transform_settings(max_retries: u32) -> TransformSettings {
    TransformSettings {
        io_timeout_ms: 5_000,
        scheduler_resolution_ms: 10,
        ..TransformSettings::default().with_max_retries(max_retries)
    }
}

pub fn test_definition(job_id: &str) -> JobDefinition {
    JobDefinition::new(job_id, SOURCE_INDEX, DEST_INDEX)
        .with_frequency(Duration::from_secs(10))
        .with_max_page_size(10)
}

impl TestCluster {
    /// Create a cluster with no nodes and `docs` documents in the source.
    pub async fn new(docs: usize, max_retries: u32) -> Self {
        let cluster = Arc::new(ClusterService::new(
            EligibilityOptions::default(),
            Duration::from_secs(3600),
        ));
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(ScriptedSource::default());
        source
            .inner
            .append(
                SOURCE_INDEX,
                (0..docs).map(|n| Document::new(format!("order-{:04}", n), json!({ "n": n }))),
            )
            .await;
        let service = TransformService::new(store.clone(), store.clone(), cluster.clone());

        Self {
            cluster,
            store,
            source,
            dest: Arc::new(GatedDestination::default()),
            audit: Arc::new(MemoryAuditor::new()),
            clock: Arc::new(ManualClock::new()),
            settings: DynamicSettings::new(test_transform_settings(max_retries)),
            service,
            nodes: HashMap::new(),
        }
    }

    /// Create a cluster with `num_nodes` transform nodes, ids starting at 1.
    pub async fn with_nodes(num_nodes: u64, docs: usize, max_retries: u32) -> Self {
        let mut cluster = Self::new(docs, max_retries).await;
        for node_id in 1..=num_nodes {
            cluster
                .start_node(node_id)
                .await
                .expect("transform node should start");
        }
        cluster
    }

    fn deps(&self) -> NodeDeps {
        NodeDeps {
            cluster: self.cluster.clone(),
            checkpoints: self.store.clone(),
            definitions: self.store.clone(),
            source: self.source.clone(),
            dest: self.dest.clone(),
            audit: self.audit.clone(),
            clock: self.clock.clone(),
            settings: self.settings.clone(),
        }
    }

    pub fn node_config(&self, node_id: u64, roles: &str) -> NodeConfig {
        NodeConfig::new(node_id)
            .with_setting(NODE_ROLES_SETTING, roles)
            .with_transform_settings(self.settings.current())
    }

    /// Start a node with the data and transform roles.
    pub async fn start_node(&mut self, node_id: u64) -> Result<()> {
        let config = self.node_config(node_id, "data,transform");
        self.start_node_with(config).await
    }

    /// Start a node from an explicit config. Ineligible nodes join the
    /// cluster but run no coordinator and are not tracked.
    pub async fn start_node_with(&mut self, config: NodeConfig) -> Result<()> {
        let node_id = config.node_id;
        let mut node = Node::new(config, self.deps())?;
        node.join().await;

        let shutdown = CancellationToken::new();
        let (Some(handle), Some(coordinator)) = (
            node.handle().cloned(),
            node.spawn_coordinator(shutdown.clone()),
        ) else {
            return Ok(());
        };
        self.nodes.insert(
            node_id,
            TestNode {
                node_id,
                handle,
                engine: node.engine().clone(),
                shutdown,
                coordinator,
            },
        );
        self.sync_all().await;
        Ok(())
    }

    pub fn node(&self, node_id: u64) -> &TestNode {
        self.nodes
            .get(&node_id)
            .unwrap_or_else(|| panic!("node {} is not running", node_id))
    }

    pub fn node_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Let every coordinator apply the latest cluster state.
    pub async fn sync_all(&self) {
        for node in self.nodes.values() {
            node.handle.sync().await.expect("coordinator should be running");
        }
    }

    /// Create and start a transform, returning the owning node.
    pub async fn create_and_start(&self, definition: JobDefinition) -> Option<u64> {
        let job_id = definition.id.clone();
        self.service.put(definition).await.expect("put should succeed");
        let assignment = self
            .service
            .start(&job_id)
            .await
            .expect("start should succeed");
        self.sync_all().await;
        assignment.map(|a| a.node_id)
    }

    pub async fn owner(&self, job_id: &str) -> Option<u64> {
        self.cluster.assignment(job_id).await.map(|a| a.node_id)
    }

    /// Run one tick on `node_id` and wait for its outcome.
    pub async fn tick(&self, node_id: u64, job_id: &str) {
        self.node(node_id)
            .handle
            .tick(job_id)
            .await
            .expect("coordinator should be running");
    }

    /// Run one tick on whichever node owns `job_id`.
    pub async fn tick_owner(&self, job_id: &str) {
        let owner = self.owner(job_id).await.expect("job should be assigned");
        self.tick(owner, job_id).await;
    }

    /// Tick `node_id` in the background; the tick can be parked at a gate.
    pub fn spawn_tick(&self, node_id: u64, job_id: &str) -> JoinHandle<Result<()>> {
        let handle = self.node(node_id).handle.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move { handle.tick(&job_id).await })
    }

    /// Advance time, poll every engine once and wait for fired ticks.
    pub async fn advance(&self, by: Duration) -> usize {
        self.clock.advance(by);
        let mut fired = 0;
        for node in self.nodes.values() {
            fired += node.engine.poll().await.fired;
        }
        for node in self.nodes.values() {
            node.engine.wait_idle().await;
        }
        fired
    }

    pub async fn status(&self, node_id: u64, job_id: &str) -> Option<TaskState> {
        self.node(node_id)
            .handle
            .status(job_id)
            .await
            .expect("coordinator should be running")
    }

    /// Nodes whose coordinator currently holds local state for `job_id`.
    pub async fn holders(&self, job_id: &str) -> Vec<u64> {
        let mut holders = Vec::new();
        for node_id in self.node_ids() {
            if self.status(node_id, job_id).await.is_some() {
                holders.push(node_id);
            }
        }
        holders
    }

    pub async fn sequences(&self, job_id: &str) -> Vec<u64> {
        self.store
            .list(job_id)
            .await
            .expect("list should succeed")
            .iter()
            .map(|c| c.sequence_number)
            .collect()
    }

    pub async fn latest_sequence(&self, job_id: &str) -> Option<u64> {
        self.store
            .get_latest(job_id)
            .await
            .expect("get_latest should succeed")
            .map(|c| c.sequence_number)
    }

    /// Remove a node from cluster membership while its coordinator keeps
    /// running, as when the node is partitioned away.
    pub async fn partition_node(&self, node_id: u64) {
        self.cluster.leave(node_id).await;
        self.sync_all().await;
    }

    /// Crash a node: stop its coordinator without a graceful stop, then drop
    /// it from membership.
    pub async fn kill_node(&mut self, node_id: u64) -> bool {
        let Some(node) = self.nodes.remove(&node_id) else {
            return false;
        };
        node.shutdown.cancel();
        let _ = node.coordinator.await;
        self.cluster.leave(node_id).await;
        self.sync_all().await;
        true
    }

    pub async fn shutdown(&mut self) {
        for node_id in self.node_ids() {
            self.kill_node(node_id).await;
        }
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}
