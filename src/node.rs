use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, DefinitionStore};
use crate::cluster::eligibility;
use crate::cluster::{ClusterService, DiscoveryNode, Eligibility};
use crate::config::{DynamicSettings, NodeConfig};
use crate::error::Result;
use crate::scheduler::{Clock, SchedulerConfig, SchedulerEngine};
use crate::transform::{
    AuditSink, Coordinator, CoordinatorDeps, CoordinatorHandle, DestinationWriter, Indexer,
    SourceReader,
};

/// Shared collaborators handed to every node.
#[derive(Clone)]
pub struct NodeDeps {
    pub cluster: Arc<ClusterService>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub definitions: Arc<dyn DefinitionStore>,
    pub source: Arc<dyn SourceReader>,
    pub dest: Arc<dyn DestinationWriter>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
    pub settings: DynamicSettings,
}

/// A cluster member. Nodes that are eligible for transforms also run a
/// coordinator and a scheduler engine.
pub struct Node {
    config: NodeConfig,
    eligibility: Eligibility,
    descriptor: DiscoveryNode,
    cluster: Arc<ClusterService>,
    engine: Arc<SchedulerEngine>,
    coordinator: Option<Coordinator>,
    handle: Option<CoordinatorHandle>,
}

impl Node {
    /// Validate startup settings and wire the node's components.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the node settings are invalid,
    /// including an attempt to set the transform node attribute directly.
    pub fn new(config: NodeConfig, deps: NodeDeps) -> Result<Self> {
        config.transform.validate()?;
        let attributes = eligibility::startup_attributes(&config.settings, &config.eligibility)?;
        let eligibility = eligibility::resolve(&config.settings, &config.eligibility)?;
        let descriptor = DiscoveryNode {
            id: config.node_id,
            name: config.name.clone(),
            roles: eligibility::declared_roles(&config.settings, &eligibility),
            attributes,
        };

        let engine = Arc::new(SchedulerEngine::new(
            SchedulerConfig {
                pool_size: config.transform.thread_pool_size,
                resolution: Duration::from_millis(config.transform.scheduler_resolution_ms),
                max_start_jitter: Duration::from_millis(config.transform.max_start_jitter_ms),
            },
            deps.clock.clone(),
        ));

        let (coordinator, handle) = if eligibility.eligible {
            let indexer = Arc::new(Indexer::new(
                deps.source,
                deps.dest,
                deps.checkpoints.clone(),
                config.transform.io_timeout(),
            ));
            let (coordinator, handle) = Coordinator::new(CoordinatorDeps {
                node_id: config.node_id,
                cluster: deps.cluster.clone(),
                engine: engine.clone(),
                checkpoints: deps.checkpoints,
                definitions: deps.definitions,
                indexer,
                audit: deps.audit,
                settings: deps.settings.subscribe(),
            });
            (Some(coordinator), Some(handle))
        } else {
            (None, None)
        };

        tracing::info!(
            node_id = config.node_id,
            name = %config.name,
            eligible = eligibility.eligible,
            source = ?eligibility.source,
            "Node initialised"
        );

        Ok(Self {
            config,
            eligibility,
            descriptor,
            cluster: deps.cluster,
            engine,
            coordinator,
            handle,
        })
    }

    pub fn node_id(&self) -> u64 {
        self.config.node_id
    }

    pub fn descriptor(&self) -> &DiscoveryNode {
        &self.descriptor
    }

    pub fn eligibility(&self) -> Eligibility {
        self.eligibility
    }

    pub fn engine(&self) -> &Arc<SchedulerEngine> {
        &self.engine
    }

    /// Present only on transform-eligible nodes.
    pub fn handle(&self) -> Option<&CoordinatorHandle> {
        self.handle.as_ref()
    }

    pub async fn join(&self) {
        self.cluster.join(self.descriptor.clone()).await;
    }

    /// Start the coordinator loop. Returns `None` if the node is not eligible
    /// or the coordinator was already started.
    pub fn spawn_coordinator(&mut self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let coordinator = self.coordinator.take()?;
        Some(tokio::spawn(coordinator.run(shutdown)))
    }

    pub fn spawn_scheduler(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = engine.run() => {}
                _ = shutdown.cancelled() => engine.stop(),
            }
        })
    }

    pub fn spawn_heartbeat(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let cluster = self.cluster.clone();
        let node_id = self.config.node_id;
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => cluster.heartbeat(node_id).await,
                }
            }
        })
    }

    /// Join the cluster and run every subsystem until `shutdown` fires, then
    /// leave so the node's tasks are reassigned.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.join().await;

        let mut tasks = vec![
            self.spawn_scheduler(shutdown.clone()),
            self.spawn_heartbeat(shutdown.clone()),
        ];
        if let Some(coordinator) = self.spawn_coordinator(shutdown.clone()) {
            tasks.push(coordinator);
        }

        shutdown.cancelled().await;
        self.engine.stop();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(node_id = self.config.node_id, error = %e, "Node task panicked");
            }
        }
        self.engine.wait_idle().await;
        self.cluster.leave(self.config.node_id).await;
        tracing::info!(node_id = self.config.node_id, "Node shut down");
        Ok(())
    }
}
