use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::cluster::eligibility::EligibilityOptions;
use crate::error::{Result, TransformError};

/// How many times a transform may retry after a non-critical failure.
pub const NUM_FAILURE_RETRIES_SETTING: &str = "xpack.transform.num_transform_failure_retries";
pub const DEFAULT_FAILURE_RETRIES: u32 = 10;
pub const MAX_FAILURE_RETRIES: u32 = 100;

pub const DEFAULT_MAX_PAGE_SIZE: usize = 500;
pub const DEFAULT_FREQUENCY: Duration = Duration::from_secs(60);

/// Size of the fixed `transform_indexing` worker pool.
pub const TASK_THREAD_POOL_SIZE: usize = 4;

/// Flat node settings, keyed the same way as the configuration file of a node
/// (`node.roles`, `node.data`, `node.attr.*`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSettings {
    values: BTreeMap<String, String>,
}

impl NodeSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse a boolean setting. Only `true` and `false` are accepted.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(other) => Err(TransformError::Configuration(format!(
                "Failed to parse value [{}] for setting [{}] as a boolean",
                other, key
            ))),
        }
    }

    /// Parse a comma-separated list setting. Empty entries are dropped.
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

/// Transform runtime settings. `max_retries` is dynamic, the rest are read
/// once at node startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformSettings {
    pub max_retries: u32,
    pub thread_pool_size: usize,
    /// Upper bound for a single source read, destination write or store call.
    pub io_timeout_ms: u64,
    /// How often the scheduler engine evaluates due jobs.
    pub scheduler_resolution_ms: u64,
    /// Upper bound on the random delay before a newly registered job's first tick.
    pub max_start_jitter_ms: u64,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_FAILURE_RETRIES,
            thread_pool_size: TASK_THREAD_POOL_SIZE,
            io_timeout_ms: 30_000,
            scheduler_resolution_ms: 100,
            max_start_jitter_ms: 0,
        }
    }
}

impl TransformSettings {
    /// Read the settings a node declares, falling back to defaults.
    pub fn from_node_settings(settings: &NodeSettings) -> Result<Self> {
        let mut out = Self::default();
        if let Some(raw) = settings.get(NUM_FAILURE_RETRIES_SETTING) {
            out.max_retries = raw.parse().map_err(|_| {
                TransformError::Configuration(format!(
                    "Failed to parse value [{}] for setting [{}]",
                    raw, NUM_FAILURE_RETRIES_SETTING
                ))
            })?;
        }
        out.validate()?;
        Ok(out)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        validate_max_retries(self.max_retries)?;
        if self.thread_pool_size == 0 {
            return Err(TransformError::Configuration(
                "thread_pool_size must be at least 1".to_string(),
            ));
        }
        if self.io_timeout_ms == 0 || self.scheduler_resolution_ms == 0 {
            return Err(TransformError::Configuration(
                "io_timeout_ms and scheduler_resolution_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_max_retries(value: u32) -> Result<()> {
    if value > MAX_FAILURE_RETRIES {
        return Err(TransformError::Configuration(format!(
            "Failed to parse value [{}] for setting [{}] must be <= {}",
            value, NUM_FAILURE_RETRIES_SETTING, MAX_FAILURE_RETRIES
        )));
    }
    Ok(())
}

/// Handle for settings that may change while the node runs.
///
/// Consumers hold a `watch::Receiver` and read the current value at each
/// decision point, so updates apply without a restart.
#[derive(Debug, Clone)]
pub struct DynamicSettings {
    tx: watch::Sender<TransformSettings>,
}

impl DynamicSettings {
    pub fn new(initial: TransformSettings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransformSettings> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> TransformSettings {
        self.tx.borrow().clone()
    }

    pub fn set_max_retries(&self, max_retries: u32) -> Result<()> {
        validate_max_retries(max_retries)?;
        self.tx.send_modify(|s| s.max_retries = max_retries);
        tracing::info!(max_retries, "Updated {}", NUM_FAILURE_RETRIES_SETTING);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub name: String,
    pub settings: NodeSettings,
    pub transform: TransformSettings,
    pub eligibility: EligibilityOptions,
    pub heartbeat_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            name: "node-1".to_string(),
            settings: NodeSettings::default(),
            transform: TransformSettings::default(),
            eligibility: EligibilityOptions::default(),
            heartbeat_interval_ms: 500,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            name: format!("node-{}", node_id),
            ..Default::default()
        }
    }

    pub fn with_setting(mut self, key: &str, value: impl Into<String>) -> Self {
        self.settings = self.settings.with(key, value);
        self
    }

    pub fn with_transform_settings(mut self, transform: TransformSettings) -> Self {
        self.transform = transform;
        self
    }
}
