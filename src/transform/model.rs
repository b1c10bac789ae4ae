use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_FREQUENCY, DEFAULT_MAX_PAGE_SIZE};
use crate::error::{Result, TransformError};

pub const MAX_ID_LENGTH: usize = 64;
pub const MIN_FREQUENCY: Duration = Duration::from_secs(1);
pub const MAX_FREQUENCY: Duration = Duration::from_secs(3600);
pub const MIN_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub index: String,
    /// Filter passed through to the source untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestConfig {
    pub index: String,
}

/// A continuous transform: what to read, where to write, how often.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub source: SourceConfig,
    pub dest: DestConfig,
    pub frequency: Duration,
    pub max_page_size: usize,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl JobDefinition {
    pub fn new(id: &str, source_index: &str, dest_index: &str) -> Self {
        Self {
            id: id.to_string(),
            source: SourceConfig {
                index: source_index.to_string(),
                query: None,
            },
            dest: DestConfig {
                index: dest_index.to_string(),
            },
            frequency: DEFAULT_FREQUENCY,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            enabled: true,
            description: None,
        }
    }

    pub fn with_frequency(mut self, frequency: Duration) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size;
        self
    }

    pub fn with_query(mut self, query: serde_json::Value) -> Self {
        self.source.query = Some(query);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;
        if self.frequency < MIN_FREQUENCY || self.frequency > MAX_FREQUENCY {
            return Err(TransformError::Configuration(format!(
                "Transform {}: frequency must be between {:?} and {:?}, got {:?}",
                self.id, MIN_FREQUENCY, MAX_FREQUENCY, self.frequency
            )));
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.max_page_size) {
            return Err(TransformError::Configuration(format!(
                "Transform {}: max_page_size must be between {} and {}, got {}",
                self.id, MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.max_page_size
            )));
        }
        if self.source.index.trim().is_empty() || self.dest.index.trim().is_empty() {
            return Err(TransformError::Configuration(format!(
                "Transform {}: source and destination index must be set",
                self.id
            )));
        }
        if self.source.index == self.dest.index {
            return Err(TransformError::Configuration(format!(
                "Transform {}: destination index [{}] must differ from the source",
                self.id, self.dest.index
            )));
        }
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<()> {
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let edges = id.chars().next().is_some_and(alnum) && id.chars().last().is_some_and(alnum);
    if id.is_empty() || id.len() > MAX_ID_LENGTH || !valid_chars || !edges {
        return Err(TransformError::Configuration(format!(
            "Invalid transform id [{}]: use 1 to {} lowercase letters, digits, '-' or '_', starting and ending with a letter or digit",
            id, MAX_ID_LENGTH
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Unassigned,
    Started,
    Indexing,
    Stopping,
    Stopped,
    Failed,
}

impl TaskStatus {
    /// Whether the owning node is actively driving the job.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Started | TaskStatus::Indexing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Unassigned => "unassigned",
            TaskStatus::Started => "started",
            TaskStatus::Indexing => "indexing",
            TaskStatus::Stopping => "stopping",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Run state of a job on the node that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub current_checkpoint: Option<u64>,
    pub retry_count: u32,
    pub last_failure: Option<String>,
    pub node_id: u64,
    pub allocation_id: u64,
}

impl TaskState {
    pub fn new(node_id: u64, allocation_id: u64, current_checkpoint: Option<u64>) -> Self {
        Self {
            status: TaskStatus::Unassigned,
            current_checkpoint,
            retry_count: 0,
            last_failure: None,
            node_id,
            allocation_id,
        }
    }
}
