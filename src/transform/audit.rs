use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditKind {
    Started,
    /// Started -> Indexing.
    IndexingStarted,
    /// Indexing -> Started, whatever the increment's outcome.
    IndexingFinished,
    CheckpointCreated,
    Failure,
    Failed,
    Stopping,
    Stopped,
    AssignmentLost,
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditKind::Started => "started",
            AuditKind::IndexingStarted => "indexing_started",
            AuditKind::IndexingFinished => "indexing_finished",
            AuditKind::CheckpointCreated => "checkpoint_created",
            AuditKind::Failure => "failure",
            AuditKind::Failed => "failed",
            AuditKind::Stopping => "stopping",
            AuditKind::Stopped => "stopped",
            AuditKind::AssignmentLost => "assignment_lost",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub job_id: String,
    pub node_id: u64,
    pub kind: AuditKind,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

/// Receives task lifecycle notifications. Recording never fails the caller.
pub trait AuditSink: Send + Sync + 'static {
    fn record(&self, node_id: u64, job_id: &str, kind: AuditKind, details: &str);
}

/// Emits audit events as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditor;

impl AuditSink for TracingAuditor {
    fn record(&self, node_id: u64, job_id: &str, kind: AuditKind, details: &str) {
        match kind {
            AuditKind::Failed => {
                tracing::error!(target: "transform::audit", node_id, job_id = %job_id, kind = %kind, "{}", details)
            }
            AuditKind::Failure | AuditKind::AssignmentLost => {
                tracing::warn!(target: "transform::audit", node_id, job_id = %job_id, kind = %kind, "{}", details)
            }
            AuditKind::IndexingStarted | AuditKind::IndexingFinished => {
                tracing::debug!(target: "transform::audit", node_id, job_id = %job_id, kind = %kind, "{}", details)
            }
            _ => {
                tracing::info!(target: "transform::audit", node_id, job_id = %job_id, kind = %kind, "{}", details)
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditor {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn events_for(&self, job_id: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.job_id == job_id)
            .collect()
    }

    pub fn count(&self, job_id: &str, kind: AuditKind) -> usize {
        self.events_for(job_id)
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl AuditSink for MemoryAuditor {
    fn record(&self, node_id: u64, job_id: &str, kind: AuditKind, details: &str) {
        let event = AuditEvent {
            job_id: job_id.to_string(),
            node_id,
            kind,
            details: details.to_string(),
            timestamp: Utc::now(),
        };
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
