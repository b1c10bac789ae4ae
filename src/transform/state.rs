//! Task lifecycle as a pure transition function.

use crate::transform::model::{TaskState, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// Cluster state shows this node owns the job.
    Assigned,
    /// This node owns a job that already failed under an earlier owner.
    AssignedFailed { reason: String },
    /// A scheduler tick started an increment.
    TickFired,
    /// The increment finished; `checkpoint` is set if one was written.
    Succeeded { checkpoint: Option<u64> },
    /// The increment stopped early without finishing its work.
    Interrupted,
    /// The increment failed. `terminal` is the retry policy's verdict.
    Failed {
        reason: String,
        retry_count: u32,
        terminal: bool,
    },
    StopRequested,
    StopCompleted,
    /// The assignment moved away from this node.
    Unassigned,
}

/// Next status for `event`, or `None` if the event does not apply in
/// `current`.
pub fn next_status(current: TaskStatus, event: &TaskEvent) -> Option<TaskStatus> {
    use TaskStatus::*;

    match (current, event) {
        (_, TaskEvent::Unassigned) => Some(Unassigned),
        (Unassigned, TaskEvent::Assigned) => Some(Started),
        (Unassigned, TaskEvent::AssignedFailed { .. }) => Some(Failed),
        (Started, TaskEvent::TickFired) => Some(Indexing),
        (Indexing, TaskEvent::Succeeded { .. }) | (Indexing, TaskEvent::Interrupted) => {
            Some(Started)
        }
        (Indexing, TaskEvent::Failed { terminal, .. }) => {
            Some(if *terminal { Failed } else { Started })
        }
        // Budget found exhausted before an increment could start.
        (Started, TaskEvent::Failed { terminal: true, .. }) => Some(Failed),
        (Started | Indexing | Failed, TaskEvent::StopRequested) => Some(Stopping),
        // An increment that was already running finishes while the stop is pending.
        (Stopping, TaskEvent::Succeeded { .. })
        | (Stopping, TaskEvent::Interrupted)
        | (Stopping, TaskEvent::Failed { .. }) => Some(Stopping),
        (Stopping, TaskEvent::StopCompleted) => Some(Stopped),
        _ => None,
    }
}

/// A status change applied to a [`TaskState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl TaskState {
    /// Apply `event`, updating the bookkeeping fields alongside the status.
    /// Invalid events leave the state untouched.
    pub fn apply(&mut self, event: TaskEvent) -> Option<Transition> {
        let to = next_status(self.status, &event)?;
        let from = self.status;

        match event {
            TaskEvent::Assigned => {
                self.retry_count = 0;
                self.last_failure = None;
            }
            TaskEvent::AssignedFailed { reason } => {
                self.retry_count = 0;
                self.last_failure = Some(reason);
            }
            TaskEvent::Succeeded { checkpoint } => {
                if checkpoint.is_some() {
                    self.current_checkpoint = checkpoint;
                }
                self.retry_count = 0;
                self.last_failure = None;
            }
            TaskEvent::Failed {
                reason,
                retry_count,
                ..
            } => {
                self.retry_count = retry_count;
                self.last_failure = Some(reason);
            }
            TaskEvent::TickFired
            | TaskEvent::Interrupted
            | TaskEvent::StopRequested
            | TaskEvent::StopCompleted
            | TaskEvent::Unassigned => {}
        }

        self.status = to;
        Some(Transition { from, to })
    }
}
