//! Lifecycle event taxonomy.
//!
//! Events are facts about what happened, not commands. The scheduler façade
//! emits [`SchedulerEvent`]s on its own bus; each processor emits
//! [`ProcessorEvent`]s on a per-kind bus. Every event is wrapped in a
//! timestamped [`EventEnvelope`](crate::EventEnvelope) by the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{DeleteTaskKey, ScheduleTaskInput, Task};

/// Events emitted by the scheduler façade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    /// A task was persisted by the store.
    TaskScheduled { task: Task },

    /// The store rejected a schedule request.
    TaskScheduleFailed {
        error: String,
        input: ScheduleTaskInput,
    },

    /// A task was removed from the store.
    TaskDeleted { task: Task },

    /// The store rejected a delete request.
    TaskDeleteFailed { error: String, key: DeleteTaskKey },

    /// Start hooks ran and all processors were started.
    Started,

    /// All processors shut down within the exit deadline.
    Stopped,

    /// Processor shutdown exceeded the exit deadline; in-flight runners were
    /// abandoned.
    StopAborted { error: String },

    /// Final event of a shutdown, after stop hooks have run.
    Close,
}

/// Events emitted by a per-kind processor.
///
/// For any single claim, `TaskClaimed` strictly precedes the corresponding
/// settle event (`TaskCompleted`, `TaskRetryScheduled`, `TaskFailed` or
/// `TaskCompletionFailure`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProcessorEvent {
    /// A runner claimed the task from the store.
    TaskClaimed {
        task: Task,
        claimed_at: DateTime<Utc>,
    },

    /// The handler succeeded and the completion was persisted.
    TaskCompleted {
        task: Task,
        completed_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
    },

    /// The handler failed and the task was rescheduled for retry.
    TaskRetryScheduled {
        task: Task,
        error: String,
        retry_scheduled_at: DateTime<Utc>,
    },

    /// The handler failed with no retries remaining; the task is terminal.
    TaskFailed { task: Task, error: String },

    /// The handler succeeded but the completion could not be persisted.
    /// The stale claim will expire and the task may execute again.
    TaskCompletionFailure { task: Task, error: String },

    /// A claim or settle call failed unexpectedly; the runner cools down
    /// and restarts.
    UnknownProcessingError { error: String },
}

impl ProcessorEvent {
    /// The task this event refers to, when it carries one.
    pub fn task(&self) -> Option<&Task> {
        match self {
            ProcessorEvent::TaskClaimed { task, .. }
            | ProcessorEvent::TaskCompleted { task, .. }
            | ProcessorEvent::TaskRetryScheduled { task, .. }
            | ProcessorEvent::TaskFailed { task, .. }
            | ProcessorEvent::TaskCompletionFailure { task, .. } => Some(task),
            ProcessorEvent::UnknownProcessingError { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use uuid::Uuid;

    fn sample_task() -> Task {
        Task {
            id: Uuid::new_v4(),
            kind: "send-email".to_string(),
            status: TaskStatus::Pending,
            data: serde_json::Value::Null,
            priority: 0,
            idempotency_key: None,
            group_id: None,
            original_schedule_date: Utc::now(),
            scheduled_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
            last_executed_at: None,
            retry_count: 0,
        }
    }

    #[test]
    fn scheduler_events_serialize() {
        let event = SchedulerEvent::TaskScheduled {
            task: sample_task(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("TaskScheduled"));
        assert!(json.contains("send-email"));
    }

    #[test]
    fn processor_events_roundtrip() {
        let events = vec![
            ProcessorEvent::TaskClaimed {
                task: sample_task(),
                claimed_at: Utc::now(),
            },
            ProcessorEvent::TaskRetryScheduled {
                task: sample_task(),
                error: "boom".to_string(),
                retry_scheduled_at: Utc::now(),
            },
            ProcessorEvent::TaskFailed {
                task: sample_task(),
                error: "boom".to_string(),
            },
            ProcessorEvent::UnknownProcessingError {
                error: "store unavailable".to_string(),
            },
        ];

        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let _: ProcessorEvent = serde_json::from_str(&json).unwrap();
        }
    }

    #[test]
    fn task_accessor_covers_every_variant() {
        let task = sample_task();
        let claimed = ProcessorEvent::TaskClaimed {
            task: task.clone(),
            claimed_at: Utc::now(),
        };
        assert_eq!(claimed.task().map(|t| t.id), Some(task.id));

        let error = ProcessorEvent::UnknownProcessingError {
            error: "boom".to_string(),
        };
        assert!(error.task().is_none());
    }
}
