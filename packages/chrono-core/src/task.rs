//! Task model for durable background execution.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Lifecycle status of a task.
///
/// `Pending → Claimed → {Completed | Pending (retry) | Failed}`. Completion
/// and failure are terminal; a retry reuses the same task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// The durable unit of work.
///
/// Tasks are created by [`schedule`](crate::TaskStore::schedule), claimed by
/// processors and settled through the store's `complete`/`retry`/`fail`
/// transitions. The store assigns the id and owns every field mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned, globally unique identifier.
    pub id: Uuid,

    /// Tag selecting which processor handles this task.
    pub kind: String,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Opaque payload associated with `kind`.
    pub data: serde_json::Value,

    /// Claim ordering weight; higher values are claimed first.
    pub priority: i32,

    /// Optional deduplication key, unique across non-completed tasks of the
    /// same kind.
    pub idempotency_key: Option<String>,

    /// Optional FIFO group. Tasks sharing a group are claimed in order of
    /// `original_schedule_date`.
    pub group_id: Option<String>,

    /// When the task was first scheduled. Immutable after creation.
    pub original_schedule_date: DateTime<Utc>,

    /// Current eligible execution time; advanced on retry.
    pub scheduled_at: DateTime<Utc>,

    /// Time of the current claim; set on claim, cleared on retry.
    pub claimed_at: Option<DateTime<Utc>>,

    /// Terminal completion timestamp.
    pub completed_at: Option<DateTime<Utc>>,

    /// Most recent execution timestamp (set on retry, complete and fail).
    pub last_executed_at: Option<DateTime<Utc>>,

    /// Number of failed attempts already made; 0 on the first attempt.
    pub retry_count: i32,
}

impl Task {
    /// Deserialize the opaque payload into the handler's typed input.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| anyhow!("failed to deserialize data for task kind {}: {}", self.kind, e))
    }
}

/// Input for scheduling a new task.
///
/// # Example
///
/// ```ignore
/// let input = ScheduleTaskInput::builder()
///     .kind("send-email")
///     .data(serde_json::json!({ "to": "someone@example.com" }))
///     .priority(5)
///     .idempotency_key("welcome:42")
///     .build();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScheduleTaskInput {
    pub kind: String,

    #[builder(default = serde_json::Value::Null)]
    pub data: serde_json::Value,

    /// Higher values are claimed first. Defaults to 0.
    #[builder(default = 0)]
    pub priority: i32,

    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,

    #[builder(default, setter(strip_option))]
    pub group_id: Option<String>,

    /// When the task becomes eligible. Defaults to "now" at the store.
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Key identifying a task for deletion: either its id, or the
/// `(kind, idempotency_key)` pair it was scheduled with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteTaskKey {
    Id(Uuid),
    IdempotencyKey { kind: String, idempotency_key: String },
}

impl From<Uuid> for DeleteTaskKey {
    fn from(id: Uuid) -> Self {
        DeleteTaskKey::Id(id)
    }
}

impl std::fmt::Display for DeleteTaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeleteTaskKey::Id(id) => write!(f, "{id}"),
            DeleteTaskKey::IdempotencyKey {
                kind,
                idempotency_key,
            } => write!(f, "{kind}/{idempotency_key}"),
        }
    }
}
