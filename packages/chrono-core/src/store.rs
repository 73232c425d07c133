//! The store contract: atomic task persistence.
//!
//! The store is the single source of truth for durability and ordering.
//! Processors stay dumb: they poll [`TaskStore::claim`] and settle the
//! outcome through `complete`/`retry`/`fail`; every ordering and atomicity
//! guarantee lives behind this trait.
//!
//! # Implementer Notes
//!
//! - `claim` must be atomic: concurrent claimers on the same kind must
//!   receive distinct tasks or `None`. Use `FOR UPDATE SKIP LOCKED`
//!   (PostgreSQL) or a write lock over the whole selection (in-memory).
//! - A `Claimed` task whose `claimed_at` is older than the stale timeout is
//!   treated as abandoned and re-offered.
//! - `schedule` must serialize concurrent creations that share an
//!   idempotency key (unique constraint plus conflict recovery) and return
//!   the existing task unchanged on a duplicate.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::task::{DeleteTaskKey, ScheduleTaskInput, Task, TaskStatus};

/// Parameters for a single claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimQuery {
    /// Only tasks of this kind are considered.
    pub kind: String,
    /// Age after which a `Claimed` task is considered abandoned and
    /// re-offered.
    pub claim_stale_timeout: Duration,
}

/// Options for [`TaskStore::delete`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteTaskOptions {
    /// Remove the task regardless of status; a miss returns `None` instead
    /// of failing.
    pub force: bool,
}

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    /// The referenced task does not exist (or, for keyed deletes, no live
    /// task matches the key).
    #[error("task not found: {target}")]
    TaskNotFound { target: String },

    /// A non-`Pending` task was deleted without `force`.
    #[error("task {id} is {status:?} and can only be deleted with force")]
    NotDeletable { id: Uuid, status: TaskStatus },

    /// Backend/driver failure; no task state change is assumed to have
    /// occurred.
    #[error("datastore backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl TaskStoreError {
    /// Convenience constructor for [`TaskStoreError::TaskNotFound`].
    pub fn not_found(target: impl std::fmt::Display) -> Self {
        TaskStoreError::TaskNotFound {
            target: target.to_string(),
        }
    }
}

/// Atomic task persistence operations.
///
/// Object-safe so schedulers, processors and plugins can share a single
/// store handle.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Create a `Pending` task.
    ///
    /// If `idempotency_key` is set and a live (non-completed) task with that
    /// key exists for the kind, the existing task is returned unchanged.
    async fn schedule(&self, input: ScheduleTaskInput) -> Result<Task, TaskStoreError>;

    /// Atomically select at most one eligible task and transition it
    /// `Pending→Claimed` (or re-claim a stale `Claimed` task).
    ///
    /// Eligibility: the kind matches, `scheduled_at <= now`, and the task is
    /// `Pending` or stale-`Claimed`. A grouped task is skipped while an
    /// older sibling in the same group is `Pending`, `Claimed` or `Failed`.
    /// Among eligible tasks the order is `priority DESC, scheduled_at ASC`,
    /// then id as a deterministic tie-break.
    async fn claim(&self, query: ClaimQuery) -> Result<Option<Task>, TaskStoreError>;

    /// `Claimed→Pending`: set `scheduled_at` to `next_scheduled_at`, clear
    /// `claimed_at`, stamp `last_executed_at` and increment `retry_count`.
    async fn retry(
        &self,
        id: Uuid,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError>;

    /// Transition to `Completed`; stamps `completed_at` and
    /// `last_executed_at`.
    async fn complete(&self, id: Uuid) -> Result<Task, TaskStoreError>;

    /// Transition to `Failed`; stamps `last_executed_at`.
    async fn fail(&self, id: Uuid) -> Result<Task, TaskStoreError>;

    /// Remove a task.
    ///
    /// Without `force`, only `Pending` tasks may be deleted and a miss is an
    /// error. With `force`, any status may be removed and a miss returns
    /// `None`.
    async fn delete(
        &self,
        key: DeleteTaskKey,
        options: DeleteTaskOptions,
    ) -> Result<Option<Task>, TaskStoreError>;

    /// Upper bound the store honors before re-offering a claimed task.
    ///
    /// Used at registration time to validate handler timeouts.
    fn claim_stale_timeout(&self) -> Duration;
}
