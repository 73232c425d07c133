//! In-memory task datastore.
//!
//! Suitable for development, testing and single-process deployments. Tasks
//! live in a `HashMap` behind a `tokio::sync::RwLock`; every mutating
//! operation (including the claim scan) takes the write lock, so concurrent
//! claimers are serialized and receive distinct tasks or `None`.
//!
//! Nothing survives a process restart. Production deployments should use a
//! durable datastore behind the same [`TaskStore`] contract.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use chrono_core::{
    ClaimQuery, DeleteTaskKey, DeleteTaskOptions, ScheduleTaskInput, Task, TaskStatus, TaskStore,
    TaskStoreError,
};

/// Configuration for the in-memory datastore.
#[derive(Debug, Clone)]
pub struct MemoryTaskStoreConfig {
    /// Upper bound the store honors before re-offering a claimed task.
    pub claim_stale_timeout: Duration,
}

impl Default for MemoryTaskStoreConfig {
    fn default() -> Self {
        Self {
            claim_stale_timeout: Duration::from_secs(10),
        }
    }
}

/// Transient, process-local task datastore.
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    config: MemoryTaskStoreConfig,
}

impl MemoryTaskStore {
    /// Create a datastore with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryTaskStoreConfig::default())
    }

    /// Create a datastore with custom configuration.
    pub fn with_config(config: MemoryTaskStoreConfig) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Fetch a task by id.
    pub async fn get(&self, id: Uuid) -> Option<Task> {
        self.tasks.read().await.get(&id).cloned()
    }

    /// Number of tasks currently stored, regardless of status.
    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Snapshot of every stored task.
    pub async fn all_tasks(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an older task in the same group blocks this one from claiming.
///
/// `Pending`, `Claimed` and `Failed` siblings all block; ordering is
/// `(original_schedule_date, id)` for determinism on equal timestamps.
fn has_blocking_sibling(tasks: &HashMap<Uuid, Task>, task: &Task) -> bool {
    let Some(group) = task.group_id.as_deref() else {
        return false;
    };
    tasks.values().any(|other| {
        other.id != task.id
            && other.group_id.as_deref() == Some(group)
            && (other.original_schedule_date, other.id) < (task.original_schedule_date, task.id)
            && matches!(
                other.status,
                TaskStatus::Pending | TaskStatus::Claimed | TaskStatus::Failed
            )
    })
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn schedule(&self, input: ScheduleTaskInput) -> Result<Task, TaskStoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().await;

        // Idempotency: a live task with the same key wins; the write lock
        // serializes concurrent creations.
        if let Some(key) = &input.idempotency_key {
            if let Some(existing) = tasks.values().find(|task| {
                task.kind == input.kind
                    && task.status != TaskStatus::Completed
                    && task.idempotency_key.as_deref() == Some(key.as_str())
            }) {
                debug!(
                    kind = %existing.kind,
                    task_id = %existing.id,
                    idempotency_key = %key,
                    "returning existing task for idempotency key"
                );
                return Ok(existing.clone());
            }
        }

        let scheduled_at = input.scheduled_at.unwrap_or(now);
        let task = Task {
            id: Uuid::new_v4(),
            kind: input.kind,
            status: TaskStatus::Pending,
            data: input.data,
            priority: input.priority,
            idempotency_key: input.idempotency_key,
            group_id: input.group_id,
            original_schedule_date: scheduled_at,
            scheduled_at,
            claimed_at: None,
            completed_at: None,
            last_executed_at: None,
            retry_count: 0,
        };
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn claim(&self, query: ClaimQuery) -> Result<Option<Task>, TaskStoreError> {
        let now = Utc::now();
        let stale_before = now
            - chrono::Duration::milliseconds(
                query.claim_stale_timeout.as_millis().min(i64::MAX as u128) as i64,
            );

        let mut tasks = self.tasks.write().await;

        let chosen = {
            let mut candidates: Vec<&Task> = tasks
                .values()
                .filter(|task| {
                    task.kind == query.kind
                        && task.scheduled_at <= now
                        && match task.status {
                            TaskStatus::Pending => true,
                            TaskStatus::Claimed => task
                                .claimed_at
                                .is_some_and(|claimed_at| claimed_at <= stale_before),
                            TaskStatus::Completed | TaskStatus::Failed => false,
                        }
                })
                .filter(|task| !has_blocking_sibling(&tasks, task))
                .collect();

            candidates.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.scheduled_at.cmp(&b.scheduled_at))
                    .then_with(|| a.id.cmp(&b.id))
            });
            candidates.first().map(|task| task.id)
        };

        let Some(id) = chosen else {
            return Ok(None);
        };

        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| TaskStoreError::not_found(id))?;
        task.status = TaskStatus::Claimed;
        task.claimed_at = Some(now);
        Ok(Some(task.clone()))
    }

    async fn retry(
        &self,
        id: Uuid,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| TaskStoreError::not_found(id))?;

        task.status = TaskStatus::Pending;
        task.scheduled_at = next_scheduled_at;
        task.claimed_at = None;
        task.last_executed_at = Some(Utc::now());
        task.retry_count += 1;
        Ok(task.clone())
    }

    async fn complete(&self, id: Uuid) -> Result<Task, TaskStoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| TaskStoreError::not_found(id))?;

        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.last_executed_at = Some(now);
        Ok(task.clone())
    }

    async fn fail(&self, id: Uuid) -> Result<Task, TaskStoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| TaskStoreError::not_found(id))?;

        task.status = TaskStatus::Failed;
        task.last_executed_at = Some(Utc::now());
        Ok(task.clone())
    }

    async fn delete(
        &self,
        key: DeleteTaskKey,
        options: DeleteTaskOptions,
    ) -> Result<Option<Task>, TaskStoreError> {
        let mut tasks = self.tasks.write().await;

        let found = match &key {
            DeleteTaskKey::Id(id) => tasks.get(id).map(|task| task.id),
            DeleteTaskKey::IdempotencyKey {
                kind,
                idempotency_key,
            } => {
                let matches = |task: &&Task| {
                    task.kind == *kind
                        && task.idempotency_key.as_deref() == Some(idempotency_key.as_str())
                };
                // The key is unique among live tasks; forced deletes may
                // also target a completed holdover.
                tasks
                    .values()
                    .filter(matches)
                    .find(|task| task.status != TaskStatus::Completed)
                    .map(|task| task.id)
                    .or_else(|| {
                        options
                            .force
                            .then(|| tasks.values().find(matches).map(|task| task.id))
                            .flatten()
                    })
            }
        };

        let Some(id) = found else {
            if options.force {
                return Ok(None);
            }
            return Err(TaskStoreError::not_found(key));
        };

        if !options.force {
            if let Some(task) = tasks.get(&id) {
                if task.status != TaskStatus::Pending {
                    return Err(TaskStoreError::NotDeletable {
                        id,
                        status: task.status,
                    });
                }
            }
        }

        Ok(tasks.remove(&id))
    }

    fn claim_stale_timeout(&self) -> Duration {
        self.config.claim_stale_timeout
    }
}
