//! PostgreSQL task datastore.
//!
//! One `chrono_tasks` table holds every task. Claiming is a single
//! statement: an ordered, eligibility-filtered sub-select under
//! `FOR UPDATE SKIP LOCKED` feeding an `UPDATE … RETURNING`, so concurrent
//! claimers (including other processes) receive distinct rows or nothing.
//! Idempotency is a unique partial index on `(kind, idempotency_key)` over
//! non-completed rows, with conflict recovery on insert.
//!
//! Old completed rows are cleaned up opportunistically after successful
//! claims: bounded batches, gated by a minimum interval, only when a TTL is
//! configured.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, warn};
use uuid::Uuid;

use chrono_core::{
    ClaimQuery, DeleteTaskKey, DeleteTaskOptions, ScheduleTaskInput, Task, TaskStatus, TaskStore,
    TaskStoreError,
};

/// Configuration for the PostgreSQL datastore.
#[derive(Debug, Clone)]
pub struct PostgresTaskStoreConfig {
    /// Upper bound the store honors before re-offering a claimed task.
    pub claim_stale_timeout: Duration,
    /// Age past which completed tasks are eligible for cleanup. `None`
    /// disables cleanup.
    pub completed_task_ttl: Option<Duration>,
    /// Minimum interval between cleanup sweeps.
    pub cleanup_interval: Duration,
    /// Maximum rows removed per sweep.
    pub cleanup_batch_size: i64,
}

impl Default for PostgresTaskStoreConfig {
    fn default() -> Self {
        Self {
            claim_stale_timeout: Duration::from_secs(10),
            completed_task_ttl: None,
            cleanup_interval: Duration::from_secs(60),
            cleanup_batch_size: 100,
        }
    }
}

/// Status column representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "chrono_task_status", rename_all = "snake_case")]
enum TaskStatusRow {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl From<TaskStatusRow> for TaskStatus {
    fn from(status: TaskStatusRow) -> Self {
        match status {
            TaskStatusRow::Pending => TaskStatus::Pending,
            TaskStatusRow::Claimed => TaskStatus::Claimed,
            TaskStatusRow::Completed => TaskStatus::Completed,
            TaskStatusRow::Failed => TaskStatus::Failed,
        }
    }
}

/// Row model for the `chrono_tasks` table.
#[derive(Debug, FromRow)]
struct TaskRow {
    id: Uuid,
    kind: String,
    status: TaskStatusRow,
    data: serde_json::Value,
    priority: i32,
    idempotency_key: Option<String>,
    group_id: Option<String>,
    original_schedule_date: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_executed_at: Option<DateTime<Utc>>,
    retry_count: i32,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id,
            kind: row.kind,
            status: row.status.into(),
            data: row.data,
            priority: row.priority,
            idempotency_key: row.idempotency_key,
            group_id: row.group_id,
            original_schedule_date: row.original_schedule_date,
            scheduled_at: row.scheduled_at,
            claimed_at: row.claimed_at,
            completed_at: row.completed_at,
            last_executed_at: row.last_executed_at,
            retry_count: row.retry_count,
        }
    }
}

fn backend(error: sqlx::Error) -> TaskStoreError {
    TaskStoreError::Backend(error.into())
}

fn millis(duration: Duration) -> String {
    duration.as_millis().min(i64::MAX as u128).to_string()
}

/// PostgreSQL-backed task datastore.
pub struct PostgresTaskStore {
    pool: PgPool,
    config: PostgresTaskStoreConfig,
    last_cleanup: Mutex<Option<Instant>>,
}

impl PostgresTaskStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool, config: PostgresTaskStoreConfig) -> Self {
        Self {
            pool,
            config,
            last_cleanup: Mutex::new(None),
        }
    }

    /// Connect to the database and wrap the pool.
    pub async fn connect(
        url: &str,
        config: PostgresTaskStoreConfig,
    ) -> Result<Self, TaskStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(backend)?;
        Ok(Self::new(pool, config))
    }

    /// Apply the bundled schema migrations.
    pub async fn run_migrations(&self) -> Result<(), TaskStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TaskStoreError::Backend(e.into()))?;
        Ok(())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fetch a task by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, kind, status, data, priority, idempotency_key, group_id,
                   original_schedule_date, scheduled_at, claimed_at, completed_at,
                   last_executed_at, retry_count
            FROM chrono_tasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(row.map(Task::from))
    }

    /// Find the live (non-completed) task holding an idempotency key.
    async fn find_live_by_idempotency_key(
        &self,
        kind: &str,
        idempotency_key: &str,
    ) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, kind, status, data, priority, idempotency_key, group_id,
                   original_schedule_date, scheduled_at, claimed_at, completed_at,
                   last_executed_at, retry_count
            FROM chrono_tasks
            WHERE kind = $1
              AND idempotency_key = $2
              AND status <> 'completed'
            LIMIT 1
            "#,
        )
        .bind(kind)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(row.map(Task::from))
    }

    /// Remove a bounded batch of completed tasks older than the TTL.
    ///
    /// Gated by the cleanup interval; errors are logged, never propagated,
    /// so a flaky sweep cannot disturb claiming.
    async fn maybe_cleanup_completed(&self) {
        let Some(ttl) = self.config.completed_task_ttl else {
            return;
        };

        {
            let mut last = match self.last_cleanup.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if last.is_some_and(|at| at.elapsed() < self.config.cleanup_interval) {
                return;
            }
            *last = Some(Instant::now());
        }

        let result = sqlx::query(
            r#"
            DELETE FROM chrono_tasks
            WHERE id IN (
                SELECT id
                FROM chrono_tasks
                WHERE status = 'completed'
                  AND completed_at < NOW() - ($1 || ' milliseconds')::INTERVAL
                LIMIT $2
            )
            "#,
        )
        .bind(millis(ttl))
        .bind(self.config.cleanup_batch_size)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() > 0 => {
                debug!(removed = done.rows_affected(), "cleaned up completed tasks");
            }
            Ok(_) => {}
            Err(cleanup_error) => {
                warn!(error = %cleanup_error, "completed-task cleanup failed");
            }
        }
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn schedule(&self, input: ScheduleTaskInput) -> Result<Task, TaskStoreError> {
        if let Some(key) = &input.idempotency_key {
            if let Some(existing) = self.find_live_by_idempotency_key(&input.kind, key).await? {
                debug!(
                    kind = %existing.kind,
                    task_id = %existing.id,
                    idempotency_key = %key,
                    "returning existing task for idempotency key"
                );
                return Ok(existing);
            }
        }

        let scheduled_at = input.scheduled_at.unwrap_or_else(Utc::now);
        let inserted = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO chrono_tasks (
                id, kind, status, data, priority, idempotency_key, group_id,
                original_schedule_date, scheduled_at, retry_count
            )
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8, 0)
            ON CONFLICT (kind, idempotency_key)
                WHERE idempotency_key IS NOT NULL AND status <> 'completed'
                DO NOTHING
            RETURNING id, kind, status, data, priority, idempotency_key, group_id,
                      original_schedule_date, scheduled_at, claimed_at, completed_at,
                      last_executed_at, retry_count
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.kind)
        .bind(&input.data)
        .bind(input.priority)
        .bind(&input.idempotency_key)
        .bind(&input.group_id)
        .bind(scheduled_at)
        .bind(scheduled_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        // Lost a concurrent race on the unique key; the winner's task is the
        // result.
        let key = input
            .idempotency_key
            .as_deref()
            .ok_or_else(|| TaskStoreError::not_found(&input.kind))?;
        self.find_live_by_idempotency_key(&input.kind, key)
            .await?
            .ok_or_else(|| TaskStoreError::not_found(format!("{}/{key}", input.kind)))
    }

    async fn claim(&self, query: ClaimQuery) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            WITH next_task AS (
                SELECT t.id
                FROM chrono_tasks t
                WHERE t.kind = $1
                  AND t.scheduled_at <= NOW()
                  AND (
                        t.status = 'pending'
                        OR (
                            t.status = 'claimed'
                            AND t.claimed_at <= NOW() - ($2 || ' milliseconds')::INTERVAL
                        )
                  )
                  AND (
                        t.group_id IS NULL
                        OR NOT EXISTS (
                            SELECT 1
                            FROM chrono_tasks older
                            WHERE older.group_id = t.group_id
                              AND older.id <> t.id
                              AND (older.original_schedule_date, older.id)
                                  < (t.original_schedule_date, t.id)
                              AND older.status IN ('pending', 'claimed', 'failed')
                        )
                  )
                ORDER BY t.priority DESC, t.scheduled_at ASC, t.id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE chrono_tasks
            SET status = 'claimed',
                claimed_at = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_task)
            RETURNING id, kind, status, data, priority, idempotency_key, group_id,
                      original_schedule_date, scheduled_at, claimed_at, completed_at,
                      last_executed_at, retry_count
            "#,
        )
        .bind(&query.kind)
        .bind(millis(query.claim_stale_timeout))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let claimed = row.map(Task::from);
        if claimed.is_some() {
            self.maybe_cleanup_completed().await;
        }
        Ok(claimed)
    }

    async fn retry(
        &self,
        id: Uuid,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE chrono_tasks
            SET status = 'pending',
                scheduled_at = $2,
                claimed_at = NULL,
                last_executed_at = NOW(),
                retry_count = retry_count + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, kind, status, data, priority, idempotency_key, group_id,
                      original_schedule_date, scheduled_at, claimed_at, completed_at,
                      last_executed_at, retry_count
            "#,
        )
        .bind(id)
        .bind(next_scheduled_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(Task::from)
            .ok_or_else(|| TaskStoreError::not_found(id))
    }

    async fn complete(&self, id: Uuid) -> Result<Task, TaskStoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE chrono_tasks
            SET status = 'completed',
                completed_at = NOW(),
                last_executed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, kind, status, data, priority, idempotency_key, group_id,
                      original_schedule_date, scheduled_at, claimed_at, completed_at,
                      last_executed_at, retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(Task::from)
            .ok_or_else(|| TaskStoreError::not_found(id))
    }

    async fn fail(&self, id: Uuid) -> Result<Task, TaskStoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE chrono_tasks
            SET status = 'failed',
                last_executed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, kind, status, data, priority, idempotency_key, group_id,
                      original_schedule_date, scheduled_at, claimed_at, completed_at,
                      last_executed_at, retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(Task::from)
            .ok_or_else(|| TaskStoreError::not_found(id))
    }

    async fn delete(
        &self,
        key: DeleteTaskKey,
        options: DeleteTaskOptions,
    ) -> Result<Option<Task>, TaskStoreError> {
        let target = match &key {
            DeleteTaskKey::Id(id) => self.get(*id).await?,
            DeleteTaskKey::IdempotencyKey {
                kind,
                idempotency_key,
            } => self
                .find_live_by_idempotency_key(kind, idempotency_key)
                .await?,
        };

        let Some(task) = target else {
            if options.force {
                return Ok(None);
            }
            return Err(TaskStoreError::not_found(key));
        };

        if !options.force && task.status != TaskStatus::Pending {
            return Err(TaskStoreError::NotDeletable {
                id: task.id,
                status: task.status,
            });
        }

        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            DELETE FROM chrono_tasks
            WHERE id = $1
            RETURNING id, kind, status, data, priority, idempotency_key, group_id,
                      original_schedule_date, scheduled_at, claimed_at, completed_at,
                      last_executed_at, retry_count
            "#,
        )
        .bind(task.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(row.map(Task::from))
    }

    fn claim_stale_timeout(&self) -> Duration {
        self.config.claim_stale_timeout
    }
}
