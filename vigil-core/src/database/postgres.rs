use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
};
use tracing::info;
use vigil_model::{
    Finding, NewFinding, NewTask, NewTaskLog, Target, Task, TaskId, TaskStatus,
};

use crate::database::ports::{DurableStore, StatusGuard};
use crate::error::{CoreError, Result};

const TASK_COLUMNS: &str = "id, name, status, config, creator, error_message, \
     created_at, updated_at, started_at, finished_at";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .test_before_acquire(true)
            .connect(url)
            .await
            .map_err(|e| CoreError::transaction("connect", e))?;

        info!(max_connections, "Database pool initialized");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_task(row: &PgRow) -> Result<Task> {
        let read = |e: sqlx::Error| CoreError::query("read task row", e);

        let id: String = row.try_get("id").map_err(read)?;
        let status: String = row.try_get("status").map_err(read)?;

        Ok(Task {
            id: TaskId::parse(&id)
                .map_err(|e| CoreError::query("read task id", e))?,
            name: row.try_get("name").map_err(read)?,
            status: status
                .parse::<TaskStatus>()
                .map_err(|e| CoreError::query("read task status", e))?,
            config: row.try_get::<Option<Value>, _>("config").map_err(read)?,
            creator: row.try_get("creator").map_err(read)?,
            error_message: row.try_get("error_message").map_err(read)?,
            created_at: row.try_get("created_at").map_err(read)?,
            updated_at: row.try_get("updated_at").map_err(read)?,
            started_at: row.try_get("started_at").map_err(read)?,
            finished_at: row.try_get("finished_at").map_err(read)?,
        })
    }

    fn map_target(row: &PgRow, task_id: &TaskId) -> Result<Target> {
        let read = |e: sqlx::Error| CoreError::query("read target row", e);
        Ok(Target {
            id: row.try_get("id").map_err(read)?,
            task_id: task_id.clone(),
            target: row.try_get("target").map_err(read)?,
            created_at: row.try_get("created_at").map_err(read)?,
            updated_at: row.try_get("updated_at").map_err(read)?,
        })
    }

    fn map_finding(row: &PgRow, task_id: &TaskId) -> Result<Finding> {
        let read = |e: sqlx::Error| CoreError::query("read finding row", e);
        Ok(Finding {
            id: row.try_get("id").map_err(read)?,
            task_id: task_id.clone(),
            target: row.try_get("target").map_err(read)?,
            template_id: row.try_get("template_id").map_err(read)?,
            severity: row.try_get("severity").map_err(read)?,
            title: row.try_get("title").map_err(read)?,
            details: row.try_get("details").map_err(read)?,
            raw_ref: row.try_get("raw_ref").map_err(read)?,
            created_at: row.try_get("created_at").map_err(read)?,
        })
    }
}

fn status_strings(statuses: &[TaskStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl DurableStore for PostgresStore {
    async fn create_task_with_targets(&self, task: &NewTask) -> Result<Task> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::transaction("begin create task", e))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO tasks (id, name, status, config, creator)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task.id.as_str())
        .bind(&task.name)
        .bind(TaskStatus::Pending.as_str())
        .bind(task.config.as_ref())
        .bind(task.creator.as_deref())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| CoreError::query("insert task", e))?;

        if !task.targets.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO targets (task_id, target)
                SELECT $1, u.target
                FROM UNNEST($2::text[]) WITH ORDINALITY AS u(target, ord)
                ORDER BY u.ord
                "#,
            )
            .bind(task.id.as_str())
            .bind(&task.targets)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoreError::query("insert targets", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| CoreError::transaction("commit create task", e))?;

        Self::map_task(&row)
    }

    async fn insert_targets(
        &self,
        task_id: &TaskId,
        targets: &[String],
    ) -> Result<u64> {
        if targets.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO targets (task_id, target)
            SELECT t.id, u.target
            FROM tasks t,
                 UNNEST($2::text[]) WITH ORDINALITY AS u(target, ord)
            WHERE t.id = $1 AND t.status <> 'deleted'
            ORDER BY u.ord
            "#,
        )
        .bind(task_id.as_str())
        .bind(targets)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::query("insert targets", e))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("task {task_id}")));
        }
        Ok(result.rows_affected())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::query("get task", e))?;

        row.map(|row| Self::map_task(&row)).transpose()
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE status <> 'deleted'
            ORDER BY created_at DESC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::query("list tasks", e))?;

        rows.iter().map(Self::map_task).collect()
    }

    async fn list_stale_deleted(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskId>> {
        let rows = sqlx::query(
            "SELECT id FROM tasks WHERE status = 'deleted' AND updated_at <= $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::query("list stale deletes", e))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| CoreError::query("read task id", e))?;
                TaskId::parse(&id)
                    .map_err(|e| CoreError::query("read task id", e))
            })
            .collect()
    }

    async fn list_targets(&self, task_id: &TaskId) -> Result<Vec<Target>> {
        let rows = sqlx::query(
            r#"
            SELECT id, target, created_at, updated_at
            FROM targets
            WHERE task_id = $1
            ORDER BY id
            "#,
        )
        .bind(task_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::query("list targets", e))?;

        rows.iter()
            .map(|row| Self::map_target(row, task_id))
            .collect()
    }

    async fn transition_status(
        &self,
        task_id: &TaskId,
        guard: StatusGuard,
        next: TaskStatus,
        message: Option<&str>,
    ) -> Result<u64> {
        let (predicate, guard_values) = match &guard {
            StatusGuard::Is(status) => {
                ("status = ANY($4)", status_strings(&[*status]))
            }
            StatusGuard::NotIn(statuses) => {
                ("NOT (status = ANY($4))", status_strings(statuses))
            }
        };

        let sql = format!(
            r#"
            UPDATE tasks
            SET status = $2,
                updated_at = NOW(),
                started_at = CASE WHEN $2 = 'running' THEN NOW() ELSE started_at END,
                finished_at = CASE
                    WHEN $2 = 'running' THEN NULL
                    WHEN $2 IN ('finished', 'stopped', 'error') THEN NOW()
                    ELSE finished_at
                END,
                error_message = CASE
                    WHEN $3::text IS NOT NULL THEN $3::text
                    WHEN $2 = 'running' THEN NULL
                    ELSE error_message
                END
            WHERE id = $1 AND {predicate}
            "#
        );

        let result = sqlx::query(&sql)
            .bind(task_id.as_str())
            .bind(next.as_str())
            .bind(message)
            .bind(&guard_values)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::query("transition status", e))?;

        Ok(result.rows_affected())
    }

    async fn delete_targets(
        &self,
        task_id: &TaskId,
        targets: Option<&[String]>,
    ) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::transaction("begin delete targets", e))?;

        let result = match targets {
            Some(names) => {
                sqlx::query(
                    "DELETE FROM targets WHERE task_id = $1 AND target = ANY($2)",
                )
                .bind(task_id.as_str())
                .bind(names)
                .execute(&mut *tx)
                .await
            }
            None => {
                sqlx::query("DELETE FROM targets WHERE task_id = $1")
                    .bind(task_id.as_str())
                    .execute(&mut *tx)
                    .await
            }
        }
        .map_err(|e| CoreError::query("delete targets", e))?;

        tx.commit()
            .await
            .map_err(|e| CoreError::transaction("commit delete targets", e))?;

        Ok(result.rows_affected())
    }

    async fn purge_task(&self, task_id: &TaskId) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::transaction("begin purge task", e))?;

        let result =
            sqlx::query("DELETE FROM tasks WHERE id = $1 AND status = 'deleted'")
                .bind(task_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| CoreError::query("purge task", e))?;

        tx.commit()
            .await
            .map_err(|e| CoreError::transaction("commit purge task", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_finding(&self, finding: &NewFinding) -> Result<Finding> {
        let row = sqlx::query(
            r#"
            INSERT INTO findings
                (task_id, target, template_id, severity, title, details, raw_ref)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, target, template_id, severity, title, details,
                      raw_ref, created_at
            "#,
        )
        .bind(finding.task_id.as_str())
        .bind(&finding.target)
        .bind(&finding.template_id)
        .bind(&finding.severity)
        .bind(&finding.title)
        .bind(&finding.details)
        .bind(finding.raw_ref.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::query("insert finding", e))?;

        Self::map_finding(&row, &finding.task_id)
    }

    async fn list_findings(
        &self,
        task_id: &TaskId,
        page: u32,
        page_size: u32,
    ) -> Result<(u64, Vec<Finding>)> {
        let total: i64 =
            sqlx::query("SELECT COUNT(*) AS total FROM findings WHERE task_id = $1")
                .bind(task_id.as_str())
                .fetch_one(&self.pool)
                .await
                .and_then(|row| row.try_get("total"))
                .map_err(|e| CoreError::query("count findings", e))?;

        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);
        let rows = sqlx::query(
            r#"
            SELECT id, target, template_id, severity, title, details,
                   raw_ref, created_at
            FROM findings
            WHERE task_id = $1
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(task_id.as_str())
        .bind(i64::from(page_size))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::query("list findings", e))?;

        let items = rows
            .iter()
            .map(|row| Self::map_finding(row, task_id))
            .collect::<Result<Vec<_>>>()?;

        Ok((total.max(0) as u64, items))
    }

    async fn append_log(&self, entry: &NewTaskLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_logs (task_id, action, actor, message)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry.task_id.as_ref().map(TaskId::as_str))
        .bind(&entry.action)
        .bind(entry.actor.as_deref())
        .bind(&entry.message)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::query("append log", e))?;

        Ok(())
    }
}
