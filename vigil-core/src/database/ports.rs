use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vigil_model::{
    Finding, NewFinding, NewTask, NewTaskLog, Target, Task, TaskId, TaskStatus,
};

use crate::error::Result;

/// Predicate a conditional status update is guarded by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusGuard {
    /// Current status must equal this one.
    Is(TaskStatus),
    /// Current status must be none of these.
    NotIn(Vec<TaskStatus>),
}

impl StatusGuard {
    pub fn admits(&self, current: TaskStatus) -> bool {
        match self {
            StatusGuard::Is(expected) => current == *expected,
            StatusGuard::NotIn(excluded) => !excluded.contains(&current),
        }
    }
}

/// Authoritative relational persistence for tasks and their children.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert the task (`pending`) and all of its targets in one transaction.
    async fn create_task_with_targets(&self, task: &NewTask) -> Result<Task>;

    /// Batch insert targets for an existing, non-deleted task. Returns rows inserted.
    async fn insert_targets(
        &self,
        task_id: &TaskId,
        targets: &[String],
    ) -> Result<u64>;

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>>;

    /// Every task that is not soft-deleted, newest first.
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Soft-deleted tasks last touched at or before `cutoff`.
    async fn list_stale_deleted(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskId>>;

    /// Targets in insertion order.
    async fn list_targets(&self, task_id: &TaskId) -> Result<Vec<Target>>;

    /// Conditionally move a task to `next`. Returns the affected row count;
    /// zero means the guard did not hold or the task does not exist.
    ///
    /// Entering `running` stamps `started_at` and clears `finished_at` and
    /// the error message; entering a terminal status stamps `finished_at`.
    async fn transition_status(
        &self,
        task_id: &TaskId,
        guard: StatusGuard,
        next: TaskStatus,
        message: Option<&str>,
    ) -> Result<u64>;

    /// Delete the named targets, or every target when `targets` is `None`,
    /// inside one transaction. Returns rows deleted.
    async fn delete_targets(
        &self,
        task_id: &TaskId,
        targets: Option<&[String]>,
    ) -> Result<u64>;

    /// Hard delete a soft-deleted task; targets and findings cascade.
    /// Returns `false` when the row is absent or not in `deleted`.
    async fn purge_task(&self, task_id: &TaskId) -> Result<bool>;

    async fn insert_finding(&self, finding: &NewFinding) -> Result<Finding>;

    /// One page of findings (1-based) plus the total count.
    async fn list_findings(
        &self,
        task_id: &TaskId,
        page: u32,
        page_size: u32,
    ) -> Result<(u64, Vec<Finding>)>;

    async fn append_log(&self, entry: &NewTaskLog) -> Result<()>;
}

/// Low-latency list/hash/queue store. Not authoritative; every write path
/// that touches it has a repair path.
#[async_trait]
pub trait FastStore: Send + Sync {
    async fn rpush(&self, key: &str, values: &[String]) -> Result<()>;

    /// Inclusive range with redis index semantics (negative counts from the end).
    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>>;

    /// Remove every occurrence of `value`. Returns how many were removed.
    async fn lrem(&self, key: &str, value: &str) -> Result<u64>;

    async fn llen(&self, key: &str) -> Result<u64>;

    async fn del(&self, keys: &[String]) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<()>;

    /// Empty map when the hash does not exist.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Pop the head of `queue`, waiting at most `wait` for an item.
    async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<String>>;

    /// Set `key` only if absent, expiring after `ttl`. Returns whether it was set.
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Replace the list stored at `key` with `values`.
    async fn replace_list(&self, key: &str, values: &[String]) -> Result<()> {
        self.del(&[key.to_string()]).await?;
        if values.is_empty() {
            return Ok(());
        }
        self.rpush(key, values).await
    }
}
