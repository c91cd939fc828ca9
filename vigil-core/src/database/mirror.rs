use std::{fmt, sync::Arc};

use chrono::Utc;
use vigil_model::{DISPLAY_TIME_FORMAT, Task, TaskId, TaskStatus};

use crate::database::{FastKeys, FastStore};
use crate::error::Result;

/// Typed writes against the per-task mirror keys.
///
/// Every method is a plain fast-store round trip; callers decide whether a
/// failure is fatal, logged, or queued for repair.
#[derive(Clone)]
pub struct TaskMirror {
    fast: Arc<dyn FastStore>,
}

impl fmt::Debug for TaskMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskMirror").finish_non_exhaustive()
    }
}

impl TaskMirror {
    pub fn new(fast: Arc<dyn FastStore>) -> Self {
        Self { fast }
    }

    pub fn store(&self) -> &Arc<dyn FastStore> {
        &self.fast
    }

    /// Write the full info hash for `task`.
    pub async fn publish(&self, task: &Task) -> Result<()> {
        let mut fields = vec![
            ("taskId".to_string(), task.id.to_string()),
            ("taskName".to_string(), task.name.clone()),
            ("status".to_string(), task.status.as_str().to_string()),
            (
                "created_at".to_string(),
                task.created_at.format(DISPLAY_TIME_FORMAT).to_string(),
            ),
            (
                "updated_at".to_string(),
                task.updated_at.format(DISPLAY_TIME_FORMAT).to_string(),
            ),
        ];
        if let Some(message) = &task.error_message {
            fields.push(("error_msg".to_string(), message.clone()));
        }
        self.fast
            .hset_multiple(&FastKeys::info(&task.id), &fields)
            .await
    }

    pub async fn set_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let mut fields = vec![
            ("status".to_string(), status.as_str().to_string()),
            (
                "updated_at".to_string(),
                Utc::now().format(DISPLAY_TIME_FORMAT).to_string(),
            ),
        ];
        if let Some(message) = message {
            fields.push(("error_msg".to_string(), message.to_string()));
        }
        self.fast
            .hset_multiple(&FastKeys::info(task_id), &fields)
            .await
    }

    /// Status recorded in the info hash, if any.
    pub async fn status(&self, task_id: &TaskId) -> Result<Option<TaskStatus>> {
        let info = self.fast.hgetall(&FastKeys::info(task_id)).await?;
        Ok(info.get("status").and_then(|s| s.parse().ok()))
    }

    /// Add `task_id` to the global listing unless it is already present.
    pub async fn ensure_listed(&self, task_id: &TaskId) -> Result<bool> {
        let listed = self.fast.lrange(FastKeys::TASK_LIST, 0, -1).await?;
        if listed.iter().any(|id| id == task_id.as_str()) {
            return Ok(false);
        }
        self.fast
            .rpush(FastKeys::TASK_LIST, &[task_id.to_string()])
            .await?;
        Ok(true)
    }

    pub async fn unlist(&self, task_id: &TaskId) -> Result<u64> {
        self.fast.lrem(FastKeys::TASK_LIST, task_id.as_str()).await
    }

    pub async fn push_targets(
        &self,
        task_id: &TaskId,
        targets: &[String],
    ) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        self.fast.rpush(&FastKeys::targets(task_id), targets).await
    }

    pub async fn replace_targets(
        &self,
        task_id: &TaskId,
        targets: &[String],
    ) -> Result<()> {
        self.fast
            .replace_list(&FastKeys::targets(task_id), targets)
            .await
    }

    pub async fn targets(&self, task_id: &TaskId) -> Result<Vec<String>> {
        self.fast.lrange(&FastKeys::targets(task_id), 0, -1).await
    }

    /// Append a line to the live log.
    pub async fn log_line(&self, task_id: &TaskId, line: &str) -> Result<()> {
        let entry = format!(
            "[{}] {line}",
            Utc::now().format(DISPLAY_TIME_FORMAT)
        );
        self.fast.rpush(&FastKeys::log(task_id), &[entry]).await
    }

    /// Drop every per-task key.
    pub async fn clear(&self, task_id: &TaskId) -> Result<()> {
        self.fast.del(&FastKeys::task_keys(task_id)).await
    }
}
