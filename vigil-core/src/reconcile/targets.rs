use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tracing::{info, warn};
use vigil_model::{NewTaskLog, TaskId, TaskStatus};

use crate::config::ReconcileConfig;
use crate::database::{
    DurableStore, FastKeys, FastStore, StatusGuard, TaskMirror,
};
use crate::error::Result;
use crate::reconcile::{Disposition, QueueWorker};

/// Rebuilds a task's mirror target list from the durable rows after a
/// failed mirror write, then moves `pending_sync` back to `pending`.
pub struct TargetCompensator {
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastStore>,
    mirror: TaskMirror,
    config: ReconcileConfig,
}

impl fmt::Debug for TargetCompensator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetCompensator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TargetCompensator {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        fast: Arc<dyn FastStore>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            mirror: TaskMirror::new(Arc::clone(&fast)),
            durable,
            fast,
            config,
        }
    }

    async fn restore(&self, task_id: &TaskId, targets: &[String]) -> Result<()> {
        self.mirror.replace_targets(task_id, targets).await?;
        self.mirror.ensure_listed(task_id).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueWorker for TargetCompensator {
    fn name(&self) -> &'static str {
        "target-compensator"
    }

    fn queue(&self) -> &'static str {
        FastKeys::TARGET_SYNC_QUEUE
    }

    fn dead_letter(&self) -> &'static str {
        FastKeys::TARGET_SYNC_FAILED
    }

    fn fast(&self) -> &Arc<dyn FastStore> {
        &self.fast
    }

    fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    async fn process(&self, payload: &str) -> Disposition {
        let Ok(task_id) = TaskId::parse(payload.trim()) else {
            return Disposition::DeadLetter("unparseable task id".into());
        };

        let task = match self.durable.get_task(&task_id).await {
            Ok(Some(task)) if task.status != TaskStatus::Deleted => task,
            Ok(_) => return Disposition::Done,
            Err(err) => return Disposition::Requeue(err.to_string()),
        };
        let targets: Vec<String> =
            match self.durable.list_targets(&task_id).await {
                Ok(rows) => rows.into_iter().map(|row| row.target).collect(),
                Err(err) => return Disposition::Requeue(err.to_string()),
            };

        let attempts = self.config.max_sync_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.restore(&task_id, &targets).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(err) => {
                    warn!(
                        target: "vigil::reconcile",
                        %task_id,
                        attempt,
                        error = %err,
                        "target sync attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.failure_backoff()).await;
                    }
                }
            }
        }
        if let Some(err) = last_error {
            return Disposition::DeadLetter(format!(
                "mirror still failing after {attempts} attempts: {err}"
            ));
        }

        let status = match self
            .durable
            .transition_status(
                &task_id,
                StatusGuard::Is(TaskStatus::PendingSync),
                TaskStatus::Pending,
                None,
            )
            .await
        {
            Ok(0) => task.status,
            Ok(_) => TaskStatus::Pending,
            Err(err) => {
                // Mirror is repaired; the periodic pass retries the flip.
                warn!(target: "vigil::reconcile", %task_id, error = %err, "failed to clear pending_sync");
                task.status
            }
        };
        let mut synced = task;
        synced.status = status;
        if let Err(err) = self.mirror.publish(&synced).await {
            warn!(target: "vigil::reconcile", %task_id, error = %err, "failed to refresh mirror info");
        }

        info!(target: "vigil::reconcile", %task_id, targets = targets.len(), %status, "targets re-synced");
        if let Err(err) = self
            .durable
            .append_log(&NewTaskLog::for_task(
                &task_id,
                "sync_targets",
                format!("mirror rebuilt with {} targets", targets.len()),
            ))
            .await
        {
            warn!(target: "vigil::reconcile", %task_id, error = %err, "failed to append audit log");
        }
        Disposition::Done
    }
}
