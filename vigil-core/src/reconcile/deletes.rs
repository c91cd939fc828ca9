use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tracing::{info, warn};
use vigil_model::{NewTaskLog, TaskId};

use crate::config::ReconcileConfig;
use crate::database::{DurableStore, FastKeys, FastStore, TaskMirror};
use crate::error::{CoreError, Result};
use crate::lifecycle::TargetDeleteRequest;
use crate::reconcile::{Disposition, QueueWorker};

/// Settle a durable delete: transaction failures are retried, anything
/// after or inside a committed statement is dead-lettered.
fn durable_failure(err: CoreError) -> Disposition {
    if err.is_transient() {
        Disposition::Requeue(err.to_string())
    } else {
        Disposition::DeadLetter(err.to_string())
    }
}

/// Parsed target-delete payload.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetDelete {
    All(TaskId),
    Named(TargetDeleteRequest),
}

impl TargetDelete {
    fn parse(payload: &str) -> Option<Self> {
        let payload = payload.trim();
        if payload.starts_with('{') {
            let request: TargetDeleteRequest =
                serde_json::from_str(payload).ok()?;
            return Some(TargetDelete::Named(request));
        }
        TaskId::parse(payload).ok().map(TargetDelete::All)
    }

    fn task_id(&self) -> &TaskId {
        match self {
            TargetDelete::All(task_id) => task_id,
            TargetDelete::Named(request) => &request.task_id,
        }
    }
}

/// Deletes target rows, then their mirror entries.
pub struct TargetDeleteWorker {
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastStore>,
    config: ReconcileConfig,
}

impl fmt::Debug for TargetDeleteWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetDeleteWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TargetDeleteWorker {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        fast: Arc<dyn FastStore>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            durable,
            fast,
            config,
        }
    }

    async fn clean_mirror(&self, request: &TargetDelete) -> Result<()> {
        match request {
            TargetDelete::All(task_id) => {
                self.fast.del(&[FastKeys::targets(task_id)]).await
            }
            TargetDelete::Named(request) => {
                let key = FastKeys::targets(&request.task_id);
                for target in &request.targets {
                    self.fast.lrem(&key, target).await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl QueueWorker for TargetDeleteWorker {
    fn name(&self) -> &'static str {
        "target-delete"
    }

    fn queue(&self) -> &'static str {
        FastKeys::TARGET_DELETE_QUEUE
    }

    fn dead_letter(&self) -> &'static str {
        FastKeys::TARGET_DELETE_FAILED
    }

    fn fast(&self) -> &Arc<dyn FastStore> {
        &self.fast
    }

    fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    async fn process(&self, payload: &str) -> Disposition {
        let Some(request) = TargetDelete::parse(payload) else {
            return Disposition::DeadLetter("unparseable payload".into());
        };
        let task_id = request.task_id().clone();

        let names = match &request {
            TargetDelete::All(_) => None,
            TargetDelete::Named(request) => Some(request.targets.as_slice()),
        };
        let deleted = match self.durable.delete_targets(&task_id, names).await {
            Ok(deleted) => deleted,
            Err(err) => return durable_failure(err),
        };

        if let Err(err) = self.clean_mirror(&request).await {
            return Disposition::DeadLetter(format!(
                "durable delete committed but mirror cleanup failed: {err}"
            ));
        }

        info!(target: "vigil::reconcile", %task_id, deleted, "targets deleted");
        if let Err(err) = self
            .durable
            .append_log(&NewTaskLog::for_task(
                &task_id,
                "delete_targets",
                format!("deleted {deleted} targets"),
            ))
            .await
        {
            warn!(target: "vigil::reconcile", %task_id, error = %err, "failed to append audit log");
        }
        Disposition::Done
    }
}

/// Purges soft-deleted tasks and whatever mirror keys survived.
pub struct TaskDeleteWorker {
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastStore>,
    mirror: TaskMirror,
    config: ReconcileConfig,
}

impl fmt::Debug for TaskDeleteWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDeleteWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskDeleteWorker {
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
}

#[async_trait]
impl QueueWorker for TaskDeleteWorker {
    fn name(&self) -> &'static str {
        "task-delete"
    }

    fn queue(&self) -> &'static str {
        FastKeys::TASK_DELETE_QUEUE
    }

    fn dead_letter(&self) -> &'static str {
        FastKeys::TASK_DELETE_FAILED
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

        let purged = match self.durable.purge_task(&task_id).await {
            Ok(purged) => purged,
            Err(err) => return durable_failure(err),
        };
        if !purged {
            info!(target: "vigil::reconcile", %task_id, "nothing to purge");
            return Disposition::Done;
        }

        let cleaned = async {
            self.mirror.clear(&task_id).await?;
            self.mirror.unlist(&task_id).await?;
            Ok::<_, CoreError>(())
        };
        if let Err(err) = cleaned.await {
            return Disposition::DeadLetter(format!(
                "task purged but mirror cleanup failed: {err}"
            ));
        }

        info!(target: "vigil::reconcile", %task_id, "task purged");
        Disposition::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_id_means_every_target() {
        let id = TaskId::generate();
        assert_eq!(
            TargetDelete::parse(id.as_str()),
            Some(TargetDelete::All(id))
        );
    }

    #[test]
    fn structured_payload_names_targets() {
        let id = TaskId::generate();
        let payload = format!(r#"{{"taskId":"{id}","targets":["a:80"]}}"#);
        let parsed = TargetDelete::parse(&payload).unwrap();
        assert_eq!(
            parsed,
            TargetDelete::Named(TargetDeleteRequest {
                task_id: id,
                targets: vec!["a:80".into()],
            })
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(TargetDelete::parse("not-an-id").is_none());
        assert!(TargetDelete::parse("{\"taskId\":1}").is_none());
    }

    #[test]
    fn only_transaction_failures_are_retried() {
        assert!(matches!(
            durable_failure(CoreError::transaction("commit", "reset")),
            Disposition::Requeue(_)
        ));
        assert!(matches!(
            durable_failure(CoreError::query("delete", "constraint")),
            Disposition::DeadLetter(_)
        ));
    }
}
