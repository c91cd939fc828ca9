use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tracing::{info, warn};
use vigil_model::{NewFinding, TaskStatus};

use crate::config::ReconcileConfig;
use crate::database::{DurableStore, FastKeys, FastStore};
use crate::reconcile::{Disposition, QueueWorker};

/// Replays findings whose durable write failed during a scan.
pub struct FindingReplayWorker {
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastStore>,
    config: ReconcileConfig,
}

impl fmt::Debug for FindingReplayWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindingReplayWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FindingReplayWorker {
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
}

#[async_trait]
impl QueueWorker for FindingReplayWorker {
    fn name(&self) -> &'static str {
        "finding-replay"
    }

    fn queue(&self) -> &'static str {
        FastKeys::FINDING_REPLAY_QUEUE
    }

    fn dead_letter(&self) -> &'static str {
        FastKeys::FINDING_REPLAY_FAILED
    }

    fn fast(&self) -> &Arc<dyn FastStore> {
        &self.fast
    }

    fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    async fn process(&self, payload: &str) -> Disposition {
        let Ok(finding) = serde_json::from_str::<NewFinding>(payload) else {
            return Disposition::DeadLetter("unparseable finding".into());
        };
        let task_id = finding.task_id.clone();

        if let Err(err) = self.durable.insert_finding(&finding).await {
            // A single-statement insert commits nothing on failure; only a
            // vanished task makes the retry pointless.
            return match self.durable.get_task(&task_id).await {
                Ok(Some(task)) if task.status != TaskStatus::Deleted => {
                    Disposition::Requeue(err.to_string())
                }
                Ok(_) => Disposition::DeadLetter(format!(
                    "task no longer exists: {err}"
                )),
                Err(_) => Disposition::Requeue(err.to_string()),
            };
        }

        let entry = [finding.details.to_string()];
        if let Err(err) =
            self.fast.rpush(&FastKeys::results(&task_id), &entry).await
        {
            warn!(target: "vigil::reconcile", %task_id, error = %err, "failed to mirror replayed finding");
        }
        info!(
            target: "vigil::reconcile",
            %task_id,
            template = %finding.template_id,
            "finding replayed"
        );
        Disposition::Done
    }
}
