use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_model::{Task, TaskStatus};

use crate::config::ReconcileConfig;
use crate::database::{DurableStore, FastKeys, FastStore, TaskMirror};
use crate::error::Result;

/// Counts from one convergence pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub scanned: usize,
    pub restored: usize,
    pub relisted: usize,
    pub queued_syncs: usize,
    pub queued_purges: usize,
}

/// Periodic pass that re-creates missing or stale mirror entries from the
/// durable task rows.
pub struct TaskCompensator {
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastStore>,
    mirror: TaskMirror,
    config: ReconcileConfig,
}

impl fmt::Debug for TaskCompensator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCompensator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskCompensator {
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

    pub async fn run_once(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for task in self.durable.list_tasks().await? {
            report.scanned += 1;
            if let Err(err) = self.converge(&task, &mut report).await {
                warn!(target: "vigil::reconcile", task_id = %task.id, error = %err, "task mirror convergence failed");
            }
        }

        let cutoff = i64::try_from(self.config.purge_grace_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale = self.durable.list_stale_deleted(cutoff).await?;
        if !stale.is_empty() {
            let ids: Vec<String> = stale.iter().map(|id| id.to_string()).collect();
            self.fast.rpush(FastKeys::TASK_DELETE_QUEUE, &ids).await?;
            report.queued_purges = ids.len();
        }

        if report != SyncReport::default() {
            info!(
                target: "vigil::reconcile",
                scanned = report.scanned,
                restored = report.restored,
                relisted = report.relisted,
                queued_syncs = report.queued_syncs,
                queued_purges = report.queued_purges,
                "task mirror pass finished"
            );
        }
        Ok(report)
    }

    async fn converge(&self, task: &Task, report: &mut SyncReport) -> Result<()> {
        let info = self.fast.hgetall(&FastKeys::info(&task.id)).await?;
        let stale = info.get("status").map(String::as_str)
            != Some(task.status.as_str());
        if stale {
            self.mirror.publish(task).await?;
            report.restored += 1;
        }
        if self.mirror.ensure_listed(&task.id).await? {
            report.relisted += 1;
        }
        if task.status == TaskStatus::PendingSync {
            self.fast
                .rpush(FastKeys::TARGET_SYNC_QUEUE, &[task.id.to_string()])
                .await?;
            report.queued_syncs += 1;
        }
        Ok(())
    }

    /// Run a pass every `task_sync_interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(target: "vigil::reconcile", worker = "task-compensator", "worker started");
        let period = self
            .config
            .task_sync_interval()
            .max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        warn!(target: "vigil::reconcile", error = %err, "task mirror pass failed");
                    } else {
                        debug!(target: "vigil::reconcile", "task mirror pass complete");
                    }
                }
            }
        }
        info!(target: "vigil::reconcile", worker = "task-compensator", "worker stopped");
    }
}
