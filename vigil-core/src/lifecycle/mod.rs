//! Task and target lifecycle.
//!
//! Every write goes to the durable store first. The mirror is updated
//! afterwards and any mirror failure either surfaces as a partial success
//! or leaves a repair item on a compensation queue.

mod commands;
mod reads;

use std::{fmt, sync::Arc};

use tracing::{debug, info, warn};
use vigil_model::{NewTask, NewTaskLog, Task, TaskId, TaskStatus};

use crate::config::LifecycleConfig;
use crate::database::{
    DurableStore, FastKeys, FastStore, StatusGuard, TaskMirror,
};
use crate::error::{CoreError, Result};
use crate::scan::{CancellationRegistry, ScanHandle, ScanRunner};

pub use commands::{
    AddedTargets, CreateTaskCommand, CreatedTask, StopOutcome,
    TargetDeleteRequest,
};

#[derive(Clone)]
pub struct LifecycleManager {
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastStore>,
    mirror: TaskMirror,
    registry: CancellationRegistry,
    runner: ScanRunner,
    config: LifecycleConfig,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("registry", &self.registry)
            .field("runner", &self.runner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        fast: Arc<dyn FastStore>,
        registry: CancellationRegistry,
        runner: ScanRunner,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            mirror: TaskMirror::new(Arc::clone(&fast)),
            durable,
            fast,
            registry,
            runner,
            config,
        }
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &ScanRunner {
        &self.runner
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub async fn create(
        &self,
        command: CreateTaskCommand,
    ) -> Result<CreatedTask> {
        let name = command.task_name.trim();
        if name.is_empty() {
            return Err(CoreError::Validation("missing taskName".into()));
        }
        let targets = clean_targets(command.targets);
        if targets.is_empty() {
            return Err(CoreError::Validation("missing targets".into()));
        }

        let new_task = NewTask {
            id: TaskId::generate(),
            name: name.to_string(),
            config: command.config,
            creator: command.creator.clone(),
            targets,
        };
        let mut task = self.durable.create_task_with_targets(&new_task).await?;
        info!(
            target: "vigil::lifecycle",
            task_id = %task.id,
            targets = new_task.targets.len(),
            "task created"
        );

        let mirrored = self.mirror_new_task(&task, &new_task.targets).await;
        let mirror_lagging = match mirrored {
            Ok(()) => false,
            Err(err) => {
                warn!(target: "vigil::lifecycle", task_id = %task.id, error = %err, "mirror write failed after create");
                if self.mark_pending_sync(&task.id).await {
                    task.status = TaskStatus::PendingSync;
                }
                true
            }
        };

        self.audit(
            NewTaskLog::for_task(
                &task.id,
                "create",
                format!("created with {} targets", new_task.targets.len()),
            )
            .with_actor(command.creator),
        )
        .await;

        Ok(CreatedTask {
            task,
            targets: new_task.targets,
            mirror_lagging,
        })
    }

    async fn mirror_new_task(
        &self,
        task: &Task,
        targets: &[String],
    ) -> Result<()> {
        self.mirror.publish(task).await?;
        self.mirror.push_targets(&task.id, targets).await?;
        self.mirror.ensure_listed(&task.id).await?;
        Ok(())
    }

    pub async fn add_targets(
        &self,
        task_id: &TaskId,
        targets: Vec<String>,
    ) -> Result<AddedTargets> {
        let targets = clean_targets(targets);
        if targets.is_empty() {
            return Err(CoreError::Validation("invalid targets".into()));
        }

        let added = self.durable.insert_targets(task_id, &targets).await?;

        let mirror_lagging =
            match self.mirror.push_targets(task_id, &targets).await {
                Ok(()) => false,
                Err(err) => {
                    warn!(target: "vigil::lifecycle", %task_id, error = %err, "mirror target push failed");
                    self.mark_pending_sync(task_id).await;
                    true
                }
            };

        info!(target: "vigil::lifecycle", %task_id, added, mirror_lagging, "targets added");
        self.audit(NewTaskLog::for_task(
            task_id,
            "add_targets",
            format!("added {added} targets"),
        ))
        .await;

        Ok(AddedTargets {
            task_id: task_id.clone(),
            added,
            mirror_lagging,
        })
    }

    /// Queue the named targets for removal. The delete worker removes the
    /// durable rows first and the mirror entries after commit.
    pub async fn remove_targets(
        &self,
        task_id: &TaskId,
        targets: Vec<String>,
    ) -> Result<()> {
        let targets = clean_targets(targets);
        if targets.is_empty() {
            return Err(CoreError::Validation("invalid targets".into()));
        }
        self.require_live_task(task_id).await?;

        let payload = serde_json::to_string(&TargetDeleteRequest {
            task_id: task_id.clone(),
            targets,
        })?;
        self.fast
            .rpush(FastKeys::TARGET_DELETE_QUEUE, &[payload])
            .await?;

        debug!(target: "vigil::lifecycle", %task_id, "target delete queued");
        self.audit(NewTaskLog::for_task(
            task_id,
            "remove_targets",
            "target removal queued",
        ))
        .await;
        Ok(())
    }

    /// Transition to `running` and launch the scan.
    ///
    /// Returns as soon as the execution is submitted.
    pub async fn start(&self, task_id: &TaskId) -> Result<ScanHandle> {
        let targets = self.start_targets(task_id).await?;
        if targets.is_empty() {
            return Err(CoreError::NotFound(format!(
                "task {task_id} not found or has no targets"
            )));
        }

        let lock_key = FastKeys::start_lock(task_id);
        match self
            .fast
            .set_nx_ex(&lock_key, "1", self.config.start_lock_ttl())
            .await
        {
            Ok(true) => {}
            Ok(false) => return Err(CoreError::StartInProgress(task_id.clone())),
            Err(err) => {
                // The conditional update below still guards the transition.
                warn!(target: "vigil::lifecycle", %task_id, error = %err, "start lock unavailable");
            }
        }

        let result = self.claim_and_launch(task_id, targets).await;
        if let Err(err) = self.fast.del(&[lock_key]).await {
            debug!(target: "vigil::lifecycle", %task_id, error = %err, "start lock release failed");
        }
        result
    }

    async fn claim_and_launch(
        &self,
        task_id: &TaskId,
        targets: Vec<String>,
    ) -> Result<ScanHandle> {
        let guard = self.registry.register(task_id)?;

        let claimed = self
            .durable
            .transition_status(
                task_id,
                StatusGuard::NotIn(vec![TaskStatus::Running, TaskStatus::Deleted]),
                TaskStatus::Running,
                None,
            )
            .await?;
        if claimed == 0 {
            drop(guard);
            return Err(self.explain_rejected_start(task_id).await);
        }

        if let Err(err) = self
            .mirror
            .set_status(task_id, TaskStatus::Running, None)
            .await
        {
            warn!(target: "vigil::lifecycle", %task_id, error = %err, "failed to mirror running status");
        }

        info!(target: "vigil::lifecycle", %task_id, targets = targets.len(), "task started");
        self.audit(NewTaskLog::for_task(
            task_id,
            "start",
            format!("scan launched on {} targets", targets.len()),
        ))
        .await;

        Ok(self.runner.submit(task_id.clone(), targets, guard))
    }

    async fn explain_rejected_start(&self, task_id: &TaskId) -> CoreError {
        match self.durable.get_task(task_id).await {
            Ok(None) => CoreError::NotFound(format!("task {task_id}")),
            Ok(Some(task)) if task.status == TaskStatus::Running => {
                CoreError::conflict(task_id, task.status, "task already running")
            }
            Ok(Some(task)) if task.status == TaskStatus::Deleted => {
                CoreError::NotFound(format!("task {task_id}"))
            }
            Ok(Some(task)) => CoreError::conflict(
                task_id,
                task.status,
                "task cannot be started",
            ),
            Err(err) => err,
        }
    }

    /// Mirror list first, durable rows when the mirror is empty or down.
    /// A `pending_sync` task always reads durable rows; its mirror list is
    /// stale until the compensator rebuilds it.
    async fn start_targets(&self, task_id: &TaskId) -> Result<Vec<String>> {
        let mirror_stale = matches!(
            self.durable.get_task(task_id).await?,
            Some(task) if task.status == TaskStatus::PendingSync
        );
        if !mirror_stale {
            match self.mirror.targets(task_id).await {
                Ok(targets) if !targets.is_empty() => return Ok(targets),
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "vigil::lifecycle", %task_id, error = %err, "mirror targets unavailable, reading durable rows");
                }
            }
        }
        let rows = self.durable.list_targets(task_id).await?;
        Ok(rows.into_iter().map(|row| row.target).collect())
    }

    /// Idempotent: a task that is not running is reported as-is.
    pub async fn stop(&self, task_id: &TaskId) -> Result<StopOutcome> {
        let task = self
            .durable
            .get_task(task_id)
            .await?
            .filter(|task| task.status != TaskStatus::Deleted)
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;

        if task.status != TaskStatus::Running {
            if let Err(err) =
                self.mirror.set_status(task_id, task.status, None).await
            {
                debug!(target: "vigil::lifecycle", %task_id, error = %err, "failed to refresh mirror status");
            }
            return Ok(StopOutcome {
                task_id: task_id.clone(),
                status: task.status,
                changed: false,
            });
        }

        let stopped = self
            .durable
            .transition_status(
                task_id,
                StatusGuard::Is(TaskStatus::Running),
                TaskStatus::Stopped,
                None,
            )
            .await?;
        if stopped == 0 {
            let current = self
                .durable
                .get_task(task_id)
                .await?
                .map(|task| task.status)
                .unwrap_or(TaskStatus::Deleted);
            return Err(CoreError::conflict(
                task_id,
                current,
                "task state changed concurrently, retry",
            ));
        }

        if let Err(err) = self
            .mirror
            .set_status(task_id, TaskStatus::Stopped, None)
            .await
        {
            warn!(target: "vigil::lifecycle", %task_id, error = %err, "failed to mirror stopped status");
        }
        let cancelled = self.registry.cancel(task_id);

        info!(target: "vigil::lifecycle", %task_id, cancelled, "task stopped");
        self.audit(NewTaskLog::for_task(task_id, "stop", "task stopped"))
            .await;

        Ok(StopOutcome {
            task_id: task_id.clone(),
            status: TaskStatus::Stopped,
            changed: true,
        })
    }

    /// Soft delete now, physical delete later through the task-delete queue.
    pub async fn delete(&self, task_id: &TaskId) -> Result<()> {
        let task = self
            .durable
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
        match task.status {
            TaskStatus::Running => {
                return Err(CoreError::conflict(
                    task_id,
                    task.status,
                    "task is running, stop it first",
                ));
            }
            TaskStatus::Deleted => return Ok(()),
            _ => {}
        }

        let marked = self
            .durable
            .transition_status(
                task_id,
                StatusGuard::NotIn(vec![TaskStatus::Running, TaskStatus::Deleted]),
                TaskStatus::Deleted,
                None,
            )
            .await?;
        if marked == 0 {
            let current = self
                .durable
                .get_task(task_id)
                .await?
                .map(|task| task.status)
                .unwrap_or(TaskStatus::Deleted);
            if current == TaskStatus::Deleted {
                return Ok(());
            }
            return Err(CoreError::conflict(
                task_id,
                current,
                "task state changed concurrently, retry",
            ));
        }

        self.registry.cancel(task_id);

        if let Err(err) = self.mirror.clear(task_id).await {
            warn!(target: "vigil::lifecycle", %task_id, error = %err, "failed to clear mirror keys");
        }
        if let Err(err) = self.mirror.unlist(task_id).await {
            warn!(target: "vigil::lifecycle", %task_id, error = %err, "failed to unlist task");
        }
        if let Err(err) = self
            .fast
            .rpush(FastKeys::TASK_DELETE_QUEUE, &[task_id.to_string()])
            .await
        {
            // The task compensator re-queues stale soft deletes.
            warn!(target: "vigil::lifecycle", %task_id, error = %err, "failed to queue physical delete");
        }

        info!(target: "vigil::lifecycle", %task_id, "task deleted");
        self.audit(NewTaskLog::for_task(
            task_id,
            "delete",
            "task soft-deleted, purge queued",
        ))
        .await;
        Ok(())
    }

    /// Flip to `pending_sync` and queue a target sync. Returns whether the
    /// durable status changed.
    async fn mark_pending_sync(&self, task_id: &TaskId) -> bool {
        let flipped = match self
            .durable
            .transition_status(
                task_id,
                StatusGuard::NotIn(vec![TaskStatus::Running, TaskStatus::Deleted]),
                TaskStatus::PendingSync,
                None,
            )
            .await
        {
            Ok(rows) => rows > 0,
            Err(err) => {
                warn!(target: "vigil::lifecycle", %task_id, error = %err, "failed to mark task pending_sync");
                false
            }
        };
        if let Err(err) = self
            .fast
            .rpush(FastKeys::TARGET_SYNC_QUEUE, &[task_id.to_string()])
            .await
        {
            // Picked up by the periodic task compensator instead.
            warn!(target: "vigil::lifecycle", %task_id, error = %err, "failed to queue target sync");
        }
        flipped
    }

    async fn require_live_task(&self, task_id: &TaskId) -> Result<Task> {
        self.durable
            .get_task(task_id)
            .await?
            .filter(|task| task.status != TaskStatus::Deleted)
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))
    }

    async fn audit(&self, entry: NewTaskLog) {
        if let Err(err) = self.durable.append_log(&entry).await {
            warn!(
                target: "vigil::lifecycle",
                action = %entry.action,
                error = %err,
                "failed to append audit log"
            );
        }
    }
}

fn clean_targets(targets: Vec<String>) -> Vec<String> {
    targets
        .into_iter()
        .map(|target| target.trim().to_string())
        .filter(|target| !target.is_empty())
        .collect()
}
