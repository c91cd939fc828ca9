use serde_json::Value;
use tracing::warn;
use vigil_model::{
    FindingPage, ListingSource, TargetListing, TaskId, TaskLogTail,
    TaskStatus, TaskSummary,
};

use crate::database::FastKeys;
use crate::error::{CoreError, Result};
use crate::lifecycle::LifecycleManager;

impl LifecycleManager {
    /// Non-deleted tasks, newest first, with the mirror's status when it has one.
    pub async fn list_tasks(&self) -> Result<Vec<TaskSummary>> {
        let tasks = match self.durable.list_tasks().await {
            Ok(tasks) => tasks,
            Err(err) if err.is_durable() => {
                warn!(target: "vigil::lifecycle", error = %err, "durable task listing failed, using mirror");
                return self.list_tasks_from_mirror().await;
            }
            Err(err) => return Err(err),
        };

        let mut summaries = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let mirrored = self.mirror.status(&task.id).await.ok().flatten();
            summaries.push(TaskSummary::from_task(task).with_status(mirrored));
        }
        Ok(summaries)
    }

    async fn list_tasks_from_mirror(&self) -> Result<Vec<TaskSummary>> {
        let ids = self.fast.lrange(FastKeys::TASK_LIST, 0, -1).await?;
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids.iter().rev() {
            let Ok(task_id) = TaskId::parse(id) else {
                continue;
            };
            let mut info = self.fast.hgetall(&FastKeys::info(&task_id)).await?;
            if info.is_empty() {
                continue;
            }
            let mut field = |name: &str| info.remove(name).unwrap_or_default();
            summaries.push(TaskSummary {
                task_id: task_id.to_string(),
                task_name: field("taskName"),
                status: field("status"),
                created_at: field("created_at"),
                updated_at: field("updated_at"),
            });
        }
        Ok(summaries)
    }

    pub async fn list_targets(&self, task_id: &TaskId) -> Result<TargetListing> {
        let durable = async {
            self.require_live_task(task_id).await?;
            self.durable.list_targets(task_id).await
        };
        match durable.await {
            Ok(rows) => Ok(TargetListing {
                task_id: task_id.clone(),
                targets: rows.into_iter().map(|row| row.target).collect(),
                source: ListingSource::Durable,
            }),
            Err(err) if err.is_durable() => {
                warn!(target: "vigil::lifecycle", %task_id, error = %err, "durable target listing failed, using mirror");
                Ok(TargetListing {
                    task_id: task_id.clone(),
                    targets: self.mirror.targets(task_id).await?,
                    source: ListingSource::Mirror,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// One page of findings. Missing or non-positive paging values fall back
    /// to the defaults; the page size is capped.
    pub async fn results(
        &self,
        task_id: &TaskId,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> Result<FindingPage> {
        let page = page
            .filter(|page| *page > 0)
            .and_then(|page| u32::try_from(page).ok())
            .unwrap_or(1);
        let page_size = page_size
            .filter(|size| *size > 0)
            .map(|size| size.min(i64::from(self.config.max_page_size)) as u32)
            .unwrap_or(self.config.default_page_size);

        let durable = async {
            self.require_live_task(task_id).await?;
            self.durable.list_findings(task_id, page, page_size).await
        };
        match durable.await {
            Ok((total, findings)) => Ok(FindingPage {
                task_id: task_id.clone(),
                page,
                page_size,
                total,
                count: findings.len(),
                items: findings.into_iter().map(|f| f.details).collect(),
                source: ListingSource::Durable,
            }),
            Err(err) if err.is_durable() => {
                warn!(target: "vigil::lifecycle", %task_id, error = %err, "durable findings unavailable, using mirror");
                self.results_from_mirror(task_id, page, page_size).await
            }
            Err(err) => Err(err),
        }
    }

    async fn results_from_mirror(
        &self,
        task_id: &TaskId,
        page: u32,
        page_size: u32,
    ) -> Result<FindingPage> {
        let key = FastKeys::results(task_id);
        let total = self.fast.llen(&key).await?;
        let start = u64::from(page - 1) * u64::from(page_size);
        let items: Vec<Value> = if start >= total {
            Vec::new()
        } else {
            let stop = start + u64::from(page_size) - 1;
            self.fast
                .lrange(&key, start as isize, stop as isize)
                .await?
                .iter()
                .filter_map(|raw| serde_json::from_str(raw).ok())
                .collect()
        };
        Ok(FindingPage {
            task_id: task_id.clone(),
            page,
            page_size,
            total,
            count: items.len(),
            items,
            source: ListingSource::Mirror,
        })
    }

    /// Trailing entries of the live log.
    pub async fn task_log(&self, task_id: &TaskId) -> Result<TaskLogTail> {
        let tail = self.config.log_tail.max(1) as isize;
        let logs = self
            .fast
            .lrange(&FastKeys::log(task_id), -tail, -1)
            .await?;
        Ok(TaskLogTail {
            task_id: task_id.clone(),
            logs,
        })
    }

    /// Current durable status, for callers that need to poll.
    pub async fn status(&self, task_id: &TaskId) -> Result<TaskStatus> {
        self.durable
            .get_task(task_id)
            .await?
            .map(|task| task.status)
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))
    }
}
