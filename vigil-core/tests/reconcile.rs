mod support;

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use vigil_core::{
    database::{FastKeys, FastStore, MemoryFastStore},
    lifecycle::CreateTaskCommand,
    reconcile::{
        Disposition, FindingReplayWorker, QueueWorker, ReconcileSupervisor,
        SyncReport, TargetCompensator, TargetDeleteWorker, TaskCompensator,
        TaskDeleteWorker,
    },
};
use vigil_model::{NewFinding, TaskId, TaskStatus};

use support::{
    Harness, RecordingEngine, StubDiscovery, eventually, fast_reconcile_config,
};

fn harness() -> Result<Harness> {
    Harness::new(StubDiscovery::default(), RecordingEngine::default())
}

async fn create(harness: &Harness, targets: &[&str]) -> Result<TaskId> {
    let created = harness
        .lifecycle
        .create(CreateTaskCommand {
            task_name: "reconcile".into(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        })
        .await?;
    Ok(created.task.id)
}

fn target_delete_worker(harness: &Harness) -> TargetDeleteWorker {
    TargetDeleteWorker::new(
        Arc::new(harness.durable.clone()),
        Arc::new(harness.fast.clone()),
        fast_reconcile_config(),
    )
}

/// Mirror whose list cleanup for one key never completes.
struct StalledCleanup {
    inner: MemoryFastStore,
    stalled: String,
}

impl StalledCleanup {
    async fn stall_on(&self, key: &str) {
        if key == self.stalled {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl FastStore for StalledCleanup {
    async fn rpush(
        &self,
        key: &str,
        values: &[String],
    ) -> vigil_core::Result<()> {
        self.inner.rpush(key, values).await
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> vigil_core::Result<Vec<String>> {
        self.inner.lrange(key, start, stop).await
    }

    async fn lrem(&self, key: &str, value: &str) -> vigil_core::Result<u64> {
        self.stall_on(key).await;
        self.inner.lrem(key, value).await
    }

    async fn llen(&self, key: &str) -> vigil_core::Result<u64> {
        self.inner.llen(key).await
    }

    async fn del(&self, keys: &[String]) -> vigil_core::Result<()> {
        for key in keys {
            self.stall_on(key).await;
        }
        self.inner.del(keys).await
    }

    async fn exists(&self, key: &str) -> vigil_core::Result<bool> {
        self.inner.exists(key).await
    }

    async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> vigil_core::Result<()> {
        self.inner.hset_multiple(key, fields).await
    }

    async fn hgetall(
        &self,
        key: &str,
    ) -> vigil_core::Result<HashMap<String, String>> {
        self.inner.hgetall(key).await
    }

    async fn pop(
        &self,
        queue: &str,
        wait: Duration,
    ) -> vigil_core::Result<Option<String>> {
        self.inner.pop(queue, wait).await
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> vigil_core::Result<bool> {
        self.inner.set_nx_ex(key, value, ttl).await
    }
}

fn task_compensator(harness: &Harness) -> TaskCompensator {
    TaskCompensator::new(
        Arc::new(harness.durable.clone()),
        Arc::new(harness.fast.clone()),
        fast_reconcile_config(),
    )
}

#[tokio::test]
async fn empty_queue_yields_nothing() -> Result<()> {
    let harness = harness()?;
    assert_eq!(target_delete_worker(&harness).run_once().await?, None);
    Ok(())
}

#[tokio::test]
async fn failed_transaction_is_requeued_then_applied() -> Result<()> {
    let harness = harness()?;
    let task_id = create(&harness, &["10.0.0.1:80", "10.0.0.2:80"]).await?;
    harness
        .fast
        .rpush(FastKeys::TARGET_DELETE_QUEUE, &[task_id.to_string()])
        .await?;

    let worker = target_delete_worker(&harness);
    harness.durable.fail_transactions(1);
    let first = worker.run_once().await?;
    assert!(matches!(first, Some(Disposition::Requeue(_))), "{first:?}");
    assert_eq!(harness.durable.raw_target_count(&task_id).await, 2);
    assert_eq!(
        harness.fast.list(FastKeys::TARGET_DELETE_QUEUE).await,
        vec![task_id.to_string()]
    );

    assert_eq!(worker.run_once().await?, Some(Disposition::Done));
    assert_eq!(harness.durable.raw_target_count(&task_id).await, 0);
    assert!(harness.fast.list(&FastKeys::targets(&task_id)).await.is_empty());
    assert!(harness.fast.list(FastKeys::TARGET_DELETE_FAILED).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_statement_is_dead_lettered() -> Result<()> {
    let harness = harness()?;
    let task_id = create(&harness, &["10.0.0.1:80"]).await?;
    harness
        .fast
        .rpush(FastKeys::TARGET_DELETE_QUEUE, &[task_id.to_string()])
        .await?;

    harness.durable.fail_queries(1);
    let outcome = target_delete_worker(&harness).run_once().await?;
    assert!(matches!(outcome, Some(Disposition::DeadLetter(_))));
    assert_eq!(
        harness.fast.list(FastKeys::TARGET_DELETE_FAILED).await,
        vec![task_id.to_string()]
    );
    assert!(harness.fast.list(FastKeys::TARGET_DELETE_QUEUE).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn mirror_cleanup_failure_after_commit_is_dead_lettered() -> Result<()> {
    let harness = harness()?;
    let task_id = create(&harness, &["10.0.0.1:80"]).await?;
    harness
        .fast
        .rpush(FastKeys::TARGET_DELETE_QUEUE, &[task_id.to_string()])
        .await?;

    harness.fast.fail_writes_to(FastKeys::targets(&task_id));
    let outcome = target_delete_worker(&harness).run_once().await?;
    assert!(matches!(outcome, Some(Disposition::DeadLetter(_))));
    // The durable delete stays committed.
    assert_eq!(harness.durable.raw_target_count(&task_id).await, 0);
    assert_eq!(
        harness.fast.list(FastKeys::TARGET_DELETE_FAILED).await,
        vec![task_id.to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn shutdown_mid_item_dead_letters_the_committed_delete() -> Result<()> {
    let harness = harness()?;
    let task_id = create(&harness, &["10.0.0.1:80"]).await?;
    harness
        .fast
        .rpush(FastKeys::TARGET_DELETE_QUEUE, &[task_id.to_string()])
        .await?;

    let worker = TargetDeleteWorker::new(
        Arc::new(harness.durable.clone()),
        Arc::new(StalledCleanup {
            inner: harness.fast.clone(),
            stalled: FastKeys::targets(&task_id),
        }),
        fast_reconcile_config(),
    );
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let running = tokio::spawn(async move { worker.run(token).await });

    let durable = harness.durable.clone();
    let committed_id = task_id.clone();
    eventually(Duration::from_secs(5), move || {
        let durable = durable.clone();
        let task_id = committed_id.clone();
        async move { durable.raw_target_count(&task_id).await == 0 }
    })
    .await
    .context("durable delete never committed")?;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .context("worker did not stop")??;

    assert_eq!(
        harness.fast.list(FastKeys::TARGET_DELETE_FAILED).await,
        vec![task_id.to_string()]
    );
    assert!(harness.fast.list(FastKeys::TARGET_DELETE_QUEUE).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn shutdown_while_idle_stops_the_worker() -> Result<()> {
    let harness = harness()?;
    let worker = target_delete_worker(&harness);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let running = tokio::spawn(async move { worker.run(token).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .context("worker did not stop")??;
    assert!(harness.fast.list(FastKeys::TARGET_DELETE_FAILED).await.is_empty());
    Ok(())
}

fn queued_finding(task_id: &TaskId) -> Result<String> {
    Ok(serde_json::to_string(&NewFinding {
        task_id: task_id.clone(),
        target: "http://10.0.0.1:80".into(),
        template_id: "git-config".into(),
        severity: "low".into(),
        title: "Git Config".into(),
        details: serde_json::json!({ "template-id": "git-config" }),
        raw_ref: Some(FastKeys::results(task_id)),
    })?)
}

fn finding_replay_worker(harness: &Harness) -> FindingReplayWorker {
    FindingReplayWorker::new(
        Arc::new(harness.durable.clone()),
        Arc::new(harness.fast.clone()),
        fast_reconcile_config(),
    )
}

#[tokio::test]
async fn queued_finding_is_replayed_after_a_failed_write() -> Result<()> {
    let harness = harness()?;
    let task_id = create(&harness, &["10.0.0.1:80"]).await?;
    harness
        .fast
        .rpush(FastKeys::FINDING_REPLAY_QUEUE, &[queued_finding(&task_id)?])
        .await?;

    let worker = finding_replay_worker(&harness);
    harness.durable.fail_queries(1);
    let first = worker.run_once().await?;
    assert!(matches!(first, Some(Disposition::Requeue(_))), "{first:?}");
    assert_eq!(harness.fast.llen(FastKeys::FINDING_REPLAY_QUEUE).await?, 1);

    assert_eq!(worker.run_once().await?, Some(Disposition::Done));
    let page = harness.lifecycle.results(&task_id, None, None).await?;
    assert_eq!(page.total, 1);
    assert_eq!(
        harness.fast.list(&FastKeys::results(&task_id)).await.len(),
        1
    );
    assert!(harness.fast.list(FastKeys::FINDING_REPLAY_FAILED).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn finding_for_a_vanished_task_is_dead_lettered() -> Result<()> {
    let harness = harness()?;
    let payload = queued_finding(&TaskId::generate())?;
    harness
        .fast
        .rpush(FastKeys::FINDING_REPLAY_QUEUE, &[payload.clone()])
        .await?;

    let outcome = finding_replay_worker(&harness).run_once().await?;
    assert!(matches!(outcome, Some(Disposition::DeadLetter(_))));
    assert_eq!(
        harness.fast.list(FastKeys::FINDING_REPLAY_FAILED).await,
        vec![payload]
    );
    Ok(())
}

#[tokio::test]
async fn unparseable_payloads_are_dead_lettered() -> Result<()> {
    let harness = harness()?;
    harness
        .fast
        .rpush(FastKeys::TASK_DELETE_QUEUE, &["???".to_string()])
        .await?;
    let worker = TaskDeleteWorker::new(
        Arc::new(harness.durable.clone()),
        Arc::new(harness.fast.clone()),
        fast_reconcile_config(),
    );

    let outcome = worker.run_once().await?;
    assert!(matches!(outcome, Some(Disposition::DeadLetter(_))));
    assert_eq!(
        harness.fast.list(FastKeys::TASK_DELETE_FAILED).await,
        vec!["???".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn purge_of_live_task_is_a_no_op() -> Result<()> {
    let harness = harness()?;
    let task_id = create(&harness, &["10.0.0.1:80"]).await?;
    harness
        .fast
        .rpush(FastKeys::TASK_DELETE_QUEUE, &[task_id.to_string()])
        .await?;
    let worker = TaskDeleteWorker::new(
        Arc::new(harness.durable.clone()),
        Arc::new(harness.fast.clone()),
        fast_reconcile_config(),
    );

    assert_eq!(worker.run_once().await?, Some(Disposition::Done));
    assert!(harness.durable.raw_task(&task_id).await.is_some());
    assert_eq!(harness.fast.list(FastKeys::TASK_LIST).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn create_during_mirror_outage_converges_in_one_cycle() -> Result<()> {
    let harness = harness()?;

    harness.fast.set_fail_writes(true);
    let created = harness
        .lifecycle
        .create(CreateTaskCommand {
            task_name: "outage".into(),
            targets: vec!["10.0.0.1:80".into(), "e.test".into()],
            ..Default::default()
        })
        .await?;
    harness.fast.set_fail_writes(false);

    assert!(created.mirror_lagging);
    assert_eq!(created.task.status, TaskStatus::PendingSync);
    let task_id = created.task.id;
    assert!(harness.fast.list(FastKeys::TASK_LIST).await.is_empty());

    let report = task_compensator(&harness).run_once().await?;
    assert_eq!(
        report,
        SyncReport {
            scanned: 1,
            restored: 1,
            relisted: 1,
            queued_syncs: 1,
            queued_purges: 0,
        }
    );
    assert_eq!(
        harness.fast.list(FastKeys::TASK_LIST).await,
        vec![task_id.to_string()]
    );

    let compensator = TargetCompensator::new(
        Arc::new(harness.durable.clone()),
        Arc::new(harness.fast.clone()),
        fast_reconcile_config(),
    );
    assert_eq!(compensator.run_once().await?, Some(Disposition::Done));
    assert_eq!(
        harness.fast.list(&FastKeys::targets(&task_id)).await,
        vec!["10.0.0.1:80".to_string(), "e.test".to_string()]
    );
    assert_eq!(harness.lifecycle.status(&task_id).await?, TaskStatus::Pending);

    // A converged mirror leaves nothing for the next pass.
    let settled = task_compensator(&harness).run_once().await?;
    assert_eq!(settled.restored + settled.relisted + settled.queued_syncs, 0);
    Ok(())
}

#[tokio::test]
async fn target_sync_dead_letters_while_mirror_stays_down() -> Result<()> {
    let harness = harness()?;
    let task_id = create(&harness, &["10.0.0.1:80"]).await?;
    harness
        .fast
        .rpush(FastKeys::TARGET_SYNC_QUEUE, &[task_id.to_string()])
        .await?;

    harness.fast.fail_writes_to(FastKeys::targets(&task_id));
    let compensator = TargetCompensator::new(
        Arc::new(harness.durable.clone()),
        Arc::new(harness.fast.clone()),
        fast_reconcile_config(),
    );
    let outcome = compensator.run_once().await?;
    assert!(matches!(outcome, Some(Disposition::DeadLetter(_))));
    assert_eq!(
        harness.fast.list(FastKeys::TARGET_SYNC_FAILED).await,
        vec![task_id.to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn stale_soft_deletes_are_requeued_for_purge() -> Result<()> {
    let harness = harness()?;
    let task_id = create(&harness, &["10.0.0.1:80"]).await?;

    harness.fast.fail_writes_to(FastKeys::TASK_DELETE_QUEUE);
    harness.lifecycle.delete(&task_id).await?;
    harness.fast.clear_key_failures();
    assert!(harness.fast.list(FastKeys::TASK_DELETE_QUEUE).await.is_empty());

    // Fresh deletes are left alone.
    let fresh = task_compensator(&harness).run_once().await?;
    assert_eq!(fresh.queued_purges, 0);

    harness
        .durable
        .set_updated_at(&task_id, Utc::now() - chrono::Duration::hours(1))
        .await;
    let stale = task_compensator(&harness).run_once().await?;
    assert_eq!(stale.scanned, 0);
    assert_eq!(stale.queued_purges, 1);
    assert_eq!(
        harness.fast.list(FastKeys::TASK_DELETE_QUEUE).await,
        vec![task_id.to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn supervisor_drains_queues_and_shuts_down() -> Result<()> {
    let harness = harness()?;
    let task_id = create(&harness, &["10.0.0.1:80"]).await?;
    harness.lifecycle.delete(&task_id).await?;

    let shutdown = CancellationToken::new();
    let supervisor = ReconcileSupervisor::spawn(
        Arc::new(harness.durable.clone()),
        Arc::new(harness.fast.clone()),
        fast_reconcile_config(),
        &shutdown,
    );

    let durable = harness.durable.clone();
    let purged_id = task_id.clone();
    eventually(Duration::from_secs(5), move || {
        let durable = durable.clone();
        let task_id = purged_id.clone();
        async move { durable.raw_task(&task_id).await.is_none() }
    })
    .await
    .context("task was never purged")?;

    tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
        .await
        .context("workers did not stop")?;
    assert!(!shutdown.is_cancelled());
    Ok(())
}
