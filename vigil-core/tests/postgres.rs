//! Behaviour of the PostgreSQL store against a real database.
//!
//! Run with `DATABASE_URL` pointing at a scratch server and `--ignored`.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::PgPool;
use vigil_core::database::{DurableStore, PostgresStore, StatusGuard};
use vigil_model::{NewFinding, NewTask, NewTaskLog, TaskId, TaskStatus};

fn new_task(targets: &[&str]) -> NewTask {
    NewTask {
        id: TaskId::generate(),
        name: "pg".into(),
        config: Some(json!({ "rate": 10 })),
        creator: Some("tester".into()),
        targets: targets.iter().map(|t| t.to_string()).collect(),
    }
}

fn finding(task_id: &TaskId, template: &str) -> NewFinding {
    NewFinding {
        task_id: task_id.clone(),
        target: "http://10.0.0.1".into(),
        template_id: template.into(),
        severity: "high".into(),
        title: template.into(),
        details: json!({ "template-id": template }),
        raw_ref: None,
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn connect_builds_a_migratable_pool() -> Result<()> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL")?;
    let store = PostgresStore::connect(&url, 2).await?;
    vigil_core::MIGRATOR.run(store.pool()).await?;
    store.list_tasks().await?;
    assert!(store.pool().size() >= 1);
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn create_and_list_targets(pool: PgPool) -> Result<()> {
    let store = PostgresStore::new(pool);
    let task = store
        .create_task_with_targets(&new_task(&["10.0.0.1:80", "a.test"]))
        .await?;
    assert_eq!(task.status, TaskStatus::Pending);

    let added = store.insert_targets(&task.id, &["b.test".into()]).await?;
    assert_eq!(added, 1);

    let targets: Vec<String> = store
        .list_targets(&task.id)
        .await?
        .into_iter()
        .map(|row| row.target)
        .collect();
    assert_eq!(targets, vec!["10.0.0.1:80", "a.test", "b.test"]);

    let listed = store.list_tasks().await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].config, Some(json!({ "rate": 10 })));
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn transitions_respect_their_guard(pool: PgPool) -> Result<()> {
    let store = PostgresStore::new(pool);
    let task = store.create_task_with_targets(&new_task(&["a.test"])).await?;
    let not_busy =
        || StatusGuard::NotIn(vec![TaskStatus::Running, TaskStatus::Deleted]);

    assert_eq!(
        store
            .transition_status(&task.id, not_busy(), TaskStatus::Running, None)
            .await?,
        1
    );
    assert_eq!(
        store
            .transition_status(&task.id, not_busy(), TaskStatus::Running, None)
            .await?,
        0
    );

    let running = store.get_task(&task.id).await?.context("task row")?;
    assert!(running.started_at.is_some());
    assert!(running.finished_at.is_none());

    store
        .transition_status(
            &task.id,
            StatusGuard::Is(TaskStatus::Running),
            TaskStatus::Error,
            Some("engine exited"),
        )
        .await?;
    let errored = store.get_task(&task.id).await?.context("task row")?;
    assert_eq!(errored.status, TaskStatus::Error);
    assert_eq!(errored.error_message.as_deref(), Some("engine exited"));
    assert!(errored.finished_at.is_some());

    let unknown = TaskId::generate();
    assert_eq!(
        store
            .transition_status(&unknown, not_busy(), TaskStatus::Running, None)
            .await?,
        0
    );
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn findings_are_paged(pool: PgPool) -> Result<()> {
    let store = PostgresStore::new(pool);
    let task = store.create_task_with_targets(&new_task(&["a.test"])).await?;
    for n in 0..5 {
        store
            .insert_finding(&finding(&task.id, &format!("tpl-{n}")))
            .await?;
    }

    let (total, first) = store.list_findings(&task.id, 1, 2).await?;
    assert_eq!(total, 5);
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].template_id, "tpl-0");

    let (_, last) = store.list_findings(&task.id, 3, 2).await?;
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].details["template-id"], "tpl-4");

    let (_, past_end) = store.list_findings(&task.id, 9, 2).await?;
    assert!(past_end.is_empty());
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn soft_delete_then_purge_cascades(pool: PgPool) -> Result<()> {
    let store = PostgresStore::new(pool.clone());
    let task = store
        .create_task_with_targets(&new_task(&["a.test", "b.test"]))
        .await?;
    store.insert_finding(&finding(&task.id, "tpl")).await?;
    store
        .append_log(&NewTaskLog::for_task(&task.id, "create", "created"))
        .await?;

    assert!(!store.purge_task(&task.id).await?);

    store
        .transition_status(
            &task.id,
            StatusGuard::NotIn(vec![TaskStatus::Running, TaskStatus::Deleted]),
            TaskStatus::Deleted,
            None,
        )
        .await?;
    assert!(store.list_tasks().await?.is_empty());
    assert!(
        store
            .list_stale_deleted(Utc::now() - Duration::hours(1))
            .await?
            .is_empty()
    );
    assert_eq!(
        store
            .list_stale_deleted(Utc::now() + Duration::seconds(1))
            .await?,
        vec![task.id.clone()]
    );

    assert!(store.purge_task(&task.id).await?);
    assert!(store.get_task(&task.id).await?.is_none());
    assert!(store.list_targets(&task.id).await?.is_empty());
    let (total, _) = store.list_findings(&task.id, 1, 10).await?;
    assert_eq!(total, 0);

    let orphaned: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM task_logs WHERE task_id IS NULL",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(orphaned, 1);
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn named_target_delete_leaves_the_rest(pool: PgPool) -> Result<()> {
    let store = PostgresStore::new(pool);
    let task = store
        .create_task_with_targets(&new_task(&["a.test", "b.test", "a.test"]))
        .await?;

    let deleted = store
        .delete_targets(&task.id, Some(&["a.test".to_string()]))
        .await?;
    assert_eq!(deleted, 2);
    let remaining = store.list_targets(&task.id).await?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].target, "b.test");

    assert_eq!(store.delete_targets(&task.id, None).await?, 1);
    Ok(())
}
