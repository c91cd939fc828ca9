use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vigil_core::lifecycle::CreateTaskCommand;
use vigil_model::{FindingPage, TaskId, TaskLogTail, TaskStatus, TaskSummary};

use super::parse_task_id;
use crate::infra::{app_state::AppState, errors::AppResult};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTaskResponse {
    pub task_id: TaskId,
    pub task_name: String,
    pub targets: Vec<String>,
    pub mirror_lagging: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskSummary>,
}

/// Acknowledges a state change that completes in the background.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAccepted {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

pub async fn create_task_handler(
    State(state): State<AppState>,
    payload: Result<Json<CreateTaskCommand>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(command) = payload?;
    let created = state.lifecycle().create(command).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedTaskResponse {
            task_id: created.task.id,
            task_name: created.task.name,
            targets: created.targets,
            mirror_lagging: created.mirror_lagging,
        }),
    ))
}

pub async fn list_tasks_handler(
    State(state): State<AppState>,
) -> AppResult<Json<TaskListResponse>> {
    let tasks = state.lifecycle().list_tasks().await?;
    Ok(Json(TaskListResponse { tasks }))
}

pub async fn start_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let task_id = parse_task_id(&task_id)?;
    // The execution owns its own completion; dropping the handle detaches it.
    let handle = state.lifecycle().start(&task_id).await?;
    debug!(task_id = %handle.task_id(), "scan submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_id,
            status: TaskStatus::Running,
        }),
    ))
}

pub async fn stop_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let task_id = parse_task_id(&task_id)?;
    let outcome = state.lifecycle().stop(&task_id).await?;
    Ok(Json(outcome))
}

pub async fn delete_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let task_id = parse_task_id(&task_id)?;
    state.lifecycle().delete(&task_id).await?;
    info!(%task_id, "task delete accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_id,
            status: TaskStatus::Deleted,
        }),
    ))
}

pub async fn task_results_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> AppResult<Json<FindingPage>> {
    let task_id = parse_task_id(&task_id)?;
    let page = state
        .lifecycle()
        .results(&task_id, query.page, query.page_size)
        .await?;
    Ok(Json(page))
}

pub async fn task_log_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<TaskLogTail>> {
    let task_id = parse_task_id(&task_id)?;
    Ok(Json(state.lifecycle().task_log(&task_id).await?))
}
