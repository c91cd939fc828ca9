use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use vigil_core::lifecycle::AddedTargets;
use vigil_model::{TargetListing, TaskId};

use super::parse_task_id;
use crate::infra::{app_state::AppState, errors::AppResult};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TargetsRequest {
    pub targets: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRemovalAccepted {
    pub task_id: TaskId,
    pub queued: usize,
}

pub async fn list_targets_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<TargetListing>> {
    let task_id = parse_task_id(&task_id)?;
    Ok(Json(state.lifecycle().list_targets(&task_id).await?))
}

pub async fn add_targets_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    payload: Result<Json<TargetsRequest>, JsonRejection>,
) -> AppResult<Json<AddedTargets>> {
    let task_id = parse_task_id(&task_id)?;
    let Json(request) = payload?;
    let added = state
        .lifecycle()
        .add_targets(&task_id, request.targets)
        .await?;
    Ok(Json(added))
}

pub async fn remove_targets_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    payload: Result<Json<TargetsRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let task_id = parse_task_id(&task_id)?;
    let Json(request) = payload?;
    let queued = request.targets.len();
    state
        .lifecycle()
        .remove_targets(&task_id, request.targets)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TargetRemovalAccepted { task_id, queued }),
    ))
}
