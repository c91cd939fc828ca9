//! HTTP request handlers organized by resource

pub mod targets;
pub mod tasks;

use axum::Json;
use serde_json::{Value, json};

use crate::infra::errors::AppResult;
use vigil_model::TaskId;

pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Path segments arrive as plain strings so a malformed id maps to 400
/// rather than axum's default rejection.
pub(crate) fn parse_task_id(raw: &str) -> AppResult<TaskId> {
    Ok(TaskId::parse(raw)?)
}
