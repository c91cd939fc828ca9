use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::handlers::{targets, tasks};
use crate::infra::app_state::AppState;

pub fn create_v1_router(_state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/tasks",
            post(tasks::create_task_handler).get(tasks::list_tasks_handler),
        )
        .route("/tasks/{id}", delete(tasks::delete_task_handler))
        .route("/tasks/{id}/start", post(tasks::start_task_handler))
        .route("/tasks/{id}/stop", post(tasks::stop_task_handler))
        .route(
            "/tasks/{id}/targets",
            get(targets::list_targets_handler)
                .post(targets::add_targets_handler),
        )
        .route(
            "/tasks/{id}/targets/delete",
            post(targets::remove_targets_handler),
        )
        .route("/tasks/{id}/results", get(tasks::task_results_handler))
        .route("/tasks/{id}/logs", get(tasks::task_log_handler))
}
