//! HTTP surface and process wiring for the Vigil scan orchestrator.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
pub use infra::errors::{AppError, AppResult};
