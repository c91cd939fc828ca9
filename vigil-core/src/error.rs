use thiserror::Error;
use vigil_model::{ModelError, TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Transaction begin/commit failed. Safe to retry.
    #[error("Durable store transaction failed during {op}: {message}")]
    DurableTransaction { op: &'static str, message: String },

    /// A statement failed, possibly after earlier work was committed.
    #[error("Durable store query failed during {op}: {message}")]
    DurableQuery { op: &'static str, message: String },

    #[error("Mirror store unavailable: {0}")]
    MirrorUnavailable(String),

    #[error("Task {task_id} state conflict (status={current}): {message}")]
    StateConflict {
        task_id: TaskId,
        current: TaskStatus,
        message: String,
    },

    #[error("Start already in progress for task {0}")]
    StartInProgress(TaskId),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Scan engine failed: {0}")]
    Engine(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn transaction(op: &'static str, err: impl std::fmt::Display) -> Self {
        CoreError::DurableTransaction {
            op,
            message: err.to_string(),
        }
    }

    pub fn query(op: &'static str, err: impl std::fmt::Display) -> Self {
        CoreError::DurableQuery {
            op,
            message: err.to_string(),
        }
    }

    pub fn mirror(op: &str, err: impl std::fmt::Display) -> Self {
        CoreError::MirrorUnavailable(format!("{op}: {err}"))
    }

    pub fn conflict(
        task_id: &TaskId,
        current: TaskStatus,
        message: impl Into<String>,
    ) -> Self {
        CoreError::StateConflict {
            task_id: task_id.clone(),
            current,
            message: message.into(),
        }
    }

    /// Whether a reconciliation worker may requeue the work item.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::DurableTransaction { .. })
    }

    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            CoreError::DurableTransaction { .. } | CoreError::DurableQuery { .. }
        )
    }
}

impl From<ModelError> for CoreError {
    fn from(err: ModelError) -> Self {
        CoreError::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
