use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Lifecycle state of a task.
///
/// `pending -> running -> {finished, stopped, error}` is the scan path.
/// `pending_sync` marks a task whose mirror write failed and awaits repair;
/// `deleted` is a soft delete waiting for the purge worker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Finished,
    Stopped,
    Error,
    PendingSync,
    Deleted,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Finished,
        TaskStatus::Stopped,
        TaskStatus::Error,
        TaskStatus::PendingSync,
        TaskStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Error => "error",
            TaskStatus::PendingSync => "pending_sync",
            TaskStatus::Deleted => "deleted",
        }
    }

    /// Statuses the pipeline never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished
                | TaskStatus::Stopped
                | TaskStatus::Error
                | TaskStatus::Deleted
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::InvalidStatus(s.to_string()))
    }
}
