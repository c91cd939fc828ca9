//! Payloads handed to callers of the read-side lifecycle operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ids::TaskId, status::TaskStatus, task::Task};

/// Which store answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingSource {
    Durable,
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: String,
    pub task_name: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Timestamp format shared by the mirror hash and listing payloads.
pub const DISPLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl TaskSummary {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.to_string(),
            task_name: task.name.clone(),
            status: task.status.as_str().to_string(),
            created_at: task.created_at.format(DISPLAY_TIME_FORMAT).to_string(),
            updated_at: task.updated_at.format(DISPLAY_TIME_FORMAT).to_string(),
        }
    }

    /// Prefer a mirror-reported status when one exists.
    pub fn with_status(mut self, status: Option<TaskStatus>) -> Self {
        if let Some(status) = status {
            self.status = status.as_str().to_string();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetListing {
    pub task_id: TaskId,
    pub targets: Vec<String>,
    pub source: ListingSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingPage {
    pub task_id: TaskId,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub count: usize,
    pub items: Vec<Value>,
    pub source: ListingSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogTail {
    pub task_id: TaskId,
    pub logs: Vec<String>,
}
