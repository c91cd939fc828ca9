use serde::{Deserialize, Serialize};
use serde_json::Value;
use vigil_model::{Task, TaskId, TaskStatus};

/// Missing fields deserialize empty so validation can name them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateTaskCommand {
    pub task_name: String,
    pub targets: Vec<String>,
    pub config: Option<Value>,
    pub creator: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub task: Task,
    pub targets: Vec<String>,
    /// The durable write succeeded but the mirror did not follow; a repair
    /// item has been queued.
    pub mirror_lagging: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedTargets {
    pub task_id: TaskId,
    pub added: u64,
    pub mirror_lagging: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// False when the task was not running and nothing was written.
    pub changed: bool,
}

/// Queue payload naming specific targets to drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDeleteRequest {
    pub task_id: TaskId,
    pub targets: Vec<String>,
}
