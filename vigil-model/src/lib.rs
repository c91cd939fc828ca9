//! Core data model definitions shared across Vigil crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod error;
pub mod ids;
pub mod listing;
pub mod status;
pub mod task;

pub use error::{ModelError, Result as ModelResult};
pub use ids::TaskId;
pub use listing::{
    DISPLAY_TIME_FORMAT, FindingPage, ListingSource, TargetListing,
    TaskLogTail, TaskSummary,
};
pub use status::TaskStatus;
pub use task::{
    Finding, NewFinding, NewTask, NewTaskLog, Target, Task, TaskLog,
};
