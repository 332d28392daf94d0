use crate::core::error::TaskError;
use crate::core::task::{TaskResult, TaskStatus};

/// Broadcast to every view watching the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    TaskStarted {
        task_id: String,
    },
    TaskUpdated {
        task_id: String,
        result: TaskResult,
    },
    TaskFinished {
        task_id: String,
        status: TaskStatus,
    },
    /// A poll failed with an error that is shown inline; polling continues.
    PollFailed {
        task_id: String,
        error: TaskError,
    },
    ReauthRequired {
        task_id: Option<String>,
        message: String,
    },
    PaymentRequired {
        task_id: Option<String>,
        message: String,
    },
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Applied(TaskResult),
    /// The response no longer belonged to the active task and was dropped.
    Stale,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub active_task_id: Option<String>,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
    pub polling: bool,
}

impl Snapshot {
    pub fn status(&self) -> Option<TaskStatus> {
        self.result.as_ref().map(|r| r.status)
    }

    pub fn progress_percent(&self) -> u8 {
        self.result.as_ref().map_or(0, TaskResult::progress_percent)
    }
}
