use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::TaskError;
use crate::core::task::{CreateTaskRequest, TaskResult, TaskSummary};

/// The backend task contract, independent of how a call is authenticated.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Create a task (a follow-up is a create carrying `previous_task_id`).
    async fn create_task(&self, request: &CreateTaskRequest) -> Result<String, TaskError>;

    async fn task_status(&self, task_id: &str) -> Result<TaskResult, TaskError>;

    async fn cancel_task(&self, task_id: &str) -> Result<bool, TaskError>;

    async fn list_tasks(&self, limit: Option<u32>) -> Result<Vec<TaskSummary>, TaskError>;

    /// Returns the visibility the backend settled on.
    async fn set_visibility(&self, task_id: &str, is_public: bool) -> Result<bool, TaskError>;

    /// Status of a task shared publicly; sent without a credential.
    async fn public_status(&self, task_id: &str) -> Result<TaskResult, TaskError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskResponse {
    #[serde(alias = "id")]
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityRequest {
    pub is_public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, alias = "isPublic")]
    pub public: bool,
}

/// Listings arrive either wrapped in `{tasks: [...]}` or as a bare array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ListResponse {
    Wrapped { tasks: Vec<TaskSummary> },
    Bare(Vec<TaskSummary>),
}

impl ListResponse {
    pub fn into_tasks(self) -> Vec<TaskSummary> {
        match self {
            ListResponse::Wrapped { tasks } | ListResponse::Bare(tasks) => tasks,
        }
    }
}
