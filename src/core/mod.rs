pub mod config;
pub mod error;
pub mod session;
pub mod task;

pub use config::{Config, DeploymentMode};
pub use error::{AuthError, StorageError, TaskError};
pub use session::{Session, TokenSet, User};
pub use task::{
    Attachment, CreateTaskParams, CreateTaskRequest, Deliverable, DeliverableKind,
    DeliverableSpec, ResearchCategory, TaskRecord, TaskResult, TaskStatus, TaskSummary,
};
