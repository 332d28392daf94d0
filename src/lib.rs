// Research Relay Library
// Client-side orchestration for long-running research tasks

pub mod auth;
pub mod cli;
pub mod client;
pub mod core;
pub mod history;
pub mod orchestrator;
pub mod timeline;
pub mod utils;

// Re-export commonly used types
pub use auth::TokenManager;
pub use client::{ModeRouter, TaskApi};
pub use core::{Config, CreateTaskParams, ResearchCategory, TaskError, TaskStatus};
pub use history::HistoryStore;
pub use orchestrator::Orchestrator;

// Error handling
pub use anyhow::{Result, Error};
