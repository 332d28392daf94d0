use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::core::task::ResearchCategory;

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Submit and follow long-running research tasks", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store a session issued by the identity provider (hosted mode)
    Login {
        /// User id
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
        /// Access token lifetime in seconds
        #[arg(long, default_value = "3600")]
        expires_in: i64,
    },
    /// Forget the stored session
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Start a research task and follow it until it finishes
    Run {
        /// company, person, market, competitors or topic
        category: ResearchCategory,
        /// What to research
        subject: String,
        /// Source URL to include (repeatable)
        #[arg(long = "url")]
        urls: Vec<String>,
        /// File to attach (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
        /// Address notified when the task finishes
        #[arg(long)]
        email: Option<String>,
        /// Extra instructions appended to the query
        #[arg(long)]
        instructions: Option<String>,
        /// Return right after the task is created
        #[arg(long)]
        detach: bool,
    },
    /// Follow an existing task until it finishes
    Watch {
        task_id: String,
    },
    /// Cancel a task
    Cancel {
        task_id: String,
    },
    /// Start a follow-up task using a previous task as context
    FollowUp {
        task_id: String,
        instruction: String,
        #[arg(long)]
        detach: bool,
    },
    /// Local task history
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
    /// List tasks known to the backend
    Remote {
        #[arg(short, long)]
        limit: Option<u32>,
    },
    /// Make a task publicly shareable, or private again
    Publish {
        task_id: String,
        #[arg(long)]
        private: bool,
    },
    /// Fetch a shared task without signing in
    Public {
        task_id: String,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommands {
    /// List recent tasks, newest first
    List,
    /// Remove one task from the history
    Remove { task_id: String },
    /// Remove every task from the history
    Clear,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the configuration file location
    Path,
    /// Write the effective configuration to the configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
