use anyhow::Context;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::auth::{HttpTokenRefresher, TokenManager};
use crate::cli::HistoryCommands;
use crate::client::{HttpTaskApi, ModeRouter, TaskApi};
use crate::core::session::{TokenSet, User};
use crate::core::task::{
    Attachment, CreateTaskParams, Deliverable, ResearchCategory, TaskRecord, TaskResult,
    TaskStatus,
};
use crate::history::HistoryStore;
use crate::orchestrator::{Orchestrator, OrchestratorEvent};
use crate::timeline::{TimelineBuilder, TimelineItem};
use crate::{Config, Result};

pub struct App {
    pub tokens: TokenManager,
    pub orchestrator: Orchestrator,
    history_sync: JoinHandle<()>,
}

impl App {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let refresher = HttpTokenRefresher::new(config.auth.refresh_url.clone(), config.request_timeout())?;
        let tokens = TokenManager::new(config.session_file(), Arc::new(refresher));
        tokens.initialize().await?;

        let http = HttpTaskApi::new(config.request_timeout())?;
        let router = ModeRouter::new(config, Some(tokens.clone()), http);
        tracing::debug!("Routing task calls in {:?} mode", router.mode());
        let api: Arc<dyn TaskApi> = Arc::new(router);

        let history = HistoryStore::open(config.history_file(), config.history.capacity).await;
        // Pick up writes from other views of the same history file
        let history_sync = history.spawn_sync(config.history_sync_interval());
        let orchestrator = Orchestrator::new(api, history, config.poll_interval());
        Ok(Self {
            tokens,
            orchestrator,
            history_sync,
        })
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.history_sync.abort();
    }
}

pub struct RunParams {
    pub category: ResearchCategory,
    pub subject: String,
    pub urls: Vec<String>,
    pub attachments: Vec<PathBuf>,
    pub email: Option<String>,
    pub instructions: Option<String>,
    pub detach: bool,
}

pub async fn login(
    config: Config,
    user_id: String,
    email: Option<String>,
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
) -> Result<()> {
    let app = App::from_config(&config).await?;
    let user = User {
        id: user_id,
        email,
        name: None,
    };
    let session = app
        .tokens
        .sign_in(
            user,
            TokenSet {
                access_token,
                refresh_token,
                expires_in,
            },
        )
        .await?;
    println!("✅ Signed in as {}", display_user(&session.user));
    println!("   Token expires at {}", session.expires_at.to_rfc3339());
    Ok(())
}

pub async fn logout(config: Config) -> Result<()> {
    let app = App::from_config(&config).await?;
    app.tokens.sign_out().await?;
    println!("Signed out");
    Ok(())
}

pub async fn whoami(config: Config) -> Result<()> {
    let app = App::from_config(&config).await?;
    // A refresh scheduled by startup decides whether the session survives.
    app.tokens.wait_for_background_refresh().await;
    match app.tokens.session().await {
        Some(session) if session.is_authenticated => {
            println!("{}", display_user(&session.user));
            let state = if session.is_expired_at(Utc::now()) {
                "expired"
            } else {
                "valid"
            };
            println!("Token {} until {}", state, session.expires_at.to_rfc3339());
        }
        _ => println!("Not signed in"),
    }
    Ok(())
}

pub async fn run_task(config: Config, params: RunParams) -> Result<()> {
    let app = App::from_config(&config).await?;

    let mut attachments = Vec::with_capacity(params.attachments.len());
    for path in &params.attachments {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read attachment {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        attachments.push(Attachment::from_bytes(filename, &bytes));
    }

    let mut task = CreateTaskParams::new(params.category, params.subject);
    task.urls = params.urls;
    task.attachments = attachments;
    task.notification_email = params.email;
    task.instructions = params.instructions;

    let mut rx = app.orchestrator.subscribe();
    let task_id = app.orchestrator.create_task(task).await?;
    println!("🚀 Created task {}", task_id);
    if params.detach {
        println!("💡 Follow it with: relay watch {}", task_id);
        return Ok(());
    }
    follow(&app.orchestrator, &task_id, &mut rx).await
}

pub async fn watch(config: Config, task_id: String) -> Result<()> {
    let app = App::from_config(&config).await?;
    let record = match app.orchestrator.history().get(&task_id).await {
        Some(record) => record,
        None => TaskRecord {
            title: task_id.clone(),
            id: task_id.clone(),
            category: ResearchCategory::Topic,
            created_at: Utc::now(),
            status: TaskStatus::Queued,
        },
    };

    let mut rx = app.orchestrator.subscribe();
    app.orchestrator.resume(&record).await;
    println!("👀 Watching {} ({})", record.title, record.id);
    follow(&app.orchestrator, &task_id, &mut rx).await
}

pub async fn cancel(config: Config, task_id: String) -> Result<()> {
    let app = App::from_config(&config).await?;
    app.orchestrator.cancel(&task_id).await?;
    app.orchestrator.wait_for_background().await;
    println!("Cancelled {}", task_id);
    Ok(())
}

pub async fn follow_up(
    config: Config,
    task_id: String,
    instruction: String,
    detach: bool,
) -> Result<()> {
    let app = App::from_config(&config).await?;
    let mut rx = app.orchestrator.subscribe();
    let new_id = app
        .orchestrator
        .create_follow_up(&task_id, &instruction)
        .await?;
    println!("🚀 Created follow-up {} (context: {})", new_id, task_id);
    if detach {
        return Ok(());
    }
    follow(&app.orchestrator, &new_id, &mut rx).await
}

pub async fn handle_history_command(config: Config, command: HistoryCommands) -> Result<()> {
    let history = HistoryStore::open(config.history_file(), config.history.capacity).await;
    match command {
        HistoryCommands::List => {
            let records = history.list().await;
            if records.is_empty() {
                println!("No tasks yet");
                return Ok(());
            }
            for record in records {
                println!(
                    "{:<38} {:<10} {:<12} {}  {}",
                    record.id,
                    record.status.as_str(),
                    record.category.as_str(),
                    record.created_at.format("%Y-%m-%d %H:%M"),
                    record.title
                );
            }
        }
        HistoryCommands::Remove { task_id } => {
            if history.remove(&task_id).await? {
                println!("Removed {}", task_id);
            } else {
                anyhow::bail!("Task {} is not in the history", task_id);
            }
        }
        HistoryCommands::Clear => {
            history.clear().await?;
            println!("History cleared");
        }
    }
    Ok(())
}

pub async fn list_remote(config: Config, limit: Option<u32>) -> Result<()> {
    let app = App::from_config(&config).await?;
    let tasks = app.orchestrator.list_remote(limit).await?;
    if tasks.is_empty() {
        println!("No tasks found");
    }
    for task in tasks {
        let created = task
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:<38} {:<10} {:<16} {}",
            task.id,
            task.status.as_str(),
            created,
            task.title.unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn publish(config: Config, task_id: String, private: bool) -> Result<()> {
    let app = App::from_config(&config).await?;
    let is_public = app.orchestrator.set_visibility(&task_id, !private).await?;
    if is_public {
        println!("🌐 Task {} is now public", task_id);
    } else {
        println!("🔒 Task {} is now private", task_id);
    }
    Ok(())
}

pub async fn show_public(config: Config, task_id: String) -> Result<()> {
    let app = App::from_config(&config).await?;
    let result = app.orchestrator.public_status(&task_id).await?;
    let mut timeline = TimelineBuilder::new();
    print_items(&timeline.build(&result.raw_message_log), 0);
    print_summary(&task_id, &result);
    Ok(())
}

pub fn show_config(config: &Config) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

pub fn show_config_path() -> Result<()> {
    match Config::config_file() {
        Some(path) => println!("{}", path.display()),
        None => anyhow::bail!("No configuration directory is available on this system"),
    }
    Ok(())
}

pub fn init_config(config: &Config, force: bool) -> Result<()> {
    if let Some(path) = Config::config_file() {
        if path.exists() && !force {
            anyhow::bail!(
                "Config file {} already exists (use --force to overwrite)",
                path.display()
            );
        }
    }
    let path = config.save()?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Print progress and timeline updates until the task finishes, a prompt
/// condition stops polling, or the user interrupts.
async fn follow(
    orchestrator: &Orchestrator,
    task_id: &str,
    rx: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>,
) -> Result<()> {
    let mut timeline = TimelineBuilder::new();
    let mut printed = 0usize;
    let mut last_percent = None;

    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nStopped watching; the task keeps running. Resume with: relay watch {}", task_id);
                return Ok(());
            }
        };

        match event {
            Ok(OrchestratorEvent::TaskUpdated { task_id: id, result }) if id == task_id => {
                let items = timeline.build(&result.raw_message_log);
                print_items(&items, printed);
                printed = items.len();

                let percent = result.progress_percent();
                if last_percent != Some(percent) {
                    println!("⏳ {} ({}%)", result.status, percent);
                    last_percent = Some(percent);
                }
            }
            Ok(OrchestratorEvent::TaskFinished { task_id: id, .. }) if id == task_id => {
                let snapshot = orchestrator.snapshot().await;
                if let Some(result) = snapshot.result {
                    print_summary(task_id, &result);
                }
                return Ok(());
            }
            Ok(OrchestratorEvent::PollFailed { task_id: id, error }) if id == task_id => {
                eprintln!("⚠️  {}", error);
            }
            Ok(OrchestratorEvent::ReauthRequired { message, .. }) => {
                anyhow::bail!("{}. Sign in again with `relay login`.", message);
            }
            Ok(OrchestratorEvent::PaymentRequired { message, .. }) => {
                anyhow::bail!("{}. Top up your account to continue.", message);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Skipped {} orchestrator events", skipped);
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

fn print_items(items: &[TimelineItem], from: usize) {
    for item in items.iter().skip(from) {
        match item {
            TimelineItem::Reasoning { text, .. } => println!("💭 {}", first_line(text)),
            TimelineItem::UserMessage { text, .. } => println!("👤 {}", first_line(text)),
            TimelineItem::ToolInvocation { call, result, .. } => match result {
                Some(result) if result.is_error => println!("🔧 {} (failed)", call.name),
                Some(result) if !result.output.sources.is_empty() => println!(
                    "🔧 {} ({} sources)",
                    call.name,
                    result.output.sources.len()
                ),
                Some(_) => println!("🔧 {}", call.name),
                None => println!("🔧 {} …", call.name),
            },
        }
    }
}

fn print_summary(task_id: &str, result: &TaskResult) {
    match result.status {
        TaskStatus::Completed => println!("\n✅ Task {} completed", task_id),
        TaskStatus::Failed => println!("\n❌ Task {} failed", task_id),
        TaskStatus::Cancelled => println!("\n🛑 Task {} cancelled", task_id),
        status => println!("\nTask {} is {} ({}%)", task_id, status, result.progress_percent()),
    }
    if let Some(error) = &result.error {
        println!("{}", error);
    }
    if let Some(output) = &result.output {
        println!("\n{}", output);
    }
    if !result.deliverables.is_empty() {
        println!("\n📦 Deliverables:");
        for deliverable in &result.deliverables {
            println!(
                "   {} {} {}",
                deliverable_label(deliverable),
                deliverable.name.as_deref().unwrap_or(""),
                deliverable.url.as_deref().unwrap_or("")
            );
        }
    }
    if !result.sources.is_empty() {
        println!("\n🔗 Sources:");
        for source in &result.sources {
            println!("   {}", source.title.as_deref().unwrap_or(&source.url));
            if source.title.is_some() {
                println!("     {}", source.url);
            }
        }
    }
}

fn deliverable_label(deliverable: &Deliverable) -> String {
    match deliverable.kind() {
        Some(kind) => format!("{} ({})", deliverable.kind, kind.family()),
        None => deliverable.kind.clone(),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

fn display_user(user: &User) -> String {
    match &user.email {
        Some(email) => format!("{} <{}>", user.id, email),
        None => user.id.clone(),
    }
}
