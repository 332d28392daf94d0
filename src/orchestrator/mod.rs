//! Task lifecycle: creation, polling, cancellation and follow-ups.
//!
//! The orchestrator owns the single "active task" reference. Every status
//! fetch is tagged with the active task id and a generation number taken at
//! send time; a response whose tag no longer matches is dropped without
//! touching state.

pub mod events;

use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::client::TaskApi;
use crate::core::error::TaskError;
use crate::core::task::{
    CreateTaskParams, CreateTaskRequest, ResearchCategory, TaskRecord, TaskResult, TaskStatus,
    TaskSummary,
};
use crate::history::HistoryStore;

pub use events::{OrchestratorEvent, PollOutcome, Snapshot};

const EVENT_CAPACITY: usize = 64;
const FOLLOW_UP_TITLE_CHARS: usize = 60;

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn TaskApi>,
    history: HistoryStore,
    poll_interval: Duration,
    state: Mutex<State>,
    events: broadcast::Sender<OrchestratorEvent>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct State {
    active: Option<ActiveTask>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct ActiveTask {
    id: String,
    result: Option<TaskResult>,
    error: Option<TaskError>,
    polling: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PollTag {
    task_id: String,
    generation: u64,
}

impl State {
    fn matches(&self, tag: &PollTag) -> bool {
        self.generation == tag.generation
            && self.active.as_ref().is_some_and(|a| a.id == tag.task_id)
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn active_status(&self) -> Option<TaskStatus> {
        self.active
            .as_ref()
            .and_then(|a| a.result.as_ref())
            .map(|r| r.status)
    }
}

enum Applied {
    Stale,
    Updated {
        result: TaskResult,
        status_changed: bool,
    },
    Failed(TaskError),
}

impl Orchestrator {
    pub fn new(api: Arc<dyn TaskApi>, history: HistoryStore, poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api,
                history,
                poll_interval,
                state: Mutex::new(State::default()),
                events,
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.inner.history
    }

    pub async fn active_task_id(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.id.clone())
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock().await;
        match &state.active {
            Some(active) => Snapshot {
                active_task_id: Some(active.id.clone()),
                result: active.result.clone(),
                error: active.error.clone(),
                polling: active.polling,
            },
            None => Snapshot::default(),
        }
    }

    /// Validate, submit, record in history and start polling.
    pub async fn create_task(&self, params: CreateTaskParams) -> Result<String, TaskError> {
        params.validate()?;
        let request = params.to_request();

        let task_id = self.submit(&request).await?;
        tracing::info!("Created task {} ({})", task_id, params.category);

        self.record(TaskRecord {
            id: task_id.clone(),
            title: params.title(),
            category: params.category,
            created_at: Utc::now(),
            status: TaskStatus::Queued,
        })
        .await;
        self.activate(&task_id).await;
        Ok(task_id)
    }

    /// Start a new task that uses `task_id` as context. The prior record is
    /// left untouched.
    pub async fn create_follow_up(
        &self,
        task_id: &str,
        instruction: &str,
    ) -> Result<String, TaskError> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(TaskError::Validation("a follow-up instruction is required".into()));
        }
        if task_id.trim().is_empty() {
            return Err(TaskError::Validation("a prior task id is required".into()));
        }

        let category = self
            .inner
            .history
            .get(task_id)
            .await
            .map(|r| r.category)
            .unwrap_or(ResearchCategory::Topic);
        let request =
            CreateTaskRequest::follow_up(task_id, instruction, category.default_deliverables());

        let new_id = self.submit(&request).await?;
        tracing::info!("Created follow-up {} for task {}", new_id, task_id);

        let mut title: String = instruction.chars().take(FOLLOW_UP_TITLE_CHARS).collect();
        if instruction.chars().count() > FOLLOW_UP_TITLE_CHARS {
            title.push('…');
        }
        self.record(TaskRecord {
            id: new_id.clone(),
            title: format!("Follow-up: {}", title),
            category,
            created_at: Utc::now(),
            status: TaskStatus::Queued,
        })
        .await;
        self.activate(&new_id).await;
        Ok(new_id)
    }

    /// Make a history entry the active task and poll it again.
    pub async fn resume(&self, record: &TaskRecord) {
        if self.inner.history.get(&record.id).await.is_none() {
            self.record(record.clone()).await;
        }
        tracing::info!("Resuming task {}", record.id);
        self.activate(&record.id).await;
    }

    /// Drop the active task and stop polling.
    pub async fn reset(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.stop_timer();
            state.generation += 1;
            state.active = None;
        }
        tracing::debug!("Orchestrator reset");
        self.emit(OrchestratorEvent::Reset);
    }

    /// Cancel locally right away; the upstream cancel is best effort. A task
    /// already finished locally or in history is left alone.
    pub async fn cancel(&self, task_id: &str) -> Result<(), TaskError> {
        let recorded_terminal = self
            .inner
            .history
            .get(task_id)
            .await
            .is_some_and(|r| r.status.is_terminal());
        {
            let mut state = self.inner.state.lock().await;
            let is_active = state.active.as_ref().is_some_and(|a| a.id == task_id);
            let locally_terminal = is_active && state.active_status().is_some_and(|s| s.is_terminal());
            if recorded_terminal || locally_terminal {
                tracing::debug!("Task {} already finished; nothing to cancel", task_id);
                return Ok(());
            }
            if is_active {
                state.stop_timer();
                state.generation += 1;
                if let Some(active) = state.active.as_mut() {
                    active.polling = false;
                    active.error = None;
                    match active.result.as_mut() {
                        Some(result) => result.status = TaskStatus::Cancelled,
                        None => active.result = Some(TaskResult::with_status(TaskStatus::Cancelled)),
                    }
                }
            }
        }

        tracing::info!("Cancelled task {}", task_id);
        self.mirror_status(task_id, TaskStatus::Cancelled).await;
        self.emit(OrchestratorEvent::TaskFinished {
            task_id: task_id.to_string(),
            status: TaskStatus::Cancelled,
        });

        let api = Arc::clone(&self.inner.api);
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            match api.cancel_task(&id).await {
                Ok(true) => tracing::debug!("Upstream acknowledged cancel of {}", id),
                Ok(false) => tracing::warn!("Upstream declined cancel of {}", id),
                Err(e) => tracing::warn!("Upstream cancel of {} failed: {}", id, e),
            }
        });
        let mut background = self.inner.background.lock().await;
        background.retain(|h| !h.is_finished());
        background.push(handle);
        Ok(())
    }

    /// Wait for best-effort upstream calls (cancels) still in flight.
    pub async fn wait_for_background(&self) {
        let handles: Vec<_> = self.inner.background.lock().await.drain(..).collect();
        futures::future::join_all(handles).await;
    }

    /// Fetch status once. Non-active tasks are never fetched or applied.
    pub async fn poll_once(&self, task_id: &str) -> Result<PollOutcome, TaskError> {
        let tag = {
            let state = self.inner.state.lock().await;
            match &state.active {
                Some(active) if active.id == task_id => PollTag {
                    task_id: task_id.to_string(),
                    generation: state.generation,
                },
                _ => {
                    tracing::debug!("Not polling {}: not the active task", task_id);
                    return Ok(PollOutcome::Stale);
                }
            }
        };
        self.poll_tagged(tag).await
    }

    pub async fn set_visibility(&self, task_id: &str, is_public: bool) -> Result<bool, TaskError> {
        self.inner.api.set_visibility(task_id, is_public).await
    }

    pub async fn list_remote(&self, limit: Option<u32>) -> Result<Vec<TaskSummary>, TaskError> {
        self.inner.api.list_tasks(limit).await
    }

    pub async fn public_status(&self, task_id: &str) -> Result<TaskResult, TaskError> {
        self.inner.api.public_status(task_id).await
    }

    async fn submit(&self, request: &CreateTaskRequest) -> Result<String, TaskError> {
        self.inner.api.create_task(request).await.map_err(|e| {
            self.emit_prompt(None, &e);
            e
        })
    }

    async fn record(&self, record: TaskRecord) {
        let id = record.id.clone();
        if let Err(e) = self.inner.history.save(record).await {
            tracing::error!("Failed to record task {} in history: {}", id, e);
        }
    }

    async fn mirror_status(&self, task_id: &str, status: TaskStatus) {
        if let Err(e) = self.inner.history.update_status(task_id, status).await {
            tracing::error!("Failed to update history for {}: {}", task_id, e);
        }
    }

    /// Replace the active task and install a fresh timer.
    async fn activate(&self, task_id: &str) {
        let tag = {
            let mut state = self.inner.state.lock().await;
            state.stop_timer();
            state.generation += 1;
            state.active = Some(ActiveTask {
                id: task_id.to_string(),
                result: None,
                error: None,
                polling: true,
            });
            let tag = PollTag {
                task_id: task_id.to_string(),
                generation: state.generation,
            };
            state.timer = Some(tokio::spawn(run_timer(
                Arc::downgrade(&self.inner),
                tag.clone(),
                self.inner.poll_interval,
            )));
            tag
        };
        tracing::debug!(
            "Polling task {} every {:?} (generation {})",
            tag.task_id,
            self.inner.poll_interval,
            tag.generation
        );
        self.emit(OrchestratorEvent::TaskStarted {
            task_id: task_id.to_string(),
        });
    }

    async fn poll_tagged(&self, tag: PollTag) -> Result<PollOutcome, TaskError> {
        let fetched = self.inner.api.task_status(&tag.task_id).await;

        let applied = {
            let mut state = self.inner.state.lock().await;
            if !state.matches(&tag) {
                Applied::Stale
            } else {
                let previous = state.active_status();
                match fetched {
                    Ok(result) if previous.is_some_and(|p| !p.can_transition_to(result.status)) => {
                        tracing::debug!(
                            "Ignoring out-of-order status {} for {}",
                            result.status,
                            tag.task_id
                        );
                        Applied::Stale
                    }
                    Ok(result) => {
                        let terminal = result.status.is_terminal();
                        if terminal {
                            state.stop_timer();
                        }
                        if let Some(active) = state.active.as_mut() {
                            active.result = Some(result.clone());
                            active.error = None;
                            active.polling = !terminal;
                        }
                        Applied::Updated {
                            status_changed: previous != Some(result.status),
                            result,
                        }
                    }
                    Err(e) => {
                        if e.stops_polling() {
                            state.stop_timer();
                        }
                        if let Some(active) = state.active.as_mut() {
                            active.error = Some(e.clone());
                            if e.stops_polling() {
                                active.polling = false;
                            }
                        }
                        Applied::Failed(e)
                    }
                }
            }
        };

        match applied {
            Applied::Stale => {
                tracing::debug!(
                    "Discarding stale status for {} (generation {})",
                    tag.task_id,
                    tag.generation
                );
                Ok(PollOutcome::Stale)
            }
            Applied::Updated {
                result,
                status_changed,
            } => {
                let status = result.status;
                if status_changed {
                    self.mirror_status(&tag.task_id, status).await;
                }
                self.emit(OrchestratorEvent::TaskUpdated {
                    task_id: tag.task_id.clone(),
                    result: result.clone(),
                });
                if status.is_terminal() {
                    tracing::info!("Task {} finished: {}", tag.task_id, status);
                    self.emit(OrchestratorEvent::TaskFinished {
                        task_id: tag.task_id.clone(),
                        status,
                    });
                }
                Ok(PollOutcome::Applied(result))
            }
            Applied::Failed(e) => {
                if e.stops_polling() {
                    tracing::warn!("Stopped polling {}: {}", tag.task_id, e);
                    self.emit_prompt(Some(&tag.task_id), &e);
                } else {
                    tracing::warn!("Status poll for {} failed: {}", tag.task_id, e);
                    self.emit(OrchestratorEvent::PollFailed {
                        task_id: tag.task_id.clone(),
                        error: e.clone(),
                    });
                }
                Err(e)
            }
        }
    }

    fn emit_prompt(&self, task_id: Option<&str>, error: &TaskError) {
        let task_id = task_id.map(str::to_string);
        match error {
            e if e.requires_reauth() => self.emit(OrchestratorEvent::ReauthRequired {
                task_id,
                message: e.to_string(),
            }),
            TaskError::Payment(message) => self.emit(OrchestratorEvent::PaymentRequired {
                task_id,
                message: message.clone(),
            }),
            _ => {}
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Tick immediately, then every `interval`, spawning one fetch per tick so a
/// slow response never delays the next one.
async fn run_timer(weak: Weak<Inner>, tag: PollTag, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { break };
        {
            let state = inner.state.lock().await;
            let polling = state.matches(&tag) && state.active.as_ref().is_some_and(|a| a.polling);
            if !polling {
                break;
            }
        }
        let orchestrator = Orchestrator { inner };
        let tag = tag.clone();
        tokio::spawn(async move {
            // Errors are already recorded on the snapshot and broadcast.
            let _ = orchestrator.poll_tagged(tag).await;
        });
    }
}
