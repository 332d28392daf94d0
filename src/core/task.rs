use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::TaskError;

pub const MAX_ATTACHMENTS: usize = 10;
pub const MAX_SOURCE_URLS: usize = 10;

/// Backends send `null` for empty collections; treat it like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[serde(alias = "pending")]
    Queued,
    #[serde(alias = "running", alias = "in_progress")]
    Processing,
    #[serde(alias = "succeeded", alias = "done")]
    Completed,
    #[serde(alias = "error")]
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses only move forward; a terminal status never changes again.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        !matches!((self, next), (TaskStatus::Processing, TaskStatus::Queued))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchCategory {
    Company,
    Person,
    Market,
    Competitors,
    Topic,
}

impl ResearchCategory {
    pub fn label(&self) -> &'static str {
        match self {
            ResearchCategory::Company => "Company research",
            ResearchCategory::Person => "Person research",
            ResearchCategory::Market => "Market research",
            ResearchCategory::Competitors => "Competitor analysis",
            ResearchCategory::Topic => "Topic research",
        }
    }

    fn preamble(&self) -> &'static str {
        match self {
            ResearchCategory::Company => {
                "Research the following company: business model, products, funding, leadership, and recent news."
            }
            ResearchCategory::Person => {
                "Research the following person: background, career history, public work, and notable affiliations."
            }
            ResearchCategory::Market => {
                "Research the following market: size, growth, key players, trends, and risks."
            }
            ResearchCategory::Competitors => {
                "Identify and compare the main competitors of the following subject across product, pricing, and positioning."
            }
            ResearchCategory::Topic => "Produce a well-sourced research report on the following topic.",
        }
    }

    /// Deliverables requested when the caller does not name any.
    pub fn default_deliverables(&self) -> Vec<DeliverableSpec> {
        use DeliverableKind::*;
        let spec = |kind, description: &str| DeliverableSpec {
            kind,
            description: description.to_string(),
        };
        match self {
            ResearchCategory::Company => vec![
                spec(Csv, "Company data sheet with key facts and figures"),
                spec(Pptx, "Company overview slide deck"),
            ],
            ResearchCategory::Person => vec![
                spec(Docx, "Profile document"),
                spec(Pdf, "Background report"),
            ],
            ResearchCategory::Market => vec![
                spec(Xlsx, "Market sizing spreadsheet"),
                spec(Pptx, "Market overview slide deck"),
                spec(Pdf, "Market report"),
            ],
            ResearchCategory::Competitors => vec![
                spec(Csv, "Competitor comparison sheet"),
                spec(Pptx, "Competitive landscape slide deck"),
            ],
            ResearchCategory::Topic => vec![spec(Pdf, "Research report")],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResearchCategory::Company => "company",
            ResearchCategory::Person => "person",
            ResearchCategory::Market => "market",
            ResearchCategory::Competitors => "competitors",
            ResearchCategory::Topic => "topic",
        }
    }
}

impl FromStr for ResearchCategory {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "company" => Ok(ResearchCategory::Company),
            "person" | "people" => Ok(ResearchCategory::Person),
            "market" => Ok(ResearchCategory::Market),
            "competitors" | "competitor" => Ok(ResearchCategory::Competitors),
            "topic" | "general" => Ok(ResearchCategory::Topic),
            other => Err(TaskError::Validation(format!(
                "unknown research category '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ResearchCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverableKind {
    Csv,
    Xlsx,
    Pptx,
    Docx,
    Pdf,
    Md,
}

impl DeliverableKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_lowercase().as_str() {
            "csv" => Some(DeliverableKind::Csv),
            "xlsx" | "xls" => Some(DeliverableKind::Xlsx),
            "pptx" | "ppt" => Some(DeliverableKind::Pptx),
            "docx" | "doc" => Some(DeliverableKind::Docx),
            "pdf" => Some(DeliverableKind::Pdf),
            "md" | "markdown" => Some(DeliverableKind::Md),
            _ => None,
        }
    }

    /// Human name of the artifact family.
    pub fn family(&self) -> &'static str {
        match self {
            DeliverableKind::Csv | DeliverableKind::Xlsx => "spreadsheet",
            DeliverableKind::Pptx => "slide deck",
            DeliverableKind::Docx | DeliverableKind::Md => "document",
            DeliverableKind::Pdf => "report",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverableSpec {
    #[serde(rename = "type")]
    pub kind: DeliverableKind,
    pub description: String,
}

/// A file sent inline with a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub media_type: String,
    pub data: String,
}

impl Attachment {
    pub fn from_bytes(filename: impl Into<String>, bytes: &[u8]) -> Self {
        let filename = filename.into();
        let media_type = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            filename,
            media_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateTaskParams {
    pub category: ResearchCategory,
    pub subject: String,
    pub instructions: Option<String>,
    /// Overrides the category defaults when set.
    pub deliverables: Option<Vec<DeliverableSpec>>,
    pub attachments: Vec<Attachment>,
    pub urls: Vec<String>,
    pub notification_email: Option<String>,
}

impl CreateTaskParams {
    pub fn new(category: ResearchCategory, subject: impl Into<String>) -> Self {
        Self {
            category,
            subject: subject.into(),
            instructions: None,
            deliverables: None,
            attachments: Vec::new(),
            urls: Vec::new(),
            notification_email: None,
        }
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if self.subject.trim().is_empty() {
            return Err(TaskError::Validation("a research subject is required".into()));
        }
        if self.attachments.len() > MAX_ATTACHMENTS {
            return Err(TaskError::Validation(format!(
                "at most {} attachments are allowed, got {}",
                MAX_ATTACHMENTS,
                self.attachments.len()
            )));
        }
        if self.urls.len() > MAX_SOURCE_URLS {
            return Err(TaskError::Validation(format!(
                "at most {} source URLs are allowed, got {}",
                MAX_SOURCE_URLS,
                self.urls.len()
            )));
        }
        for raw in &self.urls {
            match url::Url::parse(raw.trim()) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                _ => {
                    return Err(TaskError::Validation(format!(
                        "'{}' is not a valid http(s) URL",
                        raw
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn title(&self) -> String {
        format!("{}: {}", self.category.label(), self.subject.trim())
    }

    pub fn to_request(&self) -> CreateTaskRequest {
        let mut query = format!("{}\n\n{}", self.category.preamble(), self.subject.trim());
        if let Some(instructions) = self.instructions.as_deref().map(str::trim) {
            if !instructions.is_empty() {
                query.push_str("\n\nAdditional instructions: ");
                query.push_str(instructions);
            }
        }

        CreateTaskRequest {
            query,
            deliverables: self
                .deliverables
                .clone()
                .unwrap_or_else(|| self.category.default_deliverables()),
            attachments: self.attachments.clone(),
            urls: self.urls.iter().map(|u| u.trim().to_string()).collect(),
            email: self.notification_email.clone(),
            previous_task_id: None,
        }
    }
}

/// Wire body of a create call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub query: String,
    pub deliverables: Vec<DeliverableSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_task_id: Option<String>,
}

impl CreateTaskRequest {
    pub fn follow_up(previous_task_id: &str, instruction: &str, deliverables: Vec<DeliverableSpec>) -> Self {
        Self {
            query: instruction.trim().to_string(),
            deliverables,
            attachments: Vec::new(),
            urls: Vec::new(),
            email: None,
            previous_task_id: Some(previous_task_id.to_string()),
        }
    }
}

/// History entry for a task. Keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub category: ResearchCategory,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default, deserialize_with = "null_as_default")]
    pub current: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverable {
    #[serde(rename = "type", alias = "format")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Deliverable {
    pub fn kind(&self) -> Option<DeliverableKind> {
        DeliverableKind::from_extension(&self.kind)
    }
}

/// Status payload of a task as last reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sources: Vec<Source>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub deliverables: Vec<Deliverable>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub progress: Progress,
    #[serde(rename = "messages", default, deserialize_with = "null_as_default")]
    pub raw_message_log: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status,
            output: None,
            sources: Vec::new(),
            deliverables: Vec::new(),
            progress: Progress::default(),
            raw_message_log: Vec::new(),
            error: None,
        }
    }

    pub fn progress_percent(&self) -> u8 {
        if self.status == TaskStatus::Completed {
            return 100;
        }
        if self.progress.total == 0 {
            return 0;
        }
        let pct = (u64::from(self.progress.current) * 100) / u64::from(self.progress.total);
        pct.min(100) as u8
    }
}

/// One row of the backend's task listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    #[serde(alias = "taskId")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "public")]
    pub is_public: bool,
}
