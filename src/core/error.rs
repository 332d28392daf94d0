use serde::Deserialize;
use thiserror::Error;

pub const REAUTH_REQUIRED: &str = "REAUTH_REQUIRED";
pub const PAYMENT_REQUIRED: &str = "PAYMENT_REQUIRED";

/// Failures of task operations, as seen by the orchestrator and its callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Bad local input; raised before any network call.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("authentication failed: {message}")]
    Auth {
        message: String,
        reauth_required: bool,
    },

    #[error("payment required: {0}")]
    Payment(String),

    #[error("{message}")]
    Upstream { status: Option<u16>, message: String },

    #[error("network error: {0}")]
    Transport(String),
}

impl TaskError {
    pub fn reauth(message: impl Into<String>) -> Self {
        TaskError::Auth {
            message: message.into(),
            reauth_required: true,
        }
    }

    /// Stable marker for conditions that should prompt the user.
    pub fn marker(&self) -> Option<&'static str> {
        match self {
            TaskError::Auth {
                reauth_required: true,
                ..
            } => Some(REAUTH_REQUIRED),
            TaskError::Payment(_) => Some(PAYMENT_REQUIRED),
            _ => None,
        }
    }

    pub fn requires_reauth(&self) -> bool {
        self.marker() == Some(REAUTH_REQUIRED)
    }

    /// Prompt conditions halt polling; everything else is shown inline.
    pub fn stops_polling(&self) -> bool {
        self.marker().is_some()
    }

    /// Map a non-success upstream response to the error taxonomy.
    ///
    /// `authenticated` is false for calls that carry no credential (public
    /// status), where a 401/403 means "not allowed" rather than "sign in again".
    pub fn from_upstream(status: u16, body: &str, authenticated: bool) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = parsed
            .message
            .clone()
            .or_else(|| parsed.error.clone())
            .filter(|m| !m.trim().is_empty());
        let code = parsed.code.as_deref().unwrap_or("").to_ascii_lowercase();
        let lowered = message.as_deref().unwrap_or("").to_ascii_lowercase();

        let insufficient_balance = code == PAYMENT_REQUIRED.to_ascii_lowercase()
            || code.contains("insufficient")
            || lowered.contains("insufficient balance")
            || lowered.contains("insufficient credits")
            || lowered.contains("insufficient funds");
        if status == 402 || insufficient_balance {
            return TaskError::Payment(
                message.unwrap_or_else(|| "insufficient balance for this request".to_string()),
            );
        }

        let credential_rejected = code == REAUTH_REQUIRED.to_ascii_lowercase()
            || code == "invalid_token"
            || code == "token_expired"
            || code == "unauthorized";
        if authenticated && (status == 401 || status == 403 || credential_rejected) {
            return TaskError::reauth(
                message.unwrap_or_else(|| "session expired, please sign in again".to_string()),
            );
        }

        TaskError::Upstream {
            status: Some(status),
            message: message.unwrap_or_else(|| format!("request failed with status {}", status)),
        }
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TaskError::Upstream {
                status: e.status().map(|s| s.as_u16()),
                message: format!("unexpected response from backend: {}", e),
            }
        } else {
            TaskError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Failures of the session layer.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth service returned unusable tokens: {0}")]
    InvalidTokens(String),

    #[error("token refresh rejected ({status}): {message}")]
    RefreshRejected { status: u16, message: String },

    #[error("token refresh failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage format error: {0}")]
    Json(#[from] serde_json::Error),
}
