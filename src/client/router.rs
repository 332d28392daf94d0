//! Per-operation choice between the direct-credential path and the
//! token-authenticated proxy path.

use async_trait::async_trait;
use std::fmt;

use super::api::TaskApi;
use super::http::{Credential, HttpTaskApi, Route};
use crate::auth::TokenManager;
use crate::core::config::{Config, DeploymentMode};
use crate::core::error::TaskError;
use crate::core::task::{CreateTaskRequest, TaskResult, TaskSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    FollowUp,
    Status,
    List,
    Cancel,
    ToggleVisibility,
    PublicStatus,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::FollowUp => "follow-up",
            Operation::Status => "status",
            Operation::List => "list",
            Operation::Cancel => "cancel",
            Operation::ToggleVisibility => "toggle-visibility",
            Operation::PublicStatus => "public-status",
        };
        f.write_str(name)
    }
}

pub struct ModeRouter {
    mode: DeploymentMode,
    api_base_url: String,
    proxy_base_url: String,
    api_key: Option<String>,
    account_id: Option<String>,
    tokens: Option<TokenManager>,
    http: HttpTaskApi,
}

impl ModeRouter {
    pub fn new(config: &Config, tokens: Option<TokenManager>, http: HttpTaskApi) -> Self {
        Self {
            mode: config.mode,
            api_base_url: config.api.base_url.clone(),
            proxy_base_url: config.proxy.base_url.clone(),
            api_key: config.resolve_api_key(),
            account_id: config.api.account_id.clone(),
            tokens,
            http,
        }
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    /// Decide the route for `op`. The token is read at this moment, never
    /// cached across calls.
    pub async fn route(&self, op: Operation) -> Result<Route, TaskError> {
        if op == Operation::PublicStatus {
            let base_url = match self.mode {
                DeploymentMode::Hosted => self.proxy_base_url.clone(),
                DeploymentMode::SelfHosted => self.api_base_url.clone(),
            };
            return Ok(Route {
                base_url,
                credential: Credential::None,
            });
        }

        match self.mode {
            DeploymentMode::SelfHosted => {
                let key = self.api_key.clone().ok_or_else(|| TaskError::Auth {
                    message: "no API key configured for self-hosted mode".to_string(),
                    reauth_required: false,
                })?;
                Ok(Route {
                    base_url: self.api_base_url.clone(),
                    credential: Credential::ApiKey(key),
                })
            }
            DeploymentMode::Hosted => {
                let token = match &self.tokens {
                    Some(tokens) => tokens.fresh_access_token().await,
                    None => None,
                };
                let token = token.ok_or_else(|| {
                    tracing::info!("No usable session for {}; reauthentication required", op);
                    TaskError::reauth("sign in to continue")
                })?;
                Ok(Route {
                    base_url: self.proxy_base_url.clone(),
                    credential: Credential::Bearer(token),
                })
            }
        }
    }
}

#[async_trait]
impl TaskApi for ModeRouter {
    async fn create_task(&self, request: &CreateTaskRequest) -> Result<String, TaskError> {
        let op = if request.previous_task_id.is_some() {
            Operation::FollowUp
        } else {
            Operation::Create
        };
        let route = self.route(op).await?;
        self.http.create_task(&route, request).await
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskResult, TaskError> {
        let route = self.route(Operation::Status).await?;
        self.http.task_status(&route, task_id).await
    }

    async fn cancel_task(&self, task_id: &str) -> Result<bool, TaskError> {
        let route = self.route(Operation::Cancel).await?;
        self.http.cancel_task(&route, task_id).await
    }

    async fn list_tasks(&self, limit: Option<u32>) -> Result<Vec<TaskSummary>, TaskError> {
        let account_id = match self.mode {
            DeploymentMode::SelfHosted => Some(self.account_id.as_deref().ok_or_else(|| {
                TaskError::Validation(
                    "listing tasks in self-hosted mode requires api.account_id".to_string(),
                )
            })?),
            DeploymentMode::Hosted => None,
        };
        let route = self.route(Operation::List).await?;
        self.http.list_tasks(&route, limit, account_id).await
    }

    async fn set_visibility(&self, task_id: &str, is_public: bool) -> Result<bool, TaskError> {
        let route = self.route(Operation::ToggleVisibility).await?;
        self.http.set_visibility(&route, task_id, is_public).await
    }

    async fn public_status(&self, task_id: &str) -> Result<TaskResult, TaskError> {
        let route = self.route(Operation::PublicStatus).await?;
        self.http.public_status(&route, task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenRefresher;
    use crate::core::error::AuthError;
    use crate::core::session::{TokenSet, User};
    use std::sync::Arc;
    use std::time::Duration;

    struct RejectingRefresher;

    #[async_trait]
    impl TokenRefresher for RejectingRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenSet, AuthError> {
            Err(AuthError::Transport("auth service unreachable".into()))
        }
    }

    fn http() -> HttpTaskApi {
        HttpTaskApi::new(Duration::from_secs(5)).unwrap()
    }

    fn config(mode: DeploymentMode) -> Config {
        let mut config = Config::default();
        config.mode = mode;
        config.api.base_url = "https://api.example.com".into();
        config.proxy.base_url = "https://app.example.com/proxy".into();
        config
    }

    fn user() -> User {
        User {
            id: "u1".into(),
            email: None,
            name: None,
        }
    }

    #[tokio::test]
    async fn test_self_hosted_uses_direct_path_even_when_signed_in() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenManager::new(dir.path().join("s.json"), Arc::new(RejectingRefresher));
        tokens
            .sign_in(
                user(),
                TokenSet {
                    access_token: "user-token".into(),
                    refresh_token: None,
                    expires_in: 3600,
                },
            )
            .await
            .unwrap();

        let mut config = config(DeploymentMode::SelfHosted);
        config.api.api_key = Some("sk-direct".into());
        let router = ModeRouter::new(&config, Some(tokens), http());

        let route = router.route(Operation::Create).await.unwrap();
        assert_eq!(route.base_url, "https://api.example.com");
        assert_eq!(route.credential, Credential::ApiKey("sk-direct".into()));
    }

    #[tokio::test]
    async fn test_hosted_routes_through_proxy_with_token() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenManager::new(dir.path().join("s.json"), Arc::new(RejectingRefresher));
        tokens
            .sign_in(
                user(),
                TokenSet {
                    access_token: "user-token".into(),
                    refresh_token: None,
                    expires_in: 3600,
                },
            )
            .await
            .unwrap();

        let mut config = config(DeploymentMode::Hosted);
        config.api.api_key = Some("sk-shared".into());
        let router = ModeRouter::new(&config, Some(tokens), http());

        for op in [Operation::Status, Operation::Cancel, Operation::FollowUp] {
            let route = router.route(op).await.unwrap();
            assert_eq!(route.base_url, "https://app.example.com/proxy");
            assert_eq!(route.credential, Credential::Bearer("user-token".into()));
        }
    }

    #[tokio::test]
    async fn test_hosted_without_token_never_falls_back_to_shared_key() {
        let mut config = config(DeploymentMode::Hosted);
        config.api.api_key = Some("sk-shared".into());
        let router = ModeRouter::new(&config, None, http());

        let err = router.route(Operation::Create).await.unwrap_err();
        assert!(err.requires_reauth());
    }

    #[tokio::test]
    async fn test_hosted_failed_refresh_requires_reauth() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenManager::new(dir.path().join("s.json"), Arc::new(RejectingRefresher));
        tokens
            .sign_in(
                user(),
                TokenSet {
                    access_token: "expiring".into(),
                    refresh_token: Some("r".into()),
                    expires_in: 5,
                },
            )
            .await
            .unwrap();

        let router = ModeRouter::new(&config(DeploymentMode::Hosted), Some(tokens.clone()), http());
        let err = router.route(Operation::Status).await.unwrap_err();
        assert!(err.requires_reauth());
        assert!(!tokens.is_authenticated());
    }

    #[tokio::test]
    async fn test_public_status_carries_no_credential() {
        let router = ModeRouter::new(&config(DeploymentMode::Hosted), None, http());
        let route = router.route(Operation::PublicStatus).await.unwrap();
        assert_eq!(route.credential, Credential::None);
        assert_eq!(route.base_url, "https://app.example.com/proxy");
    }

    #[tokio::test]
    async fn test_self_hosted_list_requires_account_id() {
        let mut config = config(DeploymentMode::SelfHosted);
        config.api.api_key = Some("sk".into());
        let router = ModeRouter::new(&config, None, http());
        let err = router.list_tasks(Some(5)).await.unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }
}
