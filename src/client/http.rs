use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use super::api::{
    CancelResponse, CreateTaskResponse, ListResponse, VisibilityRequest, VisibilityResponse,
};
use crate::core::error::TaskError;
use crate::core::task::{CreateTaskRequest, TaskResult, TaskSummary};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    Bearer(String),
    None,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::ApiKey(_) => f.write_str("ApiKey(..)"),
            Credential::Bearer(_) => f.write_str("Bearer(..)"),
            Credential::None => f.write_str("None"),
        }
    }
}

/// Where a single call goes and how it is authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub base_url: String,
    pub credential: Credential,
}

impl Route {
    /// Append `segments` to the base URL, escaping each one.
    fn url(&self, segments: &[&str]) -> Result<Url, TaskError> {
        let invalid = || TaskError::Validation(format!("invalid base URL: {}", self.base_url));
        let mut url = Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authenticated(&self) -> bool {
        self.credential != Credential::None
    }
}

/// Plain HTTP transport for the task contract. Routing and credential
/// selection happen in [`ModeRouter`](super::router::ModeRouter).
#[derive(Debug, Clone)]
pub struct HttpTaskApi {
    client: Client,
}

impl HttpTaskApi {
    pub fn new(timeout: Duration) -> Result<Self, TaskError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TaskError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub async fn create_task(
        &self,
        route: &Route,
        request: &CreateTaskRequest,
    ) -> Result<String, TaskError> {
        let url = route.url(&["tasks"])?;
        tracing::debug!(
            "POST {} ({} deliverables, {} attachments, {} urls, follow-up: {})",
            url,
            request.deliverables.len(),
            request.attachments.len(),
            request.urls.len(),
            request.previous_task_id.is_some()
        );
        let builder = self.client.post(url).json(request);
        let response: CreateTaskResponse = self.send_json(route, builder).await?;
        tracing::debug!("Created task {}", response.task_id);
        Ok(response.task_id)
    }

    pub async fn task_status(&self, route: &Route, task_id: &str) -> Result<TaskResult, TaskError> {
        let url = route.url(&["tasks", task_id])?;
        tracing::debug!("GET {}", url);
        self.send_json(route, self.client.get(url)).await
    }

    pub async fn cancel_task(&self, route: &Route, task_id: &str) -> Result<bool, TaskError> {
        let url = route.url(&["tasks", task_id, "cancel"])?;
        tracing::debug!("POST {}", url);
        let response: CancelResponse = self.send_json(route, self.client.post(url)).await?;
        Ok(response.success)
    }

    pub async fn list_tasks(
        &self,
        route: &Route,
        limit: Option<u32>,
        account_id: Option<&str>,
    ) -> Result<Vec<TaskSummary>, TaskError> {
        let url = route.url(&["tasks"])?;
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(account_id) = account_id {
            query.push(("accountId", account_id.to_string()));
        }
        tracing::debug!("GET {} {:?}", url, query);
        let response: ListResponse = self
            .send_json(route, self.client.get(url).query(&query))
            .await?;
        Ok(response.into_tasks())
    }

    pub async fn set_visibility(
        &self,
        route: &Route,
        task_id: &str,
        is_public: bool,
    ) -> Result<bool, TaskError> {
        let url = route.url(&["tasks", task_id, "visibility"])?;
        tracing::debug!("POST {} (public: {})", url, is_public);
        let builder = self.client.post(url).json(&VisibilityRequest { is_public });
        let response: VisibilityResponse = self.send_json(route, builder).await?;
        if !response.success {
            return Err(TaskError::Upstream {
                status: None,
                message: "backend refused the visibility change".to_string(),
            });
        }
        Ok(response.public)
    }

    pub async fn public_status(&self, route: &Route, task_id: &str) -> Result<TaskResult, TaskError> {
        let url = route.url(&["public", "tasks", task_id])?;
        tracing::debug!("GET {}", url);
        self.send_json(route, self.client.get(url)).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        route: &Route,
        builder: RequestBuilder,
    ) -> Result<T, TaskError> {
        let response = self.send(route, builder).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| TaskError::Upstream {
            status: None,
            message: format!("Failed to parse backend response: {}", e),
        })
    }

    async fn send(&self, route: &Route, builder: RequestBuilder) -> Result<Response, TaskError> {
        let builder = match &route.credential {
            Credential::ApiKey(key) => builder.header(API_KEY_HEADER, key),
            Credential::Bearer(token) => builder.bearer_auth(token),
            Credential::None => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        tracing::debug!("Response status: {}", status);
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = TaskError::from_upstream(status.as_u16(), &body, route.authenticated());
        tracing::warn!("Backend call failed with status {}: {}", status, err);
        Err(err)
    }
}
