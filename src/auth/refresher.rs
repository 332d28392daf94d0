use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::core::error::AuthError;
use crate::core::session::TokenSet;

/// Exchanges a refresh token for a new token set.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    refresh_url: String,
    client: Client,
}

impl HttpTokenRefresher {
    pub fn new(refresh_url: String, timeout: Duration) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        Ok(Self {
            refresh_url,
            client,
        })
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthError> {
        tracing::debug!("POST {} (token refresh)", self.refresh_url);

        let response = self
            .client
            .post(&self.refresh_url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AuthError::RefreshRejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<TokenSet>()
            .await
            .map_err(|e| AuthError::Transport(format!("Failed to parse refresh response: {}", e)))
    }
}
