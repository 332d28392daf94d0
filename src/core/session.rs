use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::AuthError;

/// Tokens are considered expired this long before their real expiry.
pub const EXPIRY_SKEW_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Tokens as issued by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds.
    pub expires_in: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user: User,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub is_authenticated: bool,
}

impl TokenSet {
    /// Absolute expiry for tokens issued at `now`. A negative or
    /// unrepresentable lifetime is rejected.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AuthError> {
        if self.expires_in < 0 {
            return Err(AuthError::InvalidTokens(format!(
                "negative expiresIn {}",
                self.expires_in
            )));
        }
        Duration::try_seconds(self.expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::InvalidTokens(format!("expiresIn {} is out of range", self.expires_in))
            })
    }
}

impl Session {
    pub fn new(user: User, tokens: TokenSet, now: DateTime<Utc>) -> Result<Self, AuthError> {
        let expires_at = tokens.expires_at(now)?;
        Ok(Self {
            user,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at,
            is_authenticated: true,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_SKEW_SECS) >= self.expires_at
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }

    /// Apply a refresh response. The auth service may omit a new refresh
    /// token, in which case the current one stays valid. The session is
    /// left untouched when the response is rejected.
    pub fn apply_refresh(&mut self, tokens: TokenSet, now: DateTime<Utc>) -> Result<(), AuthError> {
        self.expires_at = tokens.expires_at(now)?;
        self.access_token = tokens.access_token;
        if let Some(refresh) = tokens.refresh_token {
            self.refresh_token = Some(refresh);
        }
        self.is_authenticated = true;
        Ok(())
    }
}
