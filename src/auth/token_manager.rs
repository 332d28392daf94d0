//! Session ownership and token freshness.
//!
//! The manager is the only writer of the [`Session`]. Every mutation is
//! persisted before the lock is released, and a failed refresh always ends
//! in a full sign-out.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::refresher::TokenRefresher;
use crate::core::error::AuthError;
use crate::core::session::{Session, TokenSet, User};
use crate::utils::fs::{read_json, remove_if_exists, write_json_atomic};

#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    session: RwLock<Option<Session>>,
    refresher: Arc<dyn TokenRefresher>,
    session_file: PathBuf,
    refresh_lock: Mutex<()>,
    auth_tx: watch::Sender<bool>,
    background_refresh: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TokenManager {
    pub fn new(session_file: PathBuf, refresher: Arc<dyn TokenRefresher>) -> Self {
        let (auth_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                session: RwLock::new(None),
                refresher,
                session_file,
                refresh_lock: Mutex::new(()),
                auth_tx,
                background_refresh: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Load the persisted session. An expired access token with a usable
    /// refresh token schedules a background refresh; this call never waits
    /// for it.
    pub async fn initialize(&self) -> Result<(), AuthError> {
        let loaded = match read_json::<Session>(&self.inner.session_file).await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(
                    "Discarding unreadable session file {}: {}",
                    self.inner.session_file.display(),
                    e
                );
                remove_if_exists(&self.inner.session_file).await?;
                None
            }
        };

        let Some(session) = loaded.filter(|s| s.is_authenticated) else {
            tracing::debug!("No persisted session");
            self.inner.auth_tx.send_replace(false);
            return Ok(());
        };

        let expired = session.is_expired_at(Utc::now());
        let can_refresh = session.can_refresh();
        tracing::info!(
            "Restored session for user {} (expired: {})",
            session.user.id,
            expired
        );
        *self.inner.session.write().await = Some(session);
        self.inner.auth_tx.send_replace(true);

        if expired {
            if can_refresh {
                let manager = self.clone();
                let handle = tokio::spawn(async move {
                    if manager.refresh_access_token().await.is_none() {
                        tracing::warn!("Background token refresh failed; signed out");
                    }
                });
                if let Ok(mut slot) = self.inner.background_refresh.lock() {
                    *slot = Some(handle);
                }
            } else {
                tracing::info!("Persisted token expired and cannot be refreshed; signing out");
                self.sign_out().await?;
            }
        }
        Ok(())
    }

    pub async fn sign_in(&self, user: User, tokens: TokenSet) -> Result<Session, AuthError> {
        let session = Session::new(user, tokens, Utc::now())?;
        let mut guard = self.inner.session.write().await;
        write_json_atomic(&self.inner.session_file, &session).await?;
        *guard = Some(session.clone());
        drop(guard);

        self.inner.auth_tx.send_replace(true);
        tracing::info!("Signed in as {}", session.user.id);
        Ok(session)
    }

    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let mut guard = self.inner.session.write().await;
        let previous = guard.take();
        let removed = remove_if_exists(&self.inner.session_file).await;
        drop(guard);

        self.inner.auth_tx.send_replace(false);
        if let Some(previous) = previous {
            tracing::info!("Signed out {}", previous.user.id);
        }
        removed.map_err(AuthError::from)
    }

    /// The current access token, unless it is missing or inside the expiry
    /// buffer. Never triggers a refresh.
    pub async fn get_access_token(&self) -> Option<String> {
        let guard = self.inner.session.read().await;
        guard
            .as_ref()
            .filter(|s| s.is_authenticated && !s.is_expired_at(Utc::now()))
            .map(|s| s.access_token.clone())
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Concurrent callers share a single refresh. Any failure signs the user
    /// out and yields `None`.
    pub async fn refresh_access_token(&self) -> Option<String> {
        let observed = self.current_access_token().await;
        let _refreshing = self.inner.refresh_lock.lock().await;

        // Someone else finished a refresh while we waited.
        if let Some(token) = self.get_access_token().await {
            if observed.as_deref() != Some(token.as_str()) {
                return Some(token);
            }
        }

        let (user_id, refresh_token) = {
            let guard = self.inner.session.read().await;
            match guard.as_ref() {
                None => return None,
                Some(session) if session.can_refresh() => {
                    (session.user.id.clone(), session.refresh_token.clone())
                }
                Some(session) => (session.user.id.clone(), None),
            }
        };
        let Some(refresh_token) = refresh_token else {
            tracing::warn!("Session has no refresh token; signing out");
            self.sign_out_quietly().await;
            return None;
        };

        let outcome = self.inner.refresher.refresh(&refresh_token).await;

        let mut guard = self.inner.session.write().await;
        // The session may have been replaced while the request was out.
        let Some(session) = guard.as_mut().filter(|s| {
            s.user.id == user_id && s.refresh_token.as_deref() == Some(refresh_token.as_str())
        }) else {
            tracing::debug!("Session changed during refresh; dropping the response");
            return None;
        };

        let applied = outcome.and_then(|tokens| session.apply_refresh(tokens, Utc::now()));
        match applied {
            Ok(()) => {
                let token = session.access_token.clone();
                if let Err(e) = write_json_atomic(&self.inner.session_file, &*session).await {
                    tracing::error!("Failed to persist refreshed session: {}", e);
                }
                drop(guard);
                tracing::info!("Access token refreshed");
                Some(token)
            }
            Err(e) => {
                drop(guard);
                tracing::warn!("Token refresh failed: {}", e);
                self.sign_out_quietly().await;
                None
            }
        }
    }

    /// A usable token right now, refreshing first if that is possible.
    pub async fn fresh_access_token(&self) -> Option<String> {
        if let Some(token) = self.get_access_token().await {
            return Some(token);
        }
        let can_refresh = self
            .inner
            .session
            .read()
            .await
            .as_ref()
            .is_some_and(Session::can_refresh);
        if can_refresh {
            self.refresh_access_token().await
        } else {
            None
        }
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.session.read().await.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        *self.inner.auth_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.auth_tx.subscribe()
    }

    /// Wait for the refresh scheduled by [`initialize`](Self::initialize), if any.
    pub async fn wait_for_background_refresh(&self) {
        let handle = self
            .inner
            .background_refresh
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Background refresh task panicked: {}", e);
            }
        }
    }

    async fn current_access_token(&self) -> Option<String> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    async fn sign_out_quietly(&self) {
        if let Err(e) = self.sign_out().await {
            tracing::error!("Failed to clear session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FakeRefresher {
        calls: AtomicUsize,
        succeed: bool,
        delay: std::time::Duration,
    }

    impl FakeRefresher {
        fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                succeed,
                delay: std::time::Duration::from_millis(0),
            })
        }

        fn slow(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                succeed,
                delay: std::time::Duration::from_millis(50),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.succeed {
                Ok(TokenSet {
                    access_token: format!("access-{}", n),
                    refresh_token: Some(format!("{}-next", refresh_token)),
                    expires_in: 3600,
                })
            } else {
                Err(AuthError::RefreshRejected {
                    status: 401,
                    message: "refresh token revoked".into(),
                })
            }
        }
    }

    /// Holds every refresh until `release` is notified.
    #[derive(Default)]
    struct GatedRefresher {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TokenRefresher for GatedRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenSet, AuthError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(TokenSet {
                access_token: "from-first-refresh".into(),
                refresh_token: Some("rotated".into()),
                expires_in: 3600,
            })
        }
    }

    struct UnboundedLifetime;

    #[async_trait]
    impl TokenRefresher for UnboundedLifetime {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenSet, AuthError> {
            Ok(TokenSet {
                access_token: "never-expires".into(),
                refresh_token: None,
                expires_in: i64::MAX,
            })
        }
    }

    fn user() -> User {
        User {
            id: "user-1".into(),
            email: Some("ada@example.com".into()),
            name: None,
        }
    }

    async fn write_expired_session(path: &std::path::Path) {
        let session = Session {
            user: user(),
            access_token: "stale".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: Utc::now() - Duration::minutes(5),
            is_authenticated: true,
        };
        write_json_atomic(path, &session).await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_with_expired_token_refreshes_once_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        write_expired_session(&path).await;

        let refresher = FakeRefresher::slow(true);
        let manager = TokenManager::new(path.clone(), refresher.clone());
        manager.initialize().await.unwrap();

        // Initialization does not wait for the refresh.
        assert_eq!(manager.get_access_token().await, None);
        assert!(manager.is_authenticated());

        manager.wait_for_background_refresh().await;
        assert_eq!(refresher.calls(), 1);
        assert_eq!(manager.get_access_token().await.as_deref(), Some("access-1"));

        let persisted: Session = read_json(&path).await.unwrap().unwrap();
        assert_eq!(persisted.access_token, "access-1");
        assert_eq!(persisted.refresh_token.as_deref(), Some("refresh-1-next"));
    }

    #[tokio::test]
    async fn test_failed_background_refresh_signs_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        write_expired_session(&path).await;

        let refresher = FakeRefresher::new(false);
        let manager = TokenManager::new(path.clone(), refresher.clone());
        let mut auth_rx = manager.subscribe();
        manager.initialize().await.unwrap();
        assert_eq!(manager.get_access_token().await, None);

        manager.wait_for_background_refresh().await;
        assert_eq!(refresher.calls(), 1);
        assert!(!manager.is_authenticated());
        assert!(manager.session().await.is_none());
        assert!(!path.exists());
        auth_rx.changed().await.ok();
        assert!(!*auth_rx.borrow());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_request() {
        let dir = tempfile::tempdir().unwrap();
        let refresher = FakeRefresher::slow(true);
        let manager = TokenManager::new(dir.path().join("session.json"), refresher.clone());
        manager
            .sign_in(
                user(),
                TokenSet {
                    access_token: "short-lived".into(),
                    refresh_token: Some("refresh-1".into()),
                    expires_in: 10,
                },
            )
            .await
            .unwrap();
        assert_eq!(manager.get_access_token().await, None);

        let (a, b) = tokio::join!(manager.fresh_access_token(), manager.fresh_access_token());
        assert_eq!(refresher.calls(), 1);
        assert_eq!(a.as_deref(), Some("access-1"));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_sign_in_and_out_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let manager = TokenManager::new(path.clone(), FakeRefresher::new(true));

        manager
            .sign_in(
                user(),
                TokenSet {
                    access_token: "tok".into(),
                    refresh_token: None,
                    expires_in: 3600,
                },
            )
            .await
            .unwrap();
        assert_eq!(manager.get_access_token().await.as_deref(), Some("tok"));

        let other_view = TokenManager::new(path.clone(), FakeRefresher::new(true));
        other_view.initialize().await.unwrap();
        assert_eq!(other_view.get_access_token().await.as_deref(), Some("tok"));

        manager.sign_out().await.unwrap();
        assert!(!path.exists());
        assert_eq!(manager.get_access_token().await, None);
        assert_eq!(manager.refresh_access_token().await, None);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_signs_out_on_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let session = Session {
            user: user(),
            access_token: "stale".into(),
            refresh_token: None,
            expires_at: Utc::now() - Duration::minutes(1),
            is_authenticated: true,
        };
        write_json_atomic(&path, &session).await.unwrap();

        let refresher = FakeRefresher::new(true);
        let manager = TokenManager::new(path.clone(), refresher.clone());
        manager.initialize().await.unwrap();
        assert!(!manager.is_authenticated());
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_for_replaced_session_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let refresher = Arc::new(GatedRefresher::default());
        let manager = TokenManager::new(path.clone(), refresher.clone());
        manager
            .sign_in(
                user(),
                TokenSet {
                    access_token: "first-token".into(),
                    refresh_token: Some("first-refresh".into()),
                    expires_in: 10,
                },
            )
            .await
            .unwrap();

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.fresh_access_token().await }
        });
        refresher.started.notified().await;

        manager.sign_out().await.unwrap();
        let second = User {
            id: "user-2".into(),
            email: None,
            name: None,
        };
        manager
            .sign_in(
                second,
                TokenSet {
                    access_token: "second-token".into(),
                    refresh_token: Some("second-refresh".into()),
                    expires_in: 3600,
                },
            )
            .await
            .unwrap();

        refresher.release.notify_one();
        assert_eq!(pending.await.unwrap(), None);

        let session = manager.session().await.unwrap();
        assert_eq!(session.user.id, "user-2");
        assert_eq!(session.access_token, "second-token");
        assert_eq!(session.refresh_token.as_deref(), Some("second-refresh"));
        assert!(manager.is_authenticated());

        let persisted: Session = read_json(&path).await.unwrap().unwrap();
        assert_eq!(persisted.access_token, "second-token");
    }

    #[tokio::test]
    async fn test_refresh_with_unusable_lifetime_signs_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let manager = TokenManager::new(path.clone(), Arc::new(UnboundedLifetime));
        manager
            .sign_in(
                user(),
                TokenSet {
                    access_token: "short-lived".into(),
                    refresh_token: Some("refresh-1".into()),
                    expires_in: 10,
                },
            )
            .await
            .unwrap();

        assert_eq!(manager.fresh_access_token().await, None);
        assert!(!manager.is_authenticated());
        assert!(manager.session().await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_sign_in_rejects_negative_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let manager = TokenManager::new(path.clone(), FakeRefresher::new(true));
        let err = manager
            .sign_in(
                user(),
                TokenSet {
                    access_token: "tok".into(),
                    refresh_token: None,
                    expires_in: -5,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidTokens(_)));
        assert!(!manager.is_authenticated());
        assert!(!path.exists());
    }
}
