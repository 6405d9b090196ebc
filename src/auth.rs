// auth.rs - Authorization schemes and session-refresh serialization (§4.5)
//
// Grounded on the teacher's `oauth/token.rs` `TokenManager`: an in-memory
// cache of the live credential plus a coordination primitive so that a 401
// observed by several concurrent requests triggers exactly one refresh
// (there, cache + RwLock; here, the refresh itself is gated by `PromiseQueue`
// rather than retried ad hoc by every caller).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::promise_queue::PromiseQueue;

/// Authorization scheme a request declares it needs (§4.5, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Try `Session` if an active user exists, otherwise fall back to `App`.
    /// Used by ordinary collection CRUD, which must keep working for apps
    /// that never configure a master secret.
    Default,
    /// Tries every available credential in turn: `Session`, then `Master`
    /// (if configured), then `App`. Used by calls that are willing to run
    /// with elevated credentials but should not hard-fail when they are absent.
    All,
    App,
    Basic,
    Client,
    Master,
    None,
    Session,
}

/// The active user's session credential, set after login and cleared on logout.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub user_id: String,
    pub auth_token: String,
    /// MIC refresh token, present when the session originated from (or has
    /// since gone through) a social login; required to silently refresh on a 401.
    pub refresh_token: Option<String>,
}

/// Holds the app's static credentials and the live session, and serializes
/// session refreshes so concurrent 401s never trigger more than one
/// in-flight re-authentication (§4.5).
pub struct AuthProvider {
    app_key: String,
    app_secret: String,
    master_secret: Option<String>,
    session: RwLock<Option<SessionCredentials>>,
    refresh_queue: PromiseQueue,
}

const REFRESH_KEY: &str = "session-refresh";

impl AuthProvider {
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>, master_secret: Option<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            master_secret,
            session: RwLock::new(None),
            refresh_queue: PromiseQueue::new(),
        }
    }

    pub async fn set_session(&self, credentials: SessionCredentials) {
        *self.session.write().await = Some(credentials);
    }

    pub async fn clear_session(&self) {
        *self.session.write().await = None;
    }

    pub async fn has_session(&self) -> bool {
        self.session.read().await.is_some()
    }

    pub async fn active_user_id(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.user_id.clone())
    }

    /// The active session's MIC refresh token, if any (§4.10).
    pub async fn session_refresh_token(&self) -> Option<String> {
        self.session.read().await.as_ref().and_then(|s| s.refresh_token.clone())
    }

    /// Builds the `Authorization` header value for `scheme` (§6).
    pub async fn header_value(&self, scheme: AuthType) -> Result<Option<String>> {
        match scheme {
            AuthType::None => Ok(None),
            AuthType::App => Ok(Some(basic(&self.app_key, &self.app_secret))),
            AuthType::Master => {
                let secret = self
                    .master_secret
                    .as_ref()
                    .ok_or_else(|| Error::MissingConfiguration("masterSecret".into()))?;
                Ok(Some(basic(&self.app_key, secret)))
            }
            AuthType::Client => Ok(Some(format!("Kinvey {}", self.app_key))),
            AuthType::Session => {
                let session = self.session.read().await;
                let creds = session.as_ref().ok_or(Error::NoActiveUser)?;
                Ok(Some(format!("Kinvey {}", creds.auth_token)))
            }
            AuthType::Basic => Err(Error::MissingConfiguration(
                "Basic auth requires explicit credentials; use basic_header".into(),
            )),
            AuthType::Default => {
                if self.has_session().await {
                    self.header_value(AuthType::Session).await
                } else {
                    self.header_value(AuthType::App).await
                }
            }
            AuthType::All => {
                if self.has_session().await {
                    self.header_value(AuthType::Session).await
                } else if self.master_secret.is_some() {
                    self.header_value(AuthType::Master).await
                } else {
                    self.header_value(AuthType::App).await
                }
            }
        }
    }

    /// Runs `f` (typically a re-login/refresh HTTP call) with at most one
    /// refresh in flight at a time for this provider. Concurrent 401s queued
    /// behind the first caller observe the refreshed session once it resolves
    /// rather than each independently re-authenticating.
    pub async fn with_refresh_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.refresh_queue.enqueue(REFRESH_KEY, f).await
    }
}

/// `Basic base64(username:password)`.
pub fn basic(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn app_scheme_encodes_basic_credentials() {
        let auth = AuthProvider::new("appkey", "appsecret", None);
        let header = auth.header_value(AuthType::App).await.unwrap().unwrap();
        assert!(header.starts_with("Basic "));
    }

    #[tokio::test]
    async fn master_without_secret_is_missing_configuration() {
        let auth = AuthProvider::new("appkey", "appsecret", None);
        let err = auth.header_value(AuthType::Master).await.unwrap_err();
        assert!(matches!(err, Error::MissingConfiguration(_)));
    }

    #[tokio::test]
    async fn session_without_active_user_is_no_active_user() {
        let auth = AuthProvider::new("appkey", "appsecret", None);
        let err = auth.header_value(AuthType::Session).await.unwrap_err();
        assert!(matches!(err, Error::NoActiveUser));
    }

    #[tokio::test]
    async fn default_falls_back_to_app_without_a_session() {
        let auth = AuthProvider::new("appkey", "appsecret", None);
        let header = auth.header_value(AuthType::Default).await.unwrap().unwrap();
        assert!(header.starts_with("Basic "));
    }

    #[tokio::test]
    async fn default_prefers_session_once_logged_in() {
        let auth = AuthProvider::new("appkey", "appsecret", None);
        auth.set_session(SessionCredentials {
            user_id: "u1".into(),
            auth_token: "tok".into(),
            refresh_token: None,
        })
        .await;
        let header = auth.header_value(AuthType::Default).await.unwrap().unwrap();
        assert_eq!(header, "Kinvey tok");
    }

    #[tokio::test]
    async fn all_falls_back_to_master_when_configured_and_no_session() {
        let auth = AuthProvider::new("appkey", "appsecret", Some("mastersecret".into()));
        let header = auth.header_value(AuthType::All).await.unwrap().unwrap();
        assert_eq!(header, basic("appkey", "mastersecret"));
    }

    #[tokio::test]
    async fn all_falls_back_to_app_without_a_master_secret() {
        let auth = AuthProvider::new("appkey", "appsecret", None);
        let header = auth.header_value(AuthType::All).await.unwrap().unwrap();
        assert_eq!(header, basic("appkey", "appsecret"));
    }

    #[tokio::test]
    async fn all_prefers_session_over_master() {
        let auth = AuthProvider::new("appkey", "appsecret", Some("mastersecret".into()));
        auth.set_session(SessionCredentials {
            user_id: "u1".into(),
            auth_token: "tok".into(),
            refresh_token: None,
        })
        .await;
        let header = auth.header_value(AuthType::All).await.unwrap().unwrap();
        assert_eq!(header, "Kinvey tok");
    }

    #[tokio::test]
    async fn refresh_lock_serializes_concurrent_refreshes() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let auth = Arc::new(AuthProvider::new("appkey", "appsecret", None));
        let calls = Arc::new(AtomicUsize::new(0));

        let a1 = auth.clone();
        let c1 = calls.clone();
        let t1 = tokio::spawn(async move {
            a1.with_refresh_lock(|| async {
                c1.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        });
        let a2 = auth.clone();
        let c2 = calls.clone();
        let t2 = tokio::spawn(async move {
            a2.with_refresh_lock(|| async {
                c2.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        });

        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
