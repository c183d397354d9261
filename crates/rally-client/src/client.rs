use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use rally_types::api::{Envelope, RefreshData};
use rally_types::session::SessionStore;

use crate::config::ApiConfig;
use crate::error::ApiError;

/// The one endpoint whose 401 means "log out", never "refresh". The refresh
/// token itself travels in an http-only cookie, so the call has no body.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Route prefixes reachable without a session. Terminal auth failures while
/// the app sits on one of these do not trigger a login redirect.
pub const PUBLIC_PATHS: &[&str] = &["/login", "/register", "/oauth/callback"];

/// Emitted when the client de-authenticates the whole app. No individual
/// caller can be trusted to handle global logout consistently, so the
/// client owns it and the UI shell reacts to these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Session cleared after an unrecoverable auth failure.
    LoggedOut,
    /// UI should navigate to the login entry point.
    RedirectToLogin,
}

/// A request that saw a 401 while a refresh was already in flight. The
/// refresher replays it with the new token and settles the continuation.
struct QueuedCall {
    method: Method,
    path: String,
    body: Option<Value>,
    tx: oneshot::Sender<Result<Envelope, ApiError>>,
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    queue: VecDeque<QueuedCall>,
}

/// What one HTTP exchange produced, before refresh logic is applied.
enum Outcome {
    Ok(Envelope),
    Unauthorized,
    Status(u16, Option<Envelope>),
}

/// HTTP client for the backend API: attaches the bearer token from the
/// session store, passes response envelopes through uninterpreted, and on a
/// 401 performs a single-flight token refresh — concurrent 401s collapse
/// into exactly one refresh call, with queued requests replayed FIFO once
/// it settles.
///
/// Cloning is cheap and clones share the refresh state; every task in the
/// process should go through the same instance.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    config: ApiConfig,
    store: Arc<SessionStore>,
    refresh: Mutex<RefreshState>,
    auth_tx: broadcast::Sender<AuthEvent>,
    current_path: Mutex<String>,
}

impl ApiClient {
    pub fn new(config: ApiConfig, store: Arc<SessionStore>) -> Result<Self, ApiError> {
        // Cookie store holds the http-only refresh token between calls.
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        let (auth_tx, _) = broadcast::channel(16);

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                config,
                store,
                refresh: Mutex::new(RefreshState::default()),
                auth_tx,
                current_path: Mutex::new("/".into()),
            }),
        })
    }

    /// Subscribe to forced-logout / redirect events.
    pub fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.auth_tx.subscribe()
    }

    /// Track the app's current route, so redirects are suppressed on
    /// login/register/OAuth-callback pages.
    pub fn set_current_path(&self, path: &str) {
        *lock(&self.inner.current_path) = path.to_string();
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    pub async fn get(&self, path: &str) -> Result<Envelope, ApiError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Envelope, ApiError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<Envelope, ApiError> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Envelope, ApiError> {
        self.request(Method::DELETE, path, None).await
    }

    /// Issue a call. Works unauthenticated too — without a session token the
    /// Authorization header is simply omitted.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Envelope, ApiError> {
        let token = self.inner.store.access_token();
        match self
            .execute(method.clone(), path, body.as_ref(), token.as_deref())
            .await?
        {
            Outcome::Ok(envelope) => Ok(envelope),
            Outcome::Status(status, envelope) => Err(ApiError::Status { status, envelope }),
            Outcome::Unauthorized => {
                if path == REFRESH_PATH {
                    // Unconditional logout: do not retry, do not queue.
                    self.force_logout("refresh endpoint rejected the session");
                    return Err(ApiError::Unauthorized);
                }
                self.refresh_and_retry(method, path, body).await
            }
        }
    }

    /// Handle a refreshable 401: join the in-flight refresh as a queued
    /// continuation, or become the refresher.
    async fn refresh_and_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Envelope, ApiError> {
        let wait = {
            let mut state = lock(&self.inner.refresh);
            if state.refreshing {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(QueuedCall {
                    method: method.clone(),
                    path: path.to_string(),
                    body: body.clone(),
                    tx,
                });
                debug!("401 on {path} while refreshing, queued ({} waiting)", state.queue.len());
                Some(rx)
            } else {
                state.refreshing = true;
                None
            }
        };

        if let Some(rx) = wait {
            // The in-flight refresher replays this call and settles us.
            return rx
                .await
                .map_err(|_| ApiError::RefreshFailed("refresh was dropped".into()))?;
        }

        info!("401 on {path}, refreshing access token");
        let refreshed = self.refresh_token().await;

        // Single-flight release point: clear the flag and take the queue
        // before settling anything.
        let queued: Vec<QueuedCall> = {
            let mut state = lock(&self.inner.refresh);
            state.refreshing = false;
            state.queue.drain(..).collect()
        };

        match refreshed {
            Ok(token) => {
                // The refresher's own request replays first; it initiated
                // the refresh and already holds the new token.
                let own = self.replay(method, path, body.as_ref(), &token).await;
                for call in queued {
                    let result = self
                        .replay(call.method, &call.path, call.body.as_ref(), &token)
                        .await;
                    let _ = call.tx.send(result);
                }
                own
            }
            Err(e) => {
                let reason = e.to_string();
                self.force_logout(&reason);
                for call in queued {
                    let _ = call.tx.send(Err(ApiError::RefreshFailed(reason.clone())));
                }
                Err(e)
            }
        }
    }

    /// Replay a request once with the refreshed token. A second 401 here is
    /// terminal — never another refresh.
    async fn replay(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<Envelope, ApiError> {
        match self.execute(method, path, body, Some(token)).await? {
            Outcome::Ok(envelope) => Ok(envelope),
            Outcome::Unauthorized => {
                debug!("{path} still unauthorized after refresh, giving up");
                Err(ApiError::Unauthorized)
            }
            Outcome::Status(status, envelope) => Err(ApiError::Status { status, envelope }),
        }
    }

    /// Call the refresh endpoint exactly once and store the new session.
    async fn refresh_token(&self) -> Result<String, ApiError> {
        let url = format!("{}{}", self.inner.config.base_url, REFRESH_PATH);
        let resp = self
            .inner
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| ApiError::RefreshFailed(format!("transport: {e}")))?;

        if !resp.status().is_success() {
            return Err(ApiError::RefreshFailed(format!(
                "refresh returned {}",
                resp.status()
            )));
        }

        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| ApiError::RefreshFailed(format!("malformed refresh body: {e}")))?;
        let data: RefreshData = serde_json::from_value(envelope.data.unwrap_or(Value::Null))
            .map_err(|e| ApiError::RefreshFailed(format!("malformed refresh payload: {e}")))?;

        self.inner.store.set_token(data.access_token.clone());
        if let Some(user) = data.user {
            self.inner.store.set_user(user);
        }
        info!("access token refreshed");
        Ok(data.access_token)
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Outcome, ApiError> {
        let url = format!("{}{}", self.inner.config.base_url, path);
        let mut req = self.inner.http.request(method, &url);
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(Outcome::Ok(resp.json().await?))
        } else if status == StatusCode::UNAUTHORIZED {
            Ok(Outcome::Unauthorized)
        } else {
            // Keep the backend's envelope for the caller when there is one.
            let envelope = resp.json::<Envelope>().await.ok();
            Ok(Outcome::Status(status.as_u16(), envelope))
        }
    }

    fn force_logout(&self, reason: &str) {
        warn!("logging out: {reason}");
        self.inner.store.clear();
        let _ = self.inner.auth_tx.send(AuthEvent::LoggedOut);

        let current = lock(&self.inner.current_path).clone();
        if !PUBLIC_PATHS.iter().any(|p| current.starts_with(p)) {
            let _ = self.inner.auth_tx.send(AuthEvent::RedirectToLogin);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
