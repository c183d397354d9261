use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::UserSummary;

/// Client-side auth state. Populated on login/registration/OAuth completion
/// or token refresh; cleared on logout or terminal refresh failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub access_token: Option<String>,
    pub user: Option<UserSummary>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    /// A null token means unauthenticated, regardless of a stale cached user.
    pub fn current_user(&self) -> Option<&UserSummary> {
        if self.access_token.is_some() {
            self.user.as_ref()
        } else {
            None
        }
    }
}

/// Durable session storage backed by a JSON file, so the session survives
/// client restarts. In-memory state is authoritative; a failed disk write is
/// logged and the session keeps operating from memory.
pub struct SessionStore {
    path: PathBuf,
    session: Mutex<Session>,
}

impl SessionStore {
    /// Open the store at `path`, loading any persisted session. A missing or
    /// corrupt file starts an empty session.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let session = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Session>(&text) {
                Ok(session) => {
                    info!("session loaded from {}", path.display());
                    session
                }
                Err(e) => {
                    warn!("corrupt session file {}: {}", path.display(), e);
                    Session::default()
                }
            },
            Err(_) => Session::default(),
        };

        Self {
            path,
            session: Mutex::new(session),
        }
    }

    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.lock().access_token.clone()
    }

    pub fn current_user(&self) -> Option<UserSummary> {
        self.lock().current_user().cloned()
    }

    /// Replace token and user together (login/registration/OAuth completion).
    pub fn set(&self, access_token: String, user: Option<UserSummary>) {
        let mut session = self.lock();
        session.access_token = Some(access_token);
        session.user = user;
        self.persist(&mut session);
    }

    /// Store a refreshed token. Keeps the cached user when the refresh
    /// payload omits one.
    pub fn set_token(&self, access_token: String) {
        let mut session = self.lock();
        session.access_token = Some(access_token);
        self.persist(&mut session);
    }

    pub fn set_user(&self, user: UserSummary) {
        let mut session = self.lock();
        session.user = Some(user);
        self.persist(&mut session);
    }

    /// Clear token and user together (logout / terminal refresh failure).
    pub fn clear(&self) {
        let mut session = self.lock();
        session.access_token = None;
        session.user = None;
        self.persist(&mut session);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Session> {
        // Lock poisoning only happens if a holder panicked; the session data
        // itself is still coherent, so keep going with it.
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, session: &mut Session) {
        session.saved_at = Some(Utc::now());
        match serde_json::to_string_pretty(session) {
            Ok(text) => {
                if let Err(e) = fs::write(&self.path, text) {
                    warn!("failed to persist session to {}: {}", self.path.display(), e);
                }
            }
            Err(e) => warn!("failed to serialize session: {}", e),
        }
    }
}
