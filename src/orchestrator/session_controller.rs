//! Session controller.
//!
//! Tracks the one active agent session and creates new ones through the
//! connection manager.
//!
//! - `create_session` is single-flight: concurrent callers share one
//!   `session/new` call and its outcome.
//! - A failed creation never clears the session that was active before it.
//! - `reset_session` only forgets the local id and needs no connection.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::acp::transport::Transport;
use crate::models::session::{Session, SessionEvent};
use crate::orchestrator::connection_manager::ConnectionManager;
use crate::persistence::kv_store::{KeyValueStore, KEY_SESSION_ID};
use crate::{AppError, Result};

/// Session-creation method name.
pub const METHOD_SESSION_NEW: &str = "session/new";
/// Prompt method name.
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";
/// Cancellation notification name.
pub const METHOD_SESSION_CANCEL: &str = "session/cancel";

const EVENT_CAPACITY: usize = 64;

type SharedCreate = Shared<BoxFuture<'static, Result<Session>>>;

/// Settings for session creation and prompting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Working directory announced in `session/new`.
    pub cwd: PathBuf,
    /// Timeout for `session/prompt`, which runs for a whole agent turn.
    pub prompt_timeout: Duration,
}

struct Inner {
    manager: ConnectionManager,
    settings: SessionSettings,
    store: Arc<dyn KeyValueStore>,
    active: watch::Sender<Option<Session>>,
    events: broadcast::Sender<SessionEvent>,
    in_flight: Mutex<Option<SharedCreate>>,
}

/// Owner of the active-session id. Cheap to clone.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("active", &self.active_session())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Create a controller with no active session.
    #[must_use]
    pub fn new(
        manager: ConnectionManager,
        settings: SessionSettings,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (active, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                manager,
                settings,
                store,
                active,
                events,
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Create a new agent session and make it the active one.
    ///
    /// Connects first if needed. A call made while another creation is in
    /// flight waits for and returns that creation's outcome.
    ///
    /// # Errors
    ///
    /// Connect errors are returned unchanged; a failed or malformed
    /// `session/new` answer becomes [`AppError::SessionCreationFailed`]. In
    /// both cases the previously active session stays active.
    pub async fn create_session(&self) -> Result<String> {
        let creation = {
            let mut in_flight = lock(&self.inner.in_flight);
            if let Some(shared) = in_flight.as_ref() {
                shared.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move {
                    let outcome = inner.create().await;
                    *lock(&inner.in_flight) = None;
                    outcome
                });
                let shared = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(AppError::SessionCreationFailed(format!("creation task failed: {e}")))
                    })
                }
                .boxed()
                .shared();
                *in_flight = Some(shared.clone());
                shared
            }
        };
        creation.await.map(|session| session.session_id)
    }

    /// Forget the active session. Works while disconnected.
    pub fn reset_session(&self) {
        let previous = self.inner.active.send_replace(None);
        self.inner.store.remove(KEY_SESSION_ID);
        if let Some(previous) = previous {
            info!(session_id = previous.session_id, "session reset");
            let _ = self.inner.events.send(SessionEvent::Reset {
                previous: previous.session_id,
            });
        }
    }

    /// Snapshot of the active session.
    #[must_use]
    pub fn active_session(&self) -> Option<Session> {
        self.inner.active.borrow().clone()
    }

    /// Id of the active session.
    #[must_use]
    pub fn active_session_id(&self) -> Option<String> {
        self.inner
            .active
            .borrow()
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    /// Receiver that always holds the latest active session.
    #[must_use]
    pub fn watch_active(&self) -> watch::Receiver<Option<Session>> {
        self.inner.active.subscribe()
    }

    /// Receiver for created/reset events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Send a text prompt to the active session and wait for the turn result.
    ///
    /// # Errors
    ///
    /// - [`AppError::Acp`] if there is no active session.
    /// - [`AppError::ConnectionLost`] if the session's connection is gone or
    ///   has since been replaced.
    /// - Any error of the `session/prompt` call itself.
    pub async fn prompt(&self, text: &str) -> Result<Value> {
        let (session, transport) = self.session_on_live_connection()?;
        transport
            .request(
                METHOD_SESSION_PROMPT,
                json!({
                    "sessionId": session.session_id,
                    "prompt": [{ "type": "text", "text": text }]
                }),
                self.inner.settings.prompt_timeout,
            )
            .await
    }

    /// Ask the agent to stop the active session's current turn.
    ///
    /// # Errors
    ///
    /// Same preconditions as [`Self::prompt`].
    pub async fn cancel(&self) -> Result<()> {
        let (session, transport) = self.session_on_live_connection()?;
        transport
            .notify(
                METHOD_SESSION_CANCEL,
                json!({ "sessionId": session.session_id }),
            )
            .await
    }

    /// The active session and the transport it was created on. Never
    /// connects: a session cannot outlive its connection.
    fn session_on_live_connection(&self) -> Result<(Session, Arc<Transport>)> {
        let session = self
            .active_session()
            .ok_or_else(|| AppError::Acp("no active session".into()))?;
        let transport = self.inner.manager.transport().ok_or_else(|| {
            AppError::ConnectionLost(format!(
                "session {} has no live connection",
                session.session_id
            ))
        })?;
        if transport.id() != session.connection_id {
            return Err(AppError::ConnectionLost(format!(
                "session {} belongs to a previous connection",
                session.session_id
            )));
        }
        Ok((session, transport))
    }
}

impl Inner {
    async fn create(&self) -> Result<Session> {
        let transport = self.manager.connect().await?;
        let params = json!({
            "cwd": self.settings.cwd.to_string_lossy(),
            "mcpServers": []
        });

        let result = transport
            .send(METHOD_SESSION_NEW, params)
            .await
            .map_err(|e| {
                warn!(error = %e, "session/new failed");
                AppError::SessionCreationFailed(e.to_string())
            })?;

        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AppError::SessionCreationFailed(format!("response has no sessionId: {result}"))
            })?
            .to_owned();

        let session = Session::new(session_id, transport.id());
        self.active.send_replace(Some(session.clone()));
        self.store.put(KEY_SESSION_ID, &session.session_id);
        info!(
            session_id = session.session_id,
            connection_id = %session.connection_id,
            "session created"
        );
        let _ = self.events.send(SessionEvent::Created(session.clone()));
        Ok(session)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
