//! Connection manager.
//!
//! Owns the one logical connection to the agent: its [`ConnectionState`],
//! the live [`Transport`], and the spawn/handshake sequence that produces it.
//!
//! # Single writer
//!
//! The phase slot (idle / connecting / connected) and the published state
//! change together under one `std::sync::Mutex` that is never held across
//! an `.await`. A connect attempt runs in its own task; its outcome is a
//! [`Shared`] future parked in the slot, so every concurrent `connect()`
//! caller attaches to the same attempt and no second process is spawned.
//!
//! # Loss and reconnection
//!
//! A watcher task awaits [`Transport::closed`]. An unrequested close of the
//! current transport moves the state to `Reconnecting`; what happens next is
//! decided by [`ReconnectPolicy`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::handshake::{self, HandshakePolicy};
use crate::acp::router::NotificationRouter;
use crate::acp::spawner::AgentLauncher;
use crate::acp::transport::{Disconnect, Transport};
use crate::models::connection::ConnectionState;
use crate::orchestrator::endpoint::{candidates, Endpoint, EndpointPlan};
use crate::persistence::kv_store::{KeyValueStore, KEY_PREFERRED_ENDPOINT};
use crate::{AppError, Result};

/// What to do after the live connection is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Stay in `Reconnecting` until a collaborator calls `connect()`.
    Manual,
    /// Retry on a doubling backoff; settle in `Failed` after `max_attempts`.
    Auto {
        /// Number of reconnect attempts before giving up.
        max_attempts: u32,
        /// Delay before the first attempt.
        initial_backoff: Duration,
        /// Upper bound for the delay between attempts.
        max_backoff: Duration,
    },
}

/// Runtime settings for a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Candidate generation inputs.
    pub endpoints: EndpointPlan,
    /// Readiness handshake bounds.
    pub handshake: HandshakePolicy,
    /// Default timeout for application calls.
    pub request_timeout: Duration,
    /// Behaviour after an unexpected loss.
    pub reconnect: ReconnectPolicy,
}

/// Buffered state changes per [`ConnectionManager::state_events`] receiver.
const STATE_EVENT_CAPACITY: usize = 64;

type SharedConnect = Shared<BoxFuture<'static, Result<Arc<Transport>>>>;

enum Phase {
    Idle,
    Connecting {
        generation: u64,
        attempt: SharedConnect,
        cancel: CancellationToken,
    },
    Connected(Arc<Transport>),
}

struct Slot {
    phase: Phase,
    generation: u64,
}

enum Settled {
    Connected(Arc<Transport>),
    Failed(AppError),
    Superseded(Option<Arc<Transport>>),
}

struct Inner {
    launcher: Arc<dyn AgentLauncher>,
    settings: ConnectionSettings,
    router: NotificationRouter,
    store: Arc<dyn KeyValueStore>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionState>,
    slot: Mutex<Slot>,
    preferred: Mutex<Option<Endpoint>>,
    capabilities: Mutex<Option<Value>>,
    last_disconnect: Mutex<Option<Disconnect>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

/// Supervisor of the agent connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("preferred", &self.preferred_endpoint())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    ///
    /// A previously remembered endpoint is loaded from `store`.
    #[must_use]
    pub fn new(
        launcher: Arc<dyn AgentLauncher>,
        settings: ConnectionSettings,
        router: NotificationRouter,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let preferred = store
            .get(KEY_PREFERRED_ENDPOINT)
            .and_then(|raw| raw.parse::<Endpoint>().ok());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                launcher,
                settings,
                router,
                store,
                state_tx,
                events_tx,
                slot: Mutex::new(Slot {
                    phase: Phase::Idle,
                    generation: 0,
                }),
                preferred: Mutex::new(preferred),
                capabilities: Mutex::new(None),
                last_disconnect: Mutex::new(None),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    /// Ensure a live connection and return its transport.
    ///
    /// Returns the established transport when connected, joins the attempt
    /// already in flight when connecting, and otherwise starts a new attempt.
    ///
    /// # Errors
    ///
    /// The connection-level error of the last candidate tried
    /// ([`AppError::EndpointUnavailable`], [`AppError::ProcessSpawnFailed`],
    /// or [`AppError::HandshakeTimeout`]), or [`AppError::ConnectionLost`] if
    /// `disconnect()` interrupted the attempt.
    pub async fn connect(&self) -> Result<Arc<Transport>> {
        self.inner.connect_with(ConnectionState::Failed).await
    }

    /// Tear down the connection and settle in `Disconnected`.
    ///
    /// Cancels any reconnect loop. An attempt in flight is cancelled and its
    /// waiters receive [`AppError::ConnectionLost`]; this returns only after
    /// the attempt has stopped launching and closed what it started.
    pub async fn disconnect(&self) {
        let (transport, abandoned) = {
            let mut slot = self.inner.lock_slot();
            let previous = std::mem::replace(&mut slot.phase, Phase::Idle);
            self.inner.transition(ConnectionState::Disconnected);
            match previous {
                Phase::Connected(t) => (Some(t), None),
                Phase::Connecting {
                    attempt, cancel, ..
                } => {
                    cancel.cancel();
                    (None, Some(attempt))
                }
                Phase::Idle => (None, None),
            }
        };
        if let Some(handle) = lock(&self.inner.reconnect_task).take() {
            handle.abort();
        }
        if let Some(attempt) = abandoned {
            let _ = attempt.await;
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    /// Connect on demand and issue an application call.
    ///
    /// # Errors
    ///
    /// Any connect error, or the call's own error.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.connect().await?.send(method, params).await
    }

    /// Connect on demand and send a notification.
    ///
    /// # Errors
    ///
    /// Any connect error, or [`AppError::ConnectionLost`].
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.connect().await?.notify(method, params).await
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver for the latest state; intermediate states may be skipped.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Feed of every state change, in order, from now on.
    #[must_use]
    pub fn state_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.events_tx.subscribe()
    }

    /// The established transport, if connected.
    #[must_use]
    pub fn transport(&self) -> Option<Arc<Transport>> {
        match &self.inner.lock_slot().phase {
            Phase::Connected(t) if !t.is_closed() => Some(Arc::clone(t)),
            _ => None,
        }
    }

    /// Why the last connection went away, including the agent's stderr tail.
    #[must_use]
    pub fn last_disconnect(&self) -> Option<Disconnect> {
        lock(&self.inner.last_disconnect).clone()
    }

    /// Endpoint tried first on the next connect.
    #[must_use]
    pub fn preferred_endpoint(&self) -> Option<Endpoint> {
        *lock(&self.inner.preferred)
    }

    /// Capabilities the agent returned from its last successful handshake.
    #[must_use]
    pub fn agent_capabilities(&self) -> Option<Value> {
        lock(&self.inner.capabilities).clone()
    }

    /// Router that receives agent-initiated traffic for every connection.
    #[must_use]
    pub fn router(&self) -> &NotificationRouter {
        &self.inner.router
    }
}

impl Inner {
    async fn connect_with(
        self: &Arc<Self>,
        on_failure: ConnectionState,
    ) -> Result<Arc<Transport>> {
        let attempt = {
            let mut slot = self.lock_slot();
            match &slot.phase {
                Phase::Connected(t) if !t.is_closed() => return Ok(Arc::clone(t)),
                Phase::Connecting { attempt, .. } => attempt.clone(),
                Phase::Connected(_) | Phase::Idle => self.begin_attempt(&mut slot, on_failure),
            }
        };
        attempt.await
    }

    /// Start a spawn/handshake task and park its shared outcome in `slot`.
    fn begin_attempt(self: &Arc<Self>, slot: &mut Slot, on_failure: ConnectionState) -> SharedConnect {
        if let Phase::Connected(stale) = &slot.phase {
            // Closed but the loss watcher has not run yet.
            *lock(&self.last_disconnect) = stale.disconnect();
            self.transition(ConnectionState::Reconnecting);
        }
        if self.state() != ConnectionState::Reconnecting {
            self.transition(ConnectionState::Connecting);
        }

        slot.generation += 1;
        let generation = slot.generation;
        let cancel = CancellationToken::new();
        let inner = Arc::clone(self);
        let token = cancel.clone();
        let task =
            tokio::spawn(async move { inner.establish(generation, on_failure, token).await });
        let attempt = async move {
            task.await
                .unwrap_or_else(|e| Err(AppError::Acp(format!("connect task failed: {e}"))))
        }
        .boxed()
        .shared();

        slot.phase = Phase::Connecting {
            generation,
            attempt: attempt.clone(),
            cancel,
        };
        attempt
    }

    async fn establish(
        self: Arc<Self>,
        generation: u64,
        on_failure: ConnectionState,
        cancel: CancellationToken,
    ) -> Result<Arc<Transport>> {
        let outcome = self.try_candidates(&cancel).await;

        match self.settle(generation, on_failure, outcome) {
            Settled::Connected(transport) => {
                self.remember(transport.endpoint());
                tokio::spawn(Arc::clone(&self).watch_loss(Arc::clone(&transport)));
                Ok(transport)
            }
            Settled::Failed(err) => Err(err),
            Settled::Superseded(orphan) => {
                if let Some(transport) = orphan {
                    transport.close().await;
                }
                Err(abandoned())
            }
        }
    }

    /// Record the outcome of attempt `generation` unless `disconnect()`
    /// abandoned it in the meantime.
    fn settle(
        &self,
        generation: u64,
        on_failure: ConnectionState,
        outcome: Result<Arc<Transport>>,
    ) -> Settled {
        let mut slot = self.lock_slot();
        let current =
            matches!(slot.phase, Phase::Connecting { generation: g, .. } if g == generation);
        if !current {
            return Settled::Superseded(outcome.ok());
        }

        match outcome {
            Ok(transport) => {
                slot.phase = Phase::Connected(Arc::clone(&transport));
                self.transition(ConnectionState::Connected);
                Settled::Connected(transport)
            }
            Err(err) => {
                slot.phase = Phase::Idle;
                self.transition(on_failure);
                Settled::Failed(err)
            }
        }
    }

    /// Walk the candidate list; the first endpoint to finish the handshake wins.
    ///
    /// Stops as soon as `cancel` fires, without launching further candidates.
    async fn try_candidates(&self, cancel: &CancellationToken) -> Result<Arc<Transport>> {
        let preferred = *lock(&self.preferred);
        let list = candidates(&self.settings.endpoints, preferred);
        let total = list.len();
        let mut occupied = 0_usize;
        let mut last_error: Option<AppError> = None;

        for endpoint in list {
            if cancel.is_cancelled() {
                return Err(abandoned());
            }
            if self.launcher.is_occupied(&endpoint).await {
                info!(%endpoint, "endpoint occupied by a foreign listener, skipping");
                occupied += 1;
                continue;
            }

            match self.try_endpoint(endpoint, cancel).await {
                Ok(transport) => return Ok(transport),
                Err(err) if cancel.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(%endpoint, error = %err, "endpoint candidate failed");
                    last_error = Some(err);
                }
            }
        }

        // A launched candidate's failure says more than an occupied port.
        let last = last_error.unwrap_or_else(|| {
            AppError::EndpointUnavailable(if total == 0 {
                "no endpoint candidates".into()
            } else {
                format!("{occupied} of {total} endpoint(s) occupied")
            })
        });
        Err(last.with_context(&format!("all {total} endpoint candidate(s) failed")))
    }

    async fn try_endpoint(
        &self,
        endpoint: Endpoint,
        cancel: &CancellationToken,
    ) -> Result<Arc<Transport>> {
        let io = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(abandoned()),
            io = self.launcher.launch(&endpoint) => io?,
        };
        let transport = Transport::start(
            endpoint,
            io,
            self.router.clone(),
            self.settings.request_timeout,
        );

        let ready = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(abandoned()),
            ready = handshake::await_ready(&transport, &self.settings.handshake) => ready,
        };
        match ready {
            Ok(capabilities) => {
                *lock(&self.capabilities) = Some(capabilities);
                Ok(transport)
            }
            Err(err) => {
                transport.close().await;
                Err(err)
            }
        }
    }

    async fn watch_loss(self: Arc<Self>, transport: Arc<Transport>) {
        let disconnect = transport.closed().await;

        let lost = {
            let mut slot = self.lock_slot();
            let current = matches!(&slot.phase, Phase::Connected(t) if Arc::ptr_eq(t, &transport));
            if !current {
                debug!(connection_id = %transport.id(), "loss of superseded transport ignored");
                return;
            }
            slot.phase = Phase::Idle;
            let lost = !disconnect.requested;
            *lock(&self.last_disconnect) = Some(disconnect);
            self.transition(if lost {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Disconnected
            });
            lost
        };

        if let (true, ReconnectPolicy::Auto { max_attempts, initial_backoff, max_backoff }) =
            (lost, self.settings.reconnect)
        {
            let handle = tokio::spawn(Arc::clone(&self).reconnect_loop(
                max_attempts,
                initial_backoff,
                max_backoff,
            ));
            if let Some(previous) = lock(&self.reconnect_task).replace(handle) {
                previous.abort();
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>, max_attempts: u32, initial: Duration, max: Duration) {
        let mut backoff = initial;
        for attempt in 1..=max_attempts {
            tokio::time::sleep(backoff).await;
            if self.state() != ConnectionState::Reconnecting {
                debug!(attempt, state = %self.state(), "reconnect loop superseded");
                return;
            }

            let on_failure = if attempt == max_attempts {
                ConnectionState::Failed
            } else {
                ConnectionState::Reconnecting
            };
            match self.connect_with(on_failure).await {
                Ok(transport) => {
                    info!(attempt, connection_id = %transport.id(), "reconnected");
                    return;
                }
                Err(err) => warn!(attempt, max_attempts, error = %err, "reconnect attempt failed"),
            }
            backoff = backoff.saturating_mul(2).min(max);
        }
    }

    fn remember(&self, endpoint: Endpoint) {
        *lock(&self.preferred) = Some(endpoint);
        self.store.put(KEY_PREFERRED_ENDPOINT, &endpoint.to_string());
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Publish `next`. Callers hold the slot lock.
    fn transition(&self, next: ConnectionState) {
        let previous = self.state();
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "unexpected connection state transition");
        }
        self.state_tx.send_replace(next);
        // No subscribers is fine.
        let _ = self.events_tx.send(next);
        info!(from = %previous, to = %next, "connection state changed");
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        lock(&self.slot)
    }
}

fn abandoned() -> AppError {
    AppError::ConnectionLost("disconnected during connect".into())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
