//! Notification router.
//!
//! Dispatches agent-initiated calls and notifications to registered
//! observers. Observers subscribe with a [`MethodFilter`] and either a
//! synchronous callback ([`NotificationRouter::register_handler`]) or a
//! channel feed ([`NotificationRouter::register_channel`]).
//!
//! Callbacks run on the transport's read loop and must not block; work that
//! needs to await should be handed to a task or a channel. A failing or
//! panicking callback is logged and does not affect the others.
//!
//! # Unanswered calls
//!
//! | Situation                                   | Reply sent                 |
//! |---------------------------------------------|----------------------------|
//! | no handler matches the call's method        | `-32601` method not found  |
//! | every matching handler failed or panicked   | `-32603` internal error    |
//! | at least one handler accepted the call      | whatever the handler sends |

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::acp::message::{Message, RequestId, RpcError, INTERNAL_ERROR};
use crate::acp::writer::Wire;
use crate::{AppError, Result};

/// Method-name predicate used to select inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodFilter {
    /// Every method.
    Any,
    /// Exactly this method name.
    Exact(String),
    /// Any method starting with this prefix (e.g. `"fs/"`).
    Prefix(String),
}

impl MethodFilter {
    /// Filter matching exactly `method`.
    #[must_use]
    pub fn exact(method: impl Into<String>) -> Self {
        Self::Exact(method.into())
    }

    /// Filter matching every method under `prefix`.
    #[must_use]
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// Whether `method` is selected by this filter.
    #[must_use]
    pub fn matches(&self, method: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(m) => m == method,
            Self::Prefix(p) => method.starts_with(p.as_str()),
        }
    }
}

/// Shared reply slot for one inbound call.
struct ReplySlot {
    wire: Arc<Wire>,
    answered: AtomicBool,
}

/// An agent-initiated call that expects a response from this side.
///
/// Clones share one reply slot: only the first `respond*` writes to the wire.
#[derive(Clone)]
pub struct InboundCall {
    id: RequestId,
    method: String,
    params: Value,
    reply: Arc<ReplySlot>,
}

impl std::fmt::Debug for InboundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("params", &self.params)
            .field("answered", &self.is_answered())
            .finish()
    }
}

impl InboundCall {
    /// Build a call whose replies go out through `wire`.
    #[must_use]
    pub fn new(id: RequestId, method: String, params: Value, wire: Arc<Wire>) -> Self {
        Self {
            id,
            method,
            params,
            reply: Arc::new(ReplySlot {
                wire,
                answered: AtomicBool::new(false),
            }),
        }
    }

    /// Correlation id chosen by the agent.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Call parameters.
    #[must_use]
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Whether a response has already been written for this call.
    #[must_use]
    pub fn is_answered(&self) -> bool {
        self.reply.answered.load(Ordering::Acquire)
    }

    /// Answer the call with `result`.
    ///
    /// Returns `Ok(false)` if another handler already answered.
    ///
    /// # Errors
    ///
    /// Propagates write failures from the transport.
    pub async fn respond(&self, result: Value) -> Result<bool> {
        self.answer(Ok(result)).await
    }

    /// Answer the call with a structured error.
    ///
    /// Returns `Ok(false)` if another handler already answered.
    ///
    /// # Errors
    ///
    /// Propagates write failures from the transport.
    pub async fn respond_error(&self, error: RpcError) -> Result<bool> {
        self.answer(Err(error)).await
    }

    async fn answer(&self, outcome: std::result::Result<Value, RpcError>) -> Result<bool> {
        if self.reply.answered.swap(true, Ordering::AcqRel) {
            debug!(id = %self.id, method = self.method, "inbound call already answered");
            return Ok(false);
        }
        let message = Message::Response {
            id: self.id.clone(),
            outcome,
        };
        self.reply.wire.send(&message).await?;
        Ok(true)
    }
}

/// One piece of agent-initiated traffic.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A call the agent expects an answer to.
    Call(InboundCall),
    /// A fire-and-forget notification (e.g. `session/update`).
    Notification {
        /// Method name.
        method: String,
        /// Notification parameters.
        params: Value,
    },
}

impl Inbound {
    /// Method name of the call or notification.
    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::Call(call) => call.method(),
            Self::Notification { method, .. } => method,
        }
    }

    /// Parameters of the call or notification.
    #[must_use]
    pub fn params(&self) -> &Value {
        match self {
            Self::Call(call) => call.params(),
            Self::Notification { params, .. } => params,
        }
    }
}

/// Subscription handle returned by registration; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

/// Observer callback signature.
pub type Handler = Arc<dyn Fn(&Inbound) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_token: u64,
    handlers: Vec<(HandlerToken, MethodFilter, Handler)>,
}

/// Fan-out of inbound traffic to observers.
///
/// Cheap to clone; clones share one handler table, so a router built before
/// the first connection keeps its subscriptions across reconnects.
#[derive(Clone, Default)]
pub struct NotificationRouter {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRouter")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl NotificationRouter {
    /// Create a router with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to inbound traffic selected by `filter`.
    pub fn register_handler<F>(&self, filter: MethodFilter, callback: F) -> HandlerToken
    where
        F: Fn(&Inbound) -> Result<()> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(callback);
        let mut registry = self.lock();
        registry.next_token += 1;
        let token = HandlerToken(registry.next_token);
        registry.handlers.push((token, filter, handler));
        token
    }

    /// Subscribe a channel feed to inbound traffic selected by `filter`.
    ///
    /// Once the receiver is dropped the handler reports an error on every
    /// delivery until it is unregistered.
    pub fn register_channel(
        &self,
        filter: MethodFilter,
    ) -> (HandlerToken, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.register_handler(filter, move |inbound| {
            tx.send(inbound.clone())
                .map_err(|_| AppError::Acp("inbound feed receiver dropped".into()))
        });
        (token, rx)
    }

    /// Remove a subscription. Returns `false` for unknown tokens.
    pub fn unregister_handler(&self, token: HandlerToken) -> bool {
        let mut registry = self.lock();
        let before = registry.handlers.len();
        registry.handlers.retain(|(t, _, _)| *t != token);
        registry.handlers.len() != before
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.lock().handlers.len()
    }

    /// Deliver `inbound` to every matching handler.
    ///
    /// Returns the number of handlers that accepted it. Unanswered calls get
    /// a fallback error reply (see the module docs); the reply is written
    /// from a spawned task so the read loop never waits on the write path.
    pub fn dispatch(&self, inbound: &Inbound) -> usize {
        let matching: Vec<(HandlerToken, Handler)> = self
            .lock()
            .handlers
            .iter()
            .filter(|(_, filter, _)| filter.matches(inbound.method()))
            .map(|(token, _, handler)| (*token, Arc::clone(handler)))
            .collect();

        let mut accepted = 0;
        for (token, handler) in &matching {
            match catch_unwind(AssertUnwindSafe(|| handler(inbound))) {
                Ok(Ok(())) => accepted += 1,
                Ok(Err(e)) => {
                    warn!(?token, method = inbound.method(), error = %e, "router: handler failed");
                }
                Err(_) => {
                    warn!(?token, method = inbound.method(), "router: handler panicked");
                }
            }
        }

        if let Inbound::Call(call) = inbound {
            if accepted == 0 {
                let error = if matching.is_empty() {
                    debug!(method = call.method(), "router: no handler for inbound call");
                    RpcError::method_not_found(call.method())
                } else {
                    RpcError::new(INTERNAL_ERROR, "all handlers failed")
                };
                let call = call.clone();
                tokio::spawn(async move {
                    if let Err(e) = call.respond_error(error).await {
                        debug!(method = call.method(), error = %e, "router: fallback reply failed");
                    }
                });
            }
        }

        accepted
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
