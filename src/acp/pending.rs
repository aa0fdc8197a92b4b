//! Pending call registry.
//!
//! Correlates outbound call ids with their eventual outcome. Every
//! registered call is fulfilled exactly once, by exactly one of
//! [`PendingCalls::resolve`], [`PendingCalls::reject`],
//! [`PendingCalls::expire`], or [`PendingCalls::cancel_all`]. Each of those
//! removes the entry before sending, so whichever runs second finds nothing
//! and reports `false`.
//!
//! The table sits behind a `std::sync::Mutex` because no lock is ever held
//! across an `.await`, and [`PendingReply`] needs to deregister from `Drop`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::acp::message::RpcError;
use crate::{AppError, Result};

/// Outstanding call awaiting its response.
#[derive(Debug)]
struct PendingCall {
    method: String,
    created_at: Instant,
    timeout: Duration,
    slot: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Default)]
struct Table {
    next_id: u64,
    calls: HashMap<u64, PendingCall>,
    /// Set once by `cancel_all`; later registrations fail immediately.
    closed: Option<String>,
}

/// Registry of outstanding calls for one transport.
#[derive(Debug, Default)]
pub struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a fresh id and store a pending call for `method`.
    ///
    /// Ids start at 1 and are never reused within one registry.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionLost`] if the registry has already been
    /// cancelled by [`Self::cancel_all`].
    pub fn register(self: &Arc<Self>, method: &str, timeout: Duration) -> Result<PendingReply> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock();
        if let Some(reason) = &table.closed {
            return Err(AppError::ConnectionLost(reason.clone()));
        }
        table.next_id += 1;
        let id = table.next_id;
        table.calls.insert(
            id,
            PendingCall {
                method: method.to_owned(),
                created_at: Instant::now(),
                timeout,
                slot: tx,
            },
        );
        Ok(PendingReply {
            id,
            rx: Some(rx),
            deadline: tokio::time::Instant::now() + timeout,
            registry: Arc::clone(self),
        })
    }

    /// Fulfil call `id` with a successful result.
    ///
    /// Returns `false` (and logs) for unknown or already-fulfilled ids.
    pub fn resolve(&self, id: u64, result: Value) -> bool {
        self.fulfil(id, Ok(result), "resolve")
    }

    /// Fulfil call `id` with the agent's structured error.
    ///
    /// Returns `false` (and logs) for unknown or already-fulfilled ids.
    pub fn reject(&self, id: u64, error: RpcError) -> bool {
        self.fulfil(id, Err(AppError::Remote(error)), "reject")
    }

    /// Fulfil call `id` with [`AppError::RequestTimeout`].
    ///
    /// Returns `false` if the call was already fulfilled.
    pub fn expire(&self, id: u64) -> bool {
        let Some(call) = self.lock().calls.remove(&id) else {
            return false;
        };
        let err = AppError::RequestTimeout(format!(
            "{} (id {id}) not answered within {:?}",
            call.method, call.timeout
        ));
        // The receiver may already be gone; nothing to do then.
        let _ = call.slot.send(Err(err));
        true
    }

    /// Fulfil every outstanding call with [`AppError::ConnectionLost`] and
    /// refuse further registrations.
    ///
    /// Returns the number of calls that were cancelled. A second invocation
    /// finds an empty table and returns 0.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, PendingCall)> = {
            let mut table = self.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.to_owned());
            }
            table.calls.drain().collect()
        };
        let count = drained.len();
        for (id, call) in drained {
            debug!(id, method = call.method, "pending call cancelled");
            let _ = call
                .slot
                .send(Err(AppError::ConnectionLost(reason.to_owned())));
        }
        count
    }

    /// Number of calls still awaiting an outcome.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.lock().calls.len()
    }

    fn fulfil(&self, id: u64, outcome: Result<Value>, op: &str) -> bool {
        let Some(call) = self.lock().calls.remove(&id) else {
            debug!(id, op, "response for unknown or settled call ignored");
            return false;
        };
        debug!(
            id,
            method = call.method,
            elapsed_ms = u64::try_from(call.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            op,
            "pending call settled"
        );
        let _ = call.slot.send(outcome);
        true
    }

    fn forget(&self, id: u64) {
        self.lock().calls.remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Waitable handle for one registered call.
///
/// Dropping the handle before the outcome arrives removes the entry, so an
/// abandoned call does not linger in the table.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    rx: Option<oneshot::Receiver<Result<Value>>>,
    deadline: tokio::time::Instant,
    registry: Arc<PendingCalls>,
}

impl PendingReply {
    /// Correlation id allocated for this call.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the call's timeout runs out, counted from registration.
    #[must_use]
    pub fn deadline(&self) -> tokio::time::Instant {
        self.deadline
    }

    /// Wait for the outcome, expiring the call when its deadline passes.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::RequestTimeout`], [`AppError::ConnectionLost`], or
    /// [`AppError::Remote`] depending on how the call was fulfilled.
    pub async fn wait(mut self) -> Result<Value> {
        let Some(mut rx) = self.rx.take() else {
            return Err(AppError::Acp(format!("call {} already awaited", self.id)));
        };
        match tokio::time::timeout_at(self.deadline, &mut rx).await {
            Ok(outcome) => flatten(outcome),
            Err(_elapsed) => {
                // If expire() loses the race, the winner's outcome is already
                // in the channel.
                self.registry.expire(self.id);
                flatten(rx.await)
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        // No-op once the call has been settled.
        self.registry.forget(self.id);
    }
}

fn flatten(outcome: std::result::Result<Result<Value>, oneshot::error::RecvError>) -> Result<Value> {
    outcome.unwrap_or_else(|_| Err(AppError::ConnectionLost("pending call dropped".into())))
}
