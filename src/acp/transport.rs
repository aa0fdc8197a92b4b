//! ACP transport.
//!
//! A [`Transport`] owns one launched agent: its byte channels, its process
//! handle, and the tasks that service them.
//!
//! - **Read loop**: drives a [`FramedRead`] with [`MessageCodec`]. Responses
//!   go to the [`PendingCalls`] table by id; calls and notifications go to the
//!   [`NotificationRouter`]. Malformed lines are logged, counted, and
//!   skipped.
//! - **Write path**: every outbound line goes through one [`Wire`].
//! - **Exit monitor**: awaits the child process; on exit the transport
//!   closes with the exit status and the tail of the agent's stderr.
//!
//! Closing happens exactly once no matter how many paths race to it
//! (process exit, stream EOF, write failure, explicit [`Transport::close`]):
//! the first one cancels every pending call and publishes a [`Disconnect`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acp::codec::MessageCodec;
use crate::acp::message::{Message, RequestId};
use crate::acp::pending::PendingCalls;
use crate::acp::router::{Inbound, InboundCall, NotificationRouter};
use crate::acp::spawner::{terminate_child, AgentIo, BoxedReader, TERMINATE_GRACE};
use crate::acp::writer::Wire;
use crate::orchestrator::endpoint::Endpoint;
use crate::{AppError, Result};

/// Number of agent stderr lines retained for diagnostics.
pub const STDERR_TAIL_LINES: usize = 64;

/// How long a stream EOF waits for the exit monitor to report the exit
/// status before closing with a generic reason.
const EXIT_SETTLE: Duration = Duration::from_millis(250);

/// How long the exit monitor waits for stderr to drain after the process
/// has exited.
const STDERR_SETTLE: Duration = Duration::from_millis(100);

/// Why and how a transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Human-readable reason (e.g. `process exited with code 1`).
    pub reason: String,
    /// `true` when the client asked for the close; `false` for a loss.
    pub requested: bool,
    /// Process exit code, if the process exited and reported one.
    pub exit_code: Option<i32>,
    /// Last lines the agent wrote to stderr, oldest first.
    pub stderr_tail: Vec<String>,
}

/// Live JSON-RPC channel to one agent.
pub struct Transport {
    id: Uuid,
    endpoint: Endpoint,
    wire: Arc<Wire>,
    pending: Arc<PendingCalls>,
    router: NotificationRouter,
    request_timeout: Duration,
    shutdown: CancellationToken,
    closing: AtomicBool,
    closed_tx: watch::Sender<Option<Disconnect>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    parse_errors: AtomicU64,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .field("outstanding", &self.pending.outstanding())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Take ownership of `io` and start the read loop, stderr capture, and
    /// exit monitor. Must be called from within a tokio runtime.
    ///
    /// Calls without an explicit timeout use `request_timeout`.
    #[must_use]
    pub fn start(
        endpoint: Endpoint,
        io: AgentIo,
        router: NotificationRouter,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let (closed_tx, _) = watch::channel(None);
        let transport = Arc::new(Self {
            id,
            endpoint,
            wire: Arc::new(Wire::new(id.to_string(), io.writer)),
            pending: PendingCalls::new(),
            router,
            request_timeout,
            shutdown: CancellationToken::new(),
            closing: AtomicBool::new(false),
            closed_tx,
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            parse_errors: AtomicU64::new(0),
            monitor: Mutex::new(None),
        });

        let stderr_task = io
            .stderr
            .map(|stderr| tokio::spawn(capture_stderr(id, stderr, Arc::clone(&transport.stderr_tail))));

        tokio::spawn(Arc::clone(&transport).read_loop(io.reader));

        if let Some(child) = io.child {
            let handle = tokio::spawn(Arc::clone(&transport).monitor_exit(child, stderr_task));
            *lock(&transport.monitor) = Some(handle);
        }

        debug!(connection_id = %id, %endpoint, "transport started");
        transport
    }

    /// Unique id of this connection instance.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Endpoint the agent was launched on.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Whether the transport has closed (for any reason).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn outstanding_calls(&self) -> usize {
        self.pending.outstanding()
    }

    /// Number of inbound lines dropped as unparseable or unclassifiable.
    #[must_use]
    pub fn parse_error_count(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Snapshot of the close reason, if the transport has closed.
    #[must_use]
    pub fn disconnect(&self) -> Option<Disconnect> {
        self.closed_tx.borrow().clone()
    }

    /// Wait until the transport closes and return why.
    pub async fn closed(&self) -> Disconnect {
        let mut rx = self.closed_tx.subscribe();
        let seen = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        seen.unwrap_or_else(|| Disconnect {
            reason: "transport dropped".into(),
            requested: false,
            exit_code: None,
            stderr_tail: Vec::new(),
        })
    }

    /// Issue a call with the default request timeout and await its result.
    ///
    /// # Errors
    ///
    /// [`AppError::RequestTimeout`], [`AppError::ConnectionLost`], or
    /// [`AppError::Remote`].
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.request(method, params, self.request_timeout).await
    }

    /// Issue a call with an explicit timeout and await its result.
    ///
    /// `timeout` bounds the write and the wait together.
    ///
    /// # Errors
    ///
    /// [`AppError::RequestTimeout`], [`AppError::ConnectionLost`], or
    /// [`AppError::Remote`].
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let reply = self.pending.register(method, timeout)?;
        let message = Message::Call {
            id: RequestId::Number(reply.id()),
            method: method.to_owned(),
            params,
        };
        debug!(connection_id = %self.id, id = reply.id(), method, "acp call");

        match self.wire.send_until(&message, reply.deadline()).await {
            Ok(()) => {}
            Err(AppError::Io(msg)) => {
                // Closing cancels this call too, so wait() reports ConnectionLost.
                self.finish(msg, None, false);
            }
            Err(err @ AppError::RequestTimeout(_)) => {
                drop(reply);
                self.close_if_stalled();
                return Err(err);
            }
            Err(other) => return Err(other),
        }
        reply.wait().await
    }

    /// Send a notification; no response is expected.
    ///
    /// The write is bounded by the default request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionLost`] if the transport is closed or the
    /// write fails, and [`AppError::RequestTimeout`] if the write does not
    /// complete in time.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if let Some(d) = self.disconnect() {
            return Err(AppError::ConnectionLost(d.reason));
        }
        let message = Message::Notification {
            method: method.to_owned(),
            params,
        };
        let deadline = tokio::time::Instant::now() + self.request_timeout;
        match self.wire.send_until(&message, deadline).await {
            Ok(()) => Ok(()),
            Err(AppError::Io(msg)) => {
                self.finish(msg.clone(), None, false);
                Err(AppError::ConnectionLost(msg))
            }
            Err(err @ AppError::RequestTimeout(_)) => {
                self.close_if_stalled();
                Err(err)
            }
            Err(other) => Err(other),
        }
    }

    /// A line abandoned mid-write corrupts the stream; treat it as a loss.
    fn close_if_stalled(&self) {
        if self.wire.is_stalled() {
            self.finish("write stalled: agent stopped reading".into(), None, false);
        }
    }

    /// Tear the connection down: cancel pending calls, terminate the
    /// process, and close the streams. Idempotent; safe to race with a
    /// natural process exit.
    pub async fn close(&self) {
        self.finish("closed by client".into(), None, true);

        let monitor = lock(&self.monitor).take();
        if let Some(handle) = monitor {
            if let Err(err) = handle.await {
                debug!(connection_id = %self.id, %err, "exit monitor ended abnormally");
            }
        }

        if tokio::time::timeout(TERMINATE_GRACE, self.wire.shutdown())
            .await
            .is_err()
        {
            debug!(connection_id = %self.id, "writer shutdown timed out");
        }
    }

    /// Close exactly once. Returns `false` if already closed.
    fn finish(&self, reason: String, exit_code: Option<i32>, requested: bool) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }

        let cancelled = self.pending.cancel_all(&reason);
        self.shutdown.cancel();
        let stderr_tail: Vec<String> = lock(&self.stderr_tail).iter().cloned().collect();

        if requested {
            info!(connection_id = %self.id, endpoint = %self.endpoint, cancelled, "transport closed");
        } else {
            warn!(
                connection_id = %self.id,
                endpoint = %self.endpoint,
                reason,
                exit_code,
                cancelled,
                stderr_lines = stderr_tail.len(),
                "transport lost"
            );
        }

        self.closed_tx.send_replace(Some(Disconnect {
            reason,
            requested,
            exit_code,
            stderr_tail,
        }));
        true
    }

    async fn read_loop(self: Arc<Self>, reader: BoxedReader) {
        let mut framed = FramedRead::new(reader, MessageCodec::new());

        let reason = loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    debug!(connection_id = %self.id, "acp reader: shutdown, stopping");
                    return;
                }

                item = framed.next() => match item {
                    None => break "stream closed".to_owned(),
                    Some(Err(e)) => break format!("stream error: {e}"),
                    Some(Ok(Err(e))) => {
                        self.parse_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(connection_id = %self.id, error = %e, "acp reader: skipping line");
                    }
                    Some(Ok(Ok(message))) => self.dispatch(message),
                },
            }
        };

        // Stdout usually closes just before the exit status is available;
        // let the monitor report the richer reason when it can.
        let has_monitor = lock(&self.monitor).is_some();
        if has_monitor && tokio::time::timeout(EXIT_SETTLE, self.closed()).await.is_ok() {
            return;
        }
        self.finish(reason, None, false);
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::Response { id, outcome } => {
                let Some(id) = own_call_id(&id) else {
                    debug!(connection_id = %self.id, %id, "acp reader: response for foreign id ignored");
                    return;
                };
                match outcome {
                    Ok(result) => self.pending.resolve(id, result),
                    Err(error) => self.pending.reject(id, error),
                };
            }
            Message::Call { id, method, params } => {
                let call = InboundCall::new(id, method, params, Arc::clone(&self.wire));
                self.router.dispatch(&Inbound::Call(call));
            }
            Message::Notification { method, params } => {
                self.router.dispatch(&Inbound::Notification { method, params });
            }
        }
    }

    async fn monitor_exit(self: Arc<Self>, mut child: Child, stderr: Option<JoinHandle<()>>) {
        tokio::select! {
            result = child.wait() => {
                let (exit_code, reason) = match result {
                    Ok(status) => {
                        let code = status.code();
                        let reason = code.map_or_else(
                            || "process terminated by signal".to_owned(),
                            |c| format!("process exited with code {c}"),
                        );
                        (code, reason)
                    }
                    Err(err) => (None, format!("wait error: {err}")),
                };
                if let Some(handle) = stderr {
                    let _ = tokio::time::timeout(STDERR_SETTLE, handle).await;
                }
                self.finish(reason, exit_code, false);
            }
            () = self.shutdown.cancelled() => {
                terminate_child(&mut child, TERMINATE_GRACE).await;
                debug!(connection_id = %self.id, "exit monitor: agent terminated");
            }
        }
    }
}

/// Read the agent's stderr line by line into the bounded diagnostic tail.
async fn capture_stderr(id: Uuid, stderr: BoxedReader, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(connection_id = %id, line, "agent stderr");
                let mut tail = lock(&tail);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(connection_id = %id, %err, "agent stderr unreadable");
                break;
            }
        }
    }
}

/// Ids we allocate are numbers; some agents echo them back as strings.
fn own_call_id(id: &RequestId) -> Option<u64> {
    match id {
        RequestId::Number(n) => Some(*n),
        RequestId::Str(s) => s.parse().ok(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
