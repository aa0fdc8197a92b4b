//! Shared helpers for connection-level integration tests.
//!
//! Provides an in-process fake agent speaking NDJSON JSON-RPC over
//! `tokio::io::duplex` pipes, and a [`FakeLauncher`] that hands those
//! agents to the connection manager in place of real processes.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio_util::sync::CancellationToken;

use acp_link::acp::handshake::HandshakePolicy;
use acp_link::acp::router::NotificationRouter;
use acp_link::acp::spawner::{AgentIo, AgentLauncher};
use acp_link::orchestrator::connection_manager::{
    ConnectionManager, ConnectionSettings, ReconnectPolicy,
};
use acp_link::orchestrator::endpoint::{Endpoint, EndpointPlan, TransportMode};
use acp_link::persistence::{KeyValueStore, MemoryStore};
use acp_link::{AppError, Result};

/// Behaviour knobs and a message log shared by every fake agent of a test.
#[derive(Debug, Default)]
pub struct AgentScript {
    /// Ids handed out by `session/new`, in order; `sess-N` once exhausted.
    pub session_ids: Mutex<VecDeque<String>>,
    /// Answer `session/new` with an error.
    pub fail_session_new: AtomicBool,
    /// Number of `initialize` calls to answer with an error first.
    pub initialize_errors: AtomicUsize,
    /// Never answer `initialize`.
    pub silent_initialize: AtomicBool,
    /// Every message the agents received, in arrival order.
    pub received: Mutex<Vec<Value>>,
    sessions_created: AtomicUsize,
}

impl AgentScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_session_ids(ids: &[&str]) -> Arc<Self> {
        let script = Self::default();
        script
            .session_ids
            .lock()
            .unwrap()
            .extend(ids.iter().map(|s| (*s).to_owned()));
        Arc::new(script)
    }

    /// Received messages whose `method` is `method`.
    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m["method"] == method)
            .cloned()
            .collect()
    }

    /// Received message (a client response) carrying `id` and no method.
    pub fn response_with_id(&self, id: &Value) -> Option<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.get("method").is_none() && m.get("id") == Some(id))
            .cloned()
    }
}

/// Start a fake agent and return the client-side byte channels.
///
/// The agent stops, closing its end of the pipe, when `kill` is cancelled.
pub fn fake_agent(script: Arc<AgentScript>, kill: CancellationToken) -> AgentIo {
    let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_side);
    tokio::spawn(serve(agent_side, script, kill));
    AgentIo {
        reader: Box::new(client_read),
        writer: Box::new(client_write),
        stderr: None,
        child: None,
    }
}

async fn serve(stream: DuplexStream, script: Arc<AgentScript>, kill: CancellationToken) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            () = kill.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => return,
            },
        };
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        script.received.lock().unwrap().push(message.clone());

        let (Some(id), Some(method)) = (message.get("id").cloned(), message["method"].as_str())
        else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let outcome = match method {
            "initialize" => {
                if script.silent_initialize.load(Ordering::SeqCst) {
                    continue;
                }
                let warming = script
                    .initialize_errors
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if warming {
                    Err(json!({ "code": -32000, "message": "warming up" }))
                } else {
                    Ok(json!({ "protocolVersion": 1, "agentCapabilities": { "loadSession": false } }))
                }
            }
            "session/new" => {
                if script.fail_session_new.load(Ordering::SeqCst) {
                    Err(json!({ "code": -32603, "message": "cannot create session" }))
                } else {
                    let n = script.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
                    let next = script.session_ids.lock().unwrap().pop_front();
                    Ok(json!({ "sessionId": next.unwrap_or_else(|| format!("sess-{n}")) }))
                }
            }
            "session/prompt" => {
                let update = json!({
                    "jsonrpc": "2.0",
                    "method": "session/update",
                    "params": {
                        "sessionId": params["sessionId"],
                        "update": { "sessionUpdate": "agent_message_chunk", "content": { "type": "text", "text": "hi" } }
                    }
                });
                write_line(&mut write, &update.to_string()).await;
                Ok(json!({ "stopReason": "end_turn" }))
            }
            "echo" => Ok(params),
            "hang" => continue,
            // Write `raw` and/or `message` to the client before answering.
            "agent/send" => {
                if let Some(raw) = params["raw"].as_str() {
                    write_line(&mut write, raw).await;
                }
                if let Some(inner) = params.get("message") {
                    write_line(&mut write, &inner.to_string()).await;
                }
                Ok(json!({}))
            }
            other => Err(json!({ "code": -32601, "message": format!("unknown method {other}") })),
        };

        let reply = match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        };
        write_line(&mut write, &reply.to_string()).await;
    }
}

async fn write_line(write: &mut WriteHalf<DuplexStream>, line: &str) {
    let _ = write.write_all(format!("{line}\n").as_bytes()).await;
    let _ = write.flush().await;
}

/// [`AgentLauncher`] that launches [`fake_agent`]s.
#[derive(Debug)]
pub struct FakeLauncher {
    pub script: Arc<AgentScript>,
    occupied: Mutex<HashSet<Endpoint>>,
    failing: Mutex<HashSet<Endpoint>>,
    launched: Mutex<Vec<Endpoint>>,
    kills: Mutex<Vec<CancellationToken>>,
    launch_delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts a launch as in flight until dropped, including when abandoned.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeLauncher {
    pub fn new(script: Arc<AgentScript>) -> Arc<Self> {
        Self::with_delay(script, Duration::ZERO)
    }

    pub fn with_delay(script: Arc<AgentScript>, launch_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script,
            occupied: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            launched: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            launch_delay,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    /// Report `endpoint` as held by a foreign listener.
    pub fn occupy(&self, endpoint: Endpoint) {
        self.occupied.lock().unwrap().insert(endpoint);
    }

    /// Stop reporting `endpoint` as occupied.
    pub fn release(&self, endpoint: Endpoint) {
        self.occupied.lock().unwrap().remove(&endpoint);
    }

    /// Make launches on `endpoint` fail.
    pub fn refuse(&self, endpoint: Endpoint) {
        self.failing.lock().unwrap().insert(endpoint);
    }

    /// Endpoints launch was called for, in order.
    pub fn launched(&self) -> Vec<Endpoint> {
        self.launched.lock().unwrap().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    /// Most launches that were ever in progress at the same time.
    pub fn peak_concurrent_launches(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Stop the most recently launched agent.
    pub fn kill_latest(&self) {
        if let Some(kill) = self.kills.lock().unwrap().last() {
            kill.cancel();
        }
    }
}

impl AgentLauncher for FakeLauncher {
    fn is_occupied(&self, endpoint: &Endpoint) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let occupied = self.occupied.lock().unwrap().contains(endpoint);
        Box::pin(async move { occupied })
    }

    fn launch(&self, endpoint: &Endpoint) -> Pin<Box<dyn Future<Output = Result<AgentIo>> + Send + '_>> {
        let endpoint = *endpoint;
        Box::pin(async move {
            self.launched.lock().unwrap().push(endpoint);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            let _in_flight = InFlight(&self.in_flight);
            tokio::time::sleep(self.launch_delay).await;
            let refused = self.failing.lock().unwrap().contains(&endpoint);
            if refused {
                return Err(AppError::ProcessSpawnFailed(format!("{endpoint} refused")));
            }
            let kill = CancellationToken::new();
            self.kills.lock().unwrap().push(kill.clone());
            Ok(fake_agent(Arc::clone(&self.script), kill))
        })
    }
}

/// Fast settings: three TCP candidates from 4100, short handshake bounds.
pub fn test_settings(mode: TransportMode) -> ConnectionSettings {
    ConnectionSettings {
        endpoints: EndpointPlan {
            mode,
            base_port: 4100,
            port_span: 3,
        },
        handshake: HandshakePolicy {
            readiness_timeout: Duration::from_secs(2),
            max_probes: 3,
            initial_spacing: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(200),
            protocol_version: 1,
        },
        request_timeout: Duration::from_secs(2),
        reconnect: ReconnectPolicy::Manual,
    }
}

/// Manager over `launcher` with a fresh router.
pub fn test_manager(
    launcher: &Arc<FakeLauncher>,
    settings: ConnectionSettings,
    store: &Arc<MemoryStore>,
) -> ConnectionManager {
    let launcher: Arc<dyn AgentLauncher> = Arc::clone(launcher) as Arc<dyn AgentLauncher>;
    let store: Arc<dyn KeyValueStore> = Arc::clone(store) as Arc<dyn KeyValueStore>;
    ConnectionManager::new(launcher, settings, NotificationRouter::new(), store)
}

/// Poll `condition` every 10ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
