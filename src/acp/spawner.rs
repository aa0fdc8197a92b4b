//! ACP agent process spawner.
//!
//! Launches the external agent for one endpoint candidate with:
//! - `kill_on_drop(true)` so processes are cleaned up automatically.
//! - `env_clear()` + a safe variable allowlist so the host's secrets never
//!   reach the child's environment.
//! - stdio framing (`stdin`/`stdout` are the JSON-RPC channel) or TCP
//!   framing (`--port <n> --hostname 127.0.0.1`, channel is a socket).
//!
//! `stderr` is always piped and handed to the transport for diagnostics.
//!
//! The [`AgentLauncher`] trait is the seam the connection manager spawns
//! through; [`ProcessLauncher`] is the real implementation.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::acp::writer::BoxedWriter;
use crate::orchestrator::endpoint::{port_is_occupied, Endpoint};
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by the spawned agent process.
///
/// Every other variable from the host environment is stripped via
/// `env_clear()` before the child is launched.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "LANG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Grace period between `SIGTERM` and a hard kill on teardown.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(500);

// ── Configuration ────────────────────────────────────────────────────────────

/// Configuration for spawning an ACP agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Agent binary (e.g., `opencode`, `gemini`).
    pub host_cli: String,
    /// Arguments passed before any endpoint arguments.
    pub host_cli_args: Vec<String>,
    /// Workspace root directory; the child process starts in this directory.
    pub workspace_root: PathBuf,
    /// Host the agent binds to in TCP mode.
    pub hostname: String,
    /// How long to keep retrying the socket connect in TCP mode.
    pub connect_timeout: Duration,
}

// ── Launched process ─────────────────────────────────────────────────────────

/// Boxed byte source for the agent's output channel (stdout or a socket half).
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte channels of one launched agent, ready to hand to a transport.
pub struct AgentIo {
    /// Inbound JSON-RPC bytes.
    pub reader: BoxedReader,
    /// Outbound JSON-RPC bytes.
    pub writer: BoxedWriter,
    /// Diagnostic output, if any.
    pub stderr: Option<BoxedReader>,
    /// The process itself; `None` for in-process or externally owned agents.
    pub child: Option<Child>,
}

impl std::fmt::Debug for AgentIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIo")
            .field("stderr", &self.stderr.is_some())
            .field("child", &self.child.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

/// Spawns agents for endpoint candidates.
pub trait AgentLauncher: Send + Sync {
    /// Whether `endpoint` is already taken by a foreign listener.
    fn is_occupied(&self, endpoint: &Endpoint) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Launch an agent bound to `endpoint` and return its byte channels.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ProcessSpawnFailed`] if the agent cannot be started
    /// or exits before its channel opens, and [`AppError::HandshakeTimeout`]
    /// if a TCP agent never starts listening.
    fn launch(&self, endpoint: &Endpoint) -> Pin<Box<dyn Future<Output = Result<AgentIo>> + Send + '_>>;
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// [`AgentLauncher`] that runs `config.host_cli` as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: SpawnConfig,
}

impl ProcessLauncher {
    /// Create a launcher for `config`.
    #[must_use]
    pub fn new(config: SpawnConfig) -> Self {
        Self { config }
    }

    fn command(&self, endpoint: &Endpoint) -> Command {
        let mut cmd = Command::new(&self.config.host_cli);
        cmd.args(&self.config.host_cli_args);
        if let Endpoint::Tcp { port } = endpoint {
            cmd.arg("--port")
                .arg(port.to_string())
                .arg("--hostname")
                .arg(&self.config.hostname);
        }

        // Strip inherited environment, then inject only the safe allowlist.
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        cmd.current_dir(&self.config.workspace_root)
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn spawn(&self, endpoint: Endpoint) -> Result<AgentIo> {
        let mut cmd = self.command(&endpoint);
        match endpoint {
            Endpoint::Stdio => {
                cmd.stdin(std::process::Stdio::piped())
                    .stdout(std::process::Stdio::piped());
            }
            Endpoint::Tcp { .. } => {
                cmd.stdin(std::process::Stdio::null())
                    .stdout(std::process::Stdio::null());
            }
        }

        let mut child = cmd.spawn().map_err(|err| {
            AppError::ProcessSpawnFailed(format!(
                "failed to spawn {}: {err}",
                self.config.host_cli
            ))
        })?;
        info!(
            host_cli = self.config.host_cli,
            %endpoint,
            pid = child.id(),
            "agent process spawned"
        );

        let stderr = child
            .stderr
            .take()
            .map(|s| -> BoxedReader { Box::new(s) });

        let (reader, writer): (BoxedReader, BoxedWriter) = match endpoint {
            Endpoint::Stdio => {
                let stdin = child.stdin.take().ok_or_else(|| {
                    AppError::ProcessSpawnFailed("failed to capture agent stdin".into())
                })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    AppError::ProcessSpawnFailed("failed to capture agent stdout".into())
                })?;
                (Box::new(stdout), Box::new(stdin))
            }
            Endpoint::Tcp { port } => {
                let stream = match self.connect_with_retry(&mut child, port).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        terminate_child(&mut child, TERMINATE_GRACE).await;
                        return Err(err);
                    }
                };
                let (read_half, write_half) = stream.into_split();
                (Box::new(read_half), Box::new(write_half))
            }
        };

        Ok(AgentIo {
            reader,
            writer,
            stderr,
            child: Some(child),
        })
    }

    /// Connect to the agent's listener, retrying with increasing spacing
    /// until `connect_timeout` elapses or the child exits.
    async fn connect_with_retry(&self, child: &mut Child, port: u16) -> Result<TcpStream> {
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut spacing = Duration::from_millis(50);

        loop {
            match TcpStream::connect((self.config.hostname.as_str(), port)).await {
                Ok(stream) => {
                    debug!(port, "agent socket connected");
                    return Ok(stream);
                }
                Err(err) => debug!(port, error = %err, "agent socket not ready"),
            }

            if let Ok(Some(status)) = child.try_wait() {
                return Err(AppError::ProcessSpawnFailed(format!(
                    "agent exited before listening on port {port}: {status}"
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::HandshakeTimeout(format!(
                    "agent did not listen on port {port} within {:?}",
                    self.config.connect_timeout
                )));
            }
            tokio::time::sleep(spacing.min(deadline - now)).await;
            spacing = (spacing * 2).min(Duration::from_millis(500));
        }
    }
}

impl AgentLauncher for ProcessLauncher {
    fn is_occupied(&self, endpoint: &Endpoint) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let endpoint = *endpoint;
        Box::pin(async move {
            match endpoint {
                Endpoint::Stdio => false,
                Endpoint::Tcp { port } => port_is_occupied(&self.config.hostname, port).await,
            }
        })
    }

    fn launch(&self, endpoint: &Endpoint) -> Pin<Box<dyn Future<Output = Result<AgentIo>> + Send + '_>> {
        let endpoint = *endpoint;
        Box::pin(self.spawn(endpoint))
    }
}

// ── Teardown ─────────────────────────────────────────────────────────────────

/// Ask `child` to exit, then kill it if it is still running after `grace`.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, %err, "SIGTERM delivery failed");
        } else if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(err) = child.kill().await {
        warn!(%err, "failed to kill agent process");
    }
}
