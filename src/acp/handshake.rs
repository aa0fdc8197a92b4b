//! ACP readiness handshake.
//!
//! Right after an agent is launched the transport is live but the agent may
//! still be starting up. [`await_ready`] probes it with `initialize` calls:
//! each probe gets a short timeout, probes are spaced with doubling delays,
//! and the whole exchange is bounded by both `max_probes` and an overall
//! readiness deadline. The first successful answer wins and its result (the
//! agent's capabilities) is returned.
//!
//! A structured error from the agent is retried like a timeout: agents
//! commonly answer "not initialized yet" while warming up.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::acp::transport::Transport;
use crate::{AppError, Result};

/// Handshake method name.
pub const METHOD_INITIALIZE: &str = "initialize";

/// Bounds for the readiness handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePolicy {
    /// Overall deadline for the agent to become ready.
    pub readiness_timeout: Duration,
    /// Maximum number of `initialize` probes.
    pub max_probes: u32,
    /// Delay after the first failed probe; doubles after each further one.
    pub initial_spacing: Duration,
    /// Timeout for a single probe.
    pub probe_timeout: Duration,
    /// ACP protocol version announced to the agent.
    pub protocol_version: u32,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(15),
            max_probes: 5,
            initial_spacing: Duration::from_millis(100),
            probe_timeout: Duration::from_secs(3),
            protocol_version: 1,
        }
    }
}

/// Parameters of the `initialize` call.
#[must_use]
pub fn initialize_params(protocol_version: u32) -> Value {
    json!({
        "protocolVersion": protocol_version,
        "clientCapabilities": {
            "fs": { "readTextFile": false, "writeTextFile": false },
            "terminal": false
        },
        "clientInfo": {
            "name": "acp-link",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// Probe `transport` until the agent answers `initialize`.
///
/// # Errors
///
/// - [`AppError::ProcessSpawnFailed`] if the agent exits or stops reading
///   (the transport closes) during the handshake; the message carries the tail of the
///   agent's stderr when there is one.
/// - [`AppError::HandshakeTimeout`] if no probe succeeds within the bounds.
pub async fn await_ready(transport: &Transport, policy: &HandshakePolicy) -> Result<Value> {
    let deadline = Instant::now() + policy.readiness_timeout;
    let params = initialize_params(policy.protocol_version);
    let mut spacing = policy.initial_spacing;
    let mut last_error: Option<AppError> = None;
    let mut probes = 0;

    while probes < policy.max_probes {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        probes += 1;

        match transport
            .request(
                METHOD_INITIALIZE,
                params.clone(),
                policy.probe_timeout.min(remaining),
            )
            .await
        {
            Ok(capabilities) => {
                info!(
                    connection_id = %transport.id(),
                    probes,
                    "handshake: agent ready"
                );
                return Ok(capabilities);
            }
            Err(AppError::ConnectionLost(reason)) => {
                let stderr = transport
                    .disconnect()
                    .map(|d| d.stderr_tail.join("\n"))
                    .unwrap_or_default();
                let detail = if stderr.is_empty() {
                    reason
                } else {
                    format!("{reason}; stderr:\n{stderr}")
                };
                return Err(AppError::ProcessSpawnFailed(format!(
                    "agent connection closed during handshake: {detail}"
                )));
            }
            Err(err) => {
                debug!(connection_id = %transport.id(), probes, error = %err, "handshake: probe failed");
                last_error = Some(err);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || probes >= policy.max_probes {
            break;
        }
        tokio::time::sleep(spacing.min(remaining)).await;
        spacing = spacing.saturating_mul(2);
    }

    Err(AppError::HandshakeTimeout(format!(
        "agent not ready after {probes} probe(s) within {:?}{}",
        policy.readiness_timeout,
        last_error.map(|e| format!("; last error: {e}")).unwrap_or_default()
    )))
}
