//! Endpoint candidates.
//!
//! [`candidates`] is a pure function: given the configured plan and the
//! endpoint that last completed a handshake, it produces the ordered list a
//! connect attempt walks through. The list is generated fresh for every
//! attempt and never mutated afterwards.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::debug;

use crate::AppError;

/// How the agent's JSON-RPC channel is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// The agent's stdin/stdout.
    #[default]
    Stdio,
    /// A loopback TCP socket on a port passed to the agent.
    Tcp,
}

/// One address the agent can be launched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Standard input/output of the child process.
    Stdio,
    /// Loopback TCP port.
    Tcp {
        /// Port number.
        port: u16,
    },
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Tcp { port } => write!(f, "tcp:{port}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "stdio" {
            return Ok(Self::Stdio);
        }
        s.strip_prefix("tcp:")
            .and_then(|p| p.parse().ok())
            .map(|port| Self::Tcp { port })
            .ok_or_else(|| AppError::Config(format!("invalid endpoint: {s}")))
    }
}

/// Inputs for candidate generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPlan {
    /// Transport framing.
    pub mode: TransportMode,
    /// First port of the sequential fallback range.
    pub base_port: u16,
    /// Number of sequential ports to try.
    pub port_span: u16,
}

/// Build the ordered candidate list for one connect attempt.
///
/// Stdio mode always yields a single [`Endpoint::Stdio`]. TCP mode yields
/// `preferred` first (if it is a TCP endpoint), then `base_port`,
/// `base_port + 1`, … for `port_span` ports, skipping the preferred port
/// and stopping at `u16::MAX`.
#[must_use]
pub fn candidates(plan: &EndpointPlan, preferred: Option<Endpoint>) -> Vec<Endpoint> {
    match plan.mode {
        TransportMode::Stdio => vec![Endpoint::Stdio],
        TransportMode::Tcp => {
            let preferred = preferred.filter(|e| matches!(e, Endpoint::Tcp { .. }));
            let range = (0..plan.port_span)
                .map_while(|offset| plan.base_port.checked_add(offset))
                .map(|port| Endpoint::Tcp { port })
                .filter(|e| Some(*e) != preferred);
            preferred.into_iter().chain(range).collect()
        }
    }
}

/// Whether a foreign listener already holds `port` on `hostname`.
///
/// The probe binds and immediately releases the port; only `AddrInUse`
/// counts as occupied.
pub async fn port_is_occupied(hostname: &str, port: u16) -> bool {
    match TcpListener::bind((hostname, port)).await {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => true,
        Err(err) => {
            debug!(port, error = %err, "port probe failed; treating as free");
            false
        }
    }
}
