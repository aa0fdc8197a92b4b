//! Error types shared across the connection subsystem.

use std::fmt::{Display, Formatter};

use crate::acp::message::RpcError;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all connection failure modes.
///
/// The enum is `Clone` so a single in-flight outcome (a connect attempt or a
/// session creation) can be handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Protocol misuse that does not fit a more specific kind.
    Acp(String),
    /// Candidate endpoint is occupied by a foreign listener or unreachable.
    EndpointUnavailable(String),
    /// The agent binary could not be launched, or exited before it was ready.
    ProcessSpawnFailed(String),
    /// The agent started but never answered the readiness probe in time.
    HandshakeTimeout(String),
    /// One inbound line could not be parsed or classified.
    TransportParse(String),
    /// A specific call was not answered within its window.
    RequestTimeout(String),
    /// The transport closed while the call was outstanding.
    ConnectionLost(String),
    /// The agent answered a call with a structured error.
    Remote(RpcError),
    /// The agent refused or garbled a session-creation call.
    SessionCreationFailed(String),
}

impl AppError {
    /// Whether this error was produced while establishing a connection
    /// (as opposed to a failure of one call on a live connection).
    #[must_use]
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::EndpointUnavailable(_) | Self::ProcessSpawnFailed(_) | Self::HandshakeTimeout(_)
        )
    }

    /// Rewrap the message of a connection-level error while keeping its kind.
    ///
    /// Errors of any other kind are returned unchanged.
    #[must_use]
    pub fn with_context(self, context: &str) -> Self {
        match self {
            Self::EndpointUnavailable(msg) => Self::EndpointUnavailable(format!("{context}: {msg}")),
            Self::ProcessSpawnFailed(msg) => Self::ProcessSpawnFailed(format!("{context}: {msg}")),
            Self::HandshakeTimeout(msg) => Self::HandshakeTimeout(format!("{context}: {msg}")),
            other => other,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::EndpointUnavailable(msg) => write!(f, "endpoint unavailable: {msg}"),
            Self::ProcessSpawnFailed(msg) => write!(f, "process spawn failed: {msg}"),
            Self::HandshakeTimeout(msg) => write!(f, "handshake timeout: {msg}"),
            Self::TransportParse(msg) => write!(f, "transport parse: {msg}"),
            Self::RequestTimeout(msg) => write!(f, "request timeout: {msg}"),
            Self::ConnectionLost(msg) => write!(f, "connection lost: {msg}"),
            Self::Remote(err) => write!(f, "remote error {}: {}", err.code, err.message),
            Self::SessionCreationFailed(msg) => write!(f, "session creation failed: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
