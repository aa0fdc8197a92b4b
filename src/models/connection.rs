//! Connection state model.

use std::fmt::{Display, Formatter};

use serde::Serialize;

/// Lifecycle state of the one logical agent connection.
///
/// ```text
/// Disconnected ──connect──▶ Connecting ──ok──▶ Connected ──loss──▶ Reconnecting
///      ▲                        │                  │                   │
///      │                        └─exhausted─▶ Failed ◀──exhausted──────┘
///      └──────────── disconnect (from any state) ──────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No agent process; nothing in flight.
    #[default]
    Disconnected,
    /// First spawn/handshake sequence in flight.
    Connecting,
    /// Handshake complete; calls are accepted.
    Connected,
    /// The live connection was lost; a new one may be in flight.
    Reconnecting,
    /// Every candidate failed; waiting for an explicit `connect()`.
    Failed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnected, Failed, Reconnecting};

        matches!(
            (self, next),
            (Disconnected | Failed, Connecting)
                | (Connecting | Reconnecting, Connected | Failed)
                | (Connected, Reconnecting)
                | (_, Disconnected)
        )
    }

    /// Whether a connect attempt is running or established.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
