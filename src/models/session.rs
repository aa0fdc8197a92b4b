//! Session model and lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The agent session currently associated with the live connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Opaque id returned by the agent's `session/new`.
    pub session_id: String,
    /// When this side recorded the session.
    pub created_at: DateTime<Utc>,
    /// Transport the session was created on; a replacement connection does
    /// not know this session.
    pub connection_id: Uuid,
}

impl Session {
    /// Record a session created on connection `connection_id`.
    #[must_use]
    pub fn new(session_id: String, connection_id: Uuid) -> Self {
        Self {
            session_id,
            created_at: Utc::now(),
            connection_id,
        }
    }
}

/// Session lifecycle notifications for collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new session became active.
    Created(Session),
    /// The active session was cleared.
    Reset {
        /// Id of the session that was active before the reset.
        previous: String,
    },
}
