//! Key-value seam for small pieces of state that outlive one connection.
//!
//! The connection manager remembers the last endpoint that completed a
//! handshake and the session controller remembers the active session id.
//! Hosts plug in whatever store they already have; [`MemoryStore`] covers
//! tests and the standalone binary.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Key under which the last winning endpoint is stored.
pub const KEY_PREFERRED_ENDPOINT: &str = "acp.preferred_endpoint";
/// Key under which the active session id is stored.
pub const KEY_SESSION_ID: &str = "acp.session_id";

/// Minimal string key-value store.
pub trait KeyValueStore: Send + Sync {
    /// Value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<String>;
    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &str);
    /// Remove `key`; absent keys are ignored.
    fn remove(&self, key: &str);
}

/// In-process [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn put(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
