//! Live client session registry.
//!
//! Connections register here so asynchronous completions can be routed
//! back to the caller that asked for them. Only the boundary is kept:
//! which sessions exist, under which ids. Connection state machines and
//! wire framing live outside this crate.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::Timestamp;

/// Identifier of a live client session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a new SessionId from a raw u64 value
    pub fn new(id: u64) -> Self {
        SessionId(id)
    }

    /// Returns the raw u64 value of this session ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live client connection as the registry sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Peer address or name reported by the connection layer.
    pub peer: String,
    /// When the session registered.
    pub established: Timestamp,
}

impl Session {
    /// Creates a session record established now.
    pub fn new(peer: impl Into<String>) -> Self {
        Session {
            peer: peer.into(),
            established: Timestamp::now(),
        }
    }
}

/// Registry of live sessions, keyed by id.
#[derive(Debug)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Creates an empty registry. Ids start at 1.
    pub fn new() -> Self {
        SessionRegistry {
            next_id: AtomicU64::new(1),
            sessions: DashMap::new(),
        }
    }

    /// Registers a session and hands back its id.
    pub fn add(&self, session: Session) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(%id, peer = %session.peer, "session registered");
        self.sessions.insert(id, session);
        id
    }

    /// Registers a session under a caller-chosen id, replacing whatever
    /// was there. Used when a client reconnects under its old id.
    pub fn add_with_id(&self, id: SessionId, session: Session) {
        self.sessions.insert(id, session);
    }

    /// Detaches a session.
    ///
    /// Removing an id that was never registered panics in debug builds
    /// and is ignored in release builds.
    pub fn remove(&self, id: SessionId) {
        let removed = self.sessions.remove(&id);
        debug_assert!(removed.is_some(), "removing unregistered session {}", id);
        if removed.is_none() {
            warn!(%id, "removing unregistered session");
        }
    }

    /// True when `id` is currently registered.
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
