//! Global Session Registry
//!
//! Thread-safe session bookkeeping using DashMap for concurrent access.
//! Shards are locked only for the duration of a single map operation, never
//! across an await point, so concurrent session churn cannot deadlock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::types::{Session, SessionId, SessionInfo};

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session limit reached ({max})")]
    SessionLimitReached { max: usize },

    #[error("Session already registered: {0}")]
    DuplicateId(SessionId),

    #[error("gateway is shutting down")]
    ShuttingDown,
}

/// Live sessions keyed by id. In-memory only; lost on restart.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Maximum concurrent sessions, `None` for unbounded
    max_sessions: Option<usize>,
    /// Serializes the limit check with the insert
    add_lock: parking_lot::Mutex<()>,
    /// Set by `close_all`; no session is accepted afterwards
    closing: AtomicBool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that refuses sessions beyond `max`
    pub fn with_max_sessions(max: Option<usize>) -> Self {
        Self {
            max_sessions: max,
            ..Self::default()
        }
    }

    pub fn max_sessions(&self) -> Option<usize> {
        self.max_sessions
    }

    /// Register a session under its own id
    pub fn add(&self, session: Session) -> Result<Arc<Session>, RegistryError> {
        let _guard = self.add_lock.lock();

        if self.closing.load(Ordering::SeqCst) {
            return Err(RegistryError::ShuttingDown);
        }

        if let Some(max) = self.max_sessions {
            if self.sessions.len() >= max {
                return Err(RegistryError::SessionLimitReached { max });
            }
        }

        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateId(session.id)),
            Entry::Vacant(slot) => {
                let session = Arc::new(session);
                slot.insert(session.clone());
                info!(
                    "Session {} registered: {} (total: {})",
                    session.id,
                    session.target,
                    self.sessions.len()
                );
                Ok(session)
            }
        }
    }

    /// Remove a session without closing it
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| {
            debug!("Session {} removed from registry", id);
            session
        })
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot of all live sessions.
    ///
    /// The snapshot is detached from the map; removing sessions while
    /// iterating it is safe.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Session info sorted by creation time
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.all().iter().map(|s| s.info()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove and close a session.
    ///
    /// Safe to call any number of times from any task: only the first call
    /// finds the entry, and closing is itself idempotent. Returns `true` for
    /// the call that did the work.
    pub fn teardown(&self, id: &SessionId) -> bool {
        match self.remove(id) {
            Some(session) => {
                session.close();
                info!(
                    "Session {} torn down: {} (remaining: {})",
                    id,
                    session.target,
                    self.sessions.len()
                );
                true
            }
            None => false,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Close every live session and refuse new ones (process shutdown)
    pub fn close_all(&self) -> usize {
        {
            let _guard = self.add_lock.lock();
            self.closing.store(true, Ordering::SeqCst);
        }

        let mut closed = 0;
        for session in self.all() {
            if self.teardown(&session.id) {
                closed += 1;
            }
        }
        if closed > 0 {
            info!("Closed {} live session(s)", closed);
        }
        closed
    }
}

/// Tears a session down when dropped.
///
/// Held by the connection handler for the lifetime of the bridge loop, so the
/// session is removed and closed on every exit path, panics included.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl SessionGuard {
    pub fn new(registry: Arc<SessionRegistry>, id: SessionId) -> Self {
        Self { registry, id }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.teardown(&self.id);
    }
}
