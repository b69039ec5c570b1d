//! Session manager: owns stored sessions and the backend they share.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::codec::TypeRegistry;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::idle::{IdlePolicy, now_millis};
use crate::operations::{MISSING_TIME, SessionOperations};
use crate::session::{Session, StoredSession, is_blank};

/// Lifecycle notification for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was created through the manager.
    Created { id: String },
    /// A session was expired.
    Destroyed { id: String },
}

/// Receives [`SessionEvent`]s from a manager.
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

impl<F> SessionListener for F
where
    F: Fn(&SessionEvent) + Send + Sync,
{
    fn on_event(&self, event: &SessionEvent) {
        self(event)
    }
}

/// State shared by the manager and the sessions it owns.
pub(crate) struct ManagerInner {
    pub(crate) operations: Arc<dyn SessionOperations>,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) config: ManagerConfig,
    pub(crate) span: tracing::Span,
    sessions: RwLock<HashMap<String, Arc<StoredSession>>>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl ManagerInner {
    pub(crate) fn notify(&self, event: &SessionEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    pub(crate) fn untrack(&self, id: &str) -> Option<Arc<StoredSession>> {
        self.sessions.write().remove(id)
    }
}

/// Owns the stored sessions of one application.
///
/// Cheap to clone; clones share the same tracking set and backend.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Create a manager over `operations`, logging under a `widerow_session` span.
    pub fn new(
        operations: Arc<dyn SessionOperations>,
        registry: Arc<TypeRegistry>,
        config: ManagerConfig,
    ) -> Self {
        Self::with_span(
            operations,
            registry,
            config,
            tracing::info_span!("widerow_session"),
        )
    }

    /// Create a manager whose events (and its sessions' events) are emitted under `span`.
    pub fn with_span(
        operations: Arc<dyn SessionOperations>,
        registry: Arc<TypeRegistry>,
        config: ManagerConfig,
        span: tracing::Span,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                operations,
                registry,
                config,
                span,
                sessions: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<ManagerInner> {
        &self.inner
    }

    /// The backend shared by every session of this manager.
    pub fn operations(&self) -> Arc<dyn SessionOperations> {
        Arc::clone(&self.inner.operations)
    }

    /// The manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Initialize the backend with this manager's type registry.
    pub fn start(&self) -> Result<()> {
        let _span = self.inner.span.enter();
        self.inner
            .operations
            .initialize(Arc::clone(&self.inner.registry))?;
        if self.inner.config.load_on_start {
            let loaded = self.load_persisted()?;
            info!(loaded, "Loaded persisted sessions");
        }
        info!("Session manager started");
        Ok(())
    }

    /// Stop tracking every session and shut the backend down.
    pub fn stop(&self) -> Result<()> {
        let _span = self.inner.span.enter();
        self.inner.sessions.write().clear();
        self.inner.operations.shutdown()?;
        info!("Session manager stopped");
        Ok(())
    }

    /// Register a listener for session events.
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Create, persist, and track a new session.
    ///
    /// Fails with [`Error::SessionExists`] if the id is already tracked or
    /// already has a row in storage; use [`find_session`](Self::find_session)
    /// to attach to those.
    pub fn create_session(&self, id: &str) -> Result<Arc<StoredSession>> {
        let _span = self.inner.span.enter();
        if is_blank(id) {
            warn!("Refusing to create a session with a blank id");
            return Err(Error::InvalidSessionId(id.to_string()));
        }
        if self.inner.sessions.read().contains_key(id)
            || self.inner.operations.creation_time(id)? != MISSING_TIME
        {
            warn!(session_id = %id, "Refusing to recreate an existing session");
            return Err(Error::SessionExists(id.to_string()));
        }

        let session = Arc::new(StoredSession::with_id(self, id)?);
        let now = now_millis();
        self.inner.operations.set_timestamps(id, now, now)?;

        self.track(Arc::clone(&session));
        self.inner.notify(&SessionEvent::Created { id: id.to_string() });
        debug!(session_id = %id, "Session created");
        Ok(session)
    }

    /// Look a session up, re-attaching it from storage if another node created it.
    pub fn find_session(&self, id: &str) -> Result<Option<Arc<StoredSession>>> {
        if is_blank(id) {
            return Ok(None);
        }
        if let Some(session) = self.inner.sessions.read().get(id) {
            return Ok(Some(Arc::clone(session)));
        }

        if self.inner.operations.last_accessed_time(id)? == MISSING_TIME {
            return Ok(None);
        }
        let session = Arc::new(StoredSession::with_id(self, id)?);
        self.track(Arc::clone(&session));
        debug!(parent: &self.inner.span, session_id = %id, "Session attached from storage");
        Ok(Some(session))
    }

    /// Stop tracking a session. Its row stays in storage.
    pub fn remove(&self, id: &str) -> Option<Arc<StoredSession>> {
        self.inner.untrack(id)
    }

    /// Stop tracking a session and delete its row.
    pub fn remove_session_data(&self, id: &str) -> Result<()> {
        self.inner.untrack(id);
        self.inner.operations.remove_session(id)
    }

    /// Number of tracked sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Ids of tracked sessions, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Track every session that has a row in storage. Returns how many were added.
    pub fn load_persisted(&self) -> Result<usize> {
        let mut added = 0;
        for id in self.inner.operations.find_session_keys()? {
            if is_blank(&id) || self.inner.sessions.read().contains_key(&id) {
                continue;
            }
            let session = Arc::new(StoredSession::with_id(self, &id)?);
            self.track(session);
            added += 1;
        }
        Ok(added)
    }

    /// Check every tracked session and expire idle ones. Returns how many expired.
    pub fn process_expires(&self) -> usize {
        let _span = self.inner.span.enter();
        let sessions: Vec<Arc<StoredSession>> =
            self.inner.sessions.read().values().cloned().collect();

        let mut expired = 0;
        for session in sessions {
            if !session.is_valid() {
                // Sessions invalidated without expiring are still tracked.
                self.inner.untrack(&session.id());
                expired += 1;
            }
        }
        if expired > 0 {
            debug!(expired, "Expired idle sessions");
        }
        expired
    }

    /// Delete rows whose last-accessed time is missing or past the idle timeout.
    ///
    /// Scans every row in storage. Tracked sessions among them are expired
    /// first. Returns how many rows were deleted.
    pub fn purge_expired_rows(&self) -> Result<usize> {
        let _span = self.inner.span.enter();
        let policy = IdlePolicy::new(self.inner.config.max_inactive_interval);
        let now = now_millis();
        let mut purged = 0;

        for id in self.inner.operations.find_session_keys()? {
            let last_accessed = self.inner.operations.last_accessed_time(&id)?;
            if !policy.is_expired(last_accessed, now) {
                continue;
            }
            let tracked = self.inner.sessions.read().get(&id).cloned();
            if let Some(session) = tracked {
                session.expire();
            }
            self.remove_session_data(&id)?;
            purged += 1;
        }

        if purged > 0 {
            info!(purged, "Purged expired session rows");
        }
        Ok(purged)
    }

    fn track(&self, session: Arc<StoredSession>) {
        self.inner.sessions.write().insert(session.id(), session);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.inner.config)
            .field("active_sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}
