//! Session objects.
//!
//! [`Session`] is the capability set a host container works against:
//! attributes, timestamps, and a validity check. Two variants exist:
//!
//! - [`StandardSession`] keeps everything in process memory.
//! - [`StoredSession`] keeps nothing but its id and request-bound fields in
//!   memory, and forwards every attribute and timestamp call to the
//!   manager's [`SessionOperations`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::codec::AttributeValue;
use crate::error::{Error, Result};
use crate::idle::{IdlePolicy, now_millis};
use crate::manager::{ManagerInner, SessionEvent, SessionManager};
use crate::operations::{MISSING_TIME, SessionOperations};

/// Whether a session id is unusable (empty or whitespace only).
pub fn is_blank(id: &str) -> bool {
    id.trim().is_empty()
}

/// A user session as seen by the host container.
pub trait Session: Send + Sync {
    /// The session id (empty until assigned).
    fn id(&self) -> String;

    /// Assign the id. Once assigned, it can't be changed.
    fn set_id(&self, id: &str) -> Result<()>;

    /// Read an attribute.
    fn attribute(&self, name: &str) -> Result<Option<AttributeValue>>;

    /// Write an attribute. `None` removes it.
    fn set_attribute(&self, name: &str, value: Option<AttributeValue>) -> Result<()>;

    /// Remove an attribute.
    fn remove_attribute(&self, name: &str) -> Result<()>;

    /// Names of all attributes.
    fn attribute_names(&self) -> Result<Vec<String>>;

    /// Creation time in epoch millis, or [`MISSING_TIME`].
    fn creation_time(&self) -> Result<i64>;

    fn set_creation_time(&self, time: i64) -> Result<()>;

    /// Last-accessed time in epoch millis, or [`MISSING_TIME`].
    fn last_accessed_time(&self) -> Result<i64>;

    fn set_last_accessed_time(&self, time: i64) -> Result<()>;

    /// Idle timeout (None: never idles out).
    fn max_inactive_interval(&self) -> Option<Duration>;

    fn set_max_inactive_interval(&self, interval: Option<Duration>);

    /// Record a request touching this session.
    fn access(&self) -> Result<()>;

    /// Whether the session is still usable. May expire it as a side effect.
    fn is_valid(&self) -> bool;

    /// Invalidate the session.
    fn expire(&self);
}

// ─────────────────────────────────────────────────────────────────────────────
// Standard (in-memory) session
// ─────────────────────────────────────────────────────────────────────────────

/// The container's default session: all state lives in this process.
#[derive(Debug)]
pub struct StandardSession {
    id: RwLock<String>,
    attributes: RwLock<HashMap<String, AttributeValue>>,
    creation_time: AtomicI64,
    last_accessed_time: AtomicI64,
    max_inactive_interval: RwLock<Option<Duration>>,
    valid: AtomicBool,
}

impl StandardSession {
    /// Create a session with the given idle timeout, stamped with the current time.
    pub fn new(max_inactive_interval: Option<Duration>) -> Self {
        let now = now_millis();
        Self {
            id: RwLock::new(String::new()),
            attributes: RwLock::new(HashMap::new()),
            creation_time: AtomicI64::new(now),
            last_accessed_time: AtomicI64::new(now),
            max_inactive_interval: RwLock::new(max_inactive_interval),
            valid: AtomicBool::new(true),
        }
    }
}

impl Session for StandardSession {
    fn id(&self) -> String {
        self.id.read().clone()
    }

    fn set_id(&self, id: &str) -> Result<()> {
        assign_id(&self.id, id)
    }

    fn attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        Ok(self.attributes.read().get(name).cloned())
    }

    fn set_attribute(&self, name: &str, value: Option<AttributeValue>) -> Result<()> {
        match value {
            Some(value) => {
                self.attributes.write().insert(name.to_string(), value);
                Ok(())
            }
            None => self.remove_attribute(name),
        }
    }

    fn remove_attribute(&self, name: &str) -> Result<()> {
        self.attributes.write().remove(name);
        Ok(())
    }

    fn attribute_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.attributes.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn creation_time(&self) -> Result<i64> {
        Ok(self.creation_time.load(Ordering::SeqCst))
    }

    fn set_creation_time(&self, time: i64) -> Result<()> {
        self.creation_time.store(time, Ordering::SeqCst);
        self.last_accessed_time.store(time, Ordering::SeqCst);
        Ok(())
    }

    fn last_accessed_time(&self) -> Result<i64> {
        Ok(self.last_accessed_time.load(Ordering::SeqCst))
    }

    fn set_last_accessed_time(&self, time: i64) -> Result<()> {
        self.last_accessed_time.store(time, Ordering::SeqCst);
        Ok(())
    }

    fn max_inactive_interval(&self) -> Option<Duration> {
        *self.max_inactive_interval.read()
    }

    fn set_max_inactive_interval(&self, interval: Option<Duration>) {
        *self.max_inactive_interval.write() = interval;
    }

    fn access(&self) -> Result<()> {
        self.set_last_accessed_time(now_millis())
    }

    fn is_valid(&self) -> bool {
        if !self.valid.load(Ordering::SeqCst) {
            return false;
        }
        let policy = IdlePolicy::new(self.max_inactive_interval());
        if policy.is_expired(self.last_accessed_time.load(Ordering::SeqCst), now_millis()) {
            self.expire();
        }
        self.valid.load(Ordering::SeqCst)
    }

    fn expire(&self) {
        self.valid.store(false, Ordering::SeqCst);
        self.attributes.write().clear();
    }
}

fn assign_id(slot: &RwLock<String>, id: &str) -> Result<()> {
    if is_blank(id) {
        return Err(Error::InvalidSessionId(id.to_string()));
    }
    let mut current = slot.write();
    if !is_blank(&current) && *current != id {
        return Err(Error::IdAlreadyAssigned(current.clone()));
    }
    *current = id.to_string();
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Stored session
// ─────────────────────────────────────────────────────────────────────────────

/// A session whose attributes and timestamps live in storage.
///
/// Only the id, the idle timeout, the validity flags, and the time of the
/// request currently being served are kept in memory. Every call against a
/// blank id is logged and answered with a default without reaching storage.
pub struct StoredSession {
    id: RwLock<String>,
    operations: Arc<dyn SessionOperations>,
    manager: Weak<ManagerInner>,
    max_inactive_interval: RwLock<Option<Duration>>,
    this_accessed_time: AtomicI64,
    valid: AtomicBool,
    expiring: AtomicBool,
    span: tracing::Span,
}

impl StoredSession {
    /// Create a session owned by `manager`, with no id yet.
    pub fn new(manager: &SessionManager) -> Self {
        let inner = manager.inner();
        Self {
            id: RwLock::new(String::new()),
            operations: Arc::clone(&inner.operations),
            manager: Arc::downgrade(inner),
            max_inactive_interval: RwLock::new(inner.config.max_inactive_interval),
            this_accessed_time: AtomicI64::new(now_millis()),
            valid: AtomicBool::new(true),
            expiring: AtomicBool::new(false),
            span: inner.span.clone(),
        }
    }

    /// Create a session owned by `manager` and bound to `id`.
    pub fn with_id(manager: &SessionManager, id: &str) -> Result<Self> {
        let session = Self::new(manager);
        session.set_id(id)?;
        Ok(session)
    }

    /// Time the current request started using this session (memory only).
    pub fn this_accessed_time(&self) -> i64 {
        self.this_accessed_time.load(Ordering::SeqCst)
    }

    /// Whether an expiration is running right now.
    pub fn is_expiring(&self) -> bool {
        self.expiring.load(Ordering::SeqCst)
    }

    /// The id, or None (with a warning) if it is blank.
    fn checked_id(&self, operation: &'static str) -> Option<String> {
        let id = self.id.read().clone();
        if is_blank(&id) {
            warn!(parent: &self.span, operation, "Session operation invoked with blank id");
            return None;
        }
        Some(id)
    }
}

impl Session for StoredSession {
    fn id(&self) -> String {
        self.id.read().clone()
    }

    fn set_id(&self, id: &str) -> Result<()> {
        assign_id(&self.id, id)
    }

    fn attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        let Some(id) = self.checked_id("attribute") else {
            return Ok(None);
        };
        self.operations.attribute(&id, name)
    }

    fn set_attribute(&self, name: &str, value: Option<AttributeValue>) -> Result<()> {
        let Some(id) = self.checked_id("set_attribute") else {
            return Ok(());
        };
        match value {
            Some(value) => self.operations.set_attribute(&id, name, &value),
            None => self.operations.remove_attribute(&id, name),
        }
    }

    fn remove_attribute(&self, name: &str) -> Result<()> {
        let Some(id) = self.checked_id("remove_attribute") else {
            return Ok(());
        };
        self.operations.remove_attribute(&id, name)
    }

    fn attribute_names(&self) -> Result<Vec<String>> {
        let Some(id) = self.checked_id("attribute_names") else {
            return Ok(Vec::new());
        };
        self.operations.attribute_names(&id)
    }

    fn creation_time(&self) -> Result<i64> {
        let Some(id) = self.checked_id("creation_time") else {
            return Ok(MISSING_TIME);
        };
        self.operations.creation_time(&id)
    }

    fn set_creation_time(&self, time: i64) -> Result<()> {
        let Some(id) = self.checked_id("set_creation_time") else {
            return Ok(());
        };
        self.operations.set_creation_time(&id, time)
    }

    fn last_accessed_time(&self) -> Result<i64> {
        let Some(id) = self.checked_id("last_accessed_time") else {
            return Ok(MISSING_TIME);
        };
        self.operations.last_accessed_time(&id)
    }

    fn set_last_accessed_time(&self, time: i64) -> Result<()> {
        let Some(id) = self.checked_id("set_last_accessed_time") else {
            return Ok(());
        };
        self.operations.set_last_accessed_time(&id, time)
    }

    fn max_inactive_interval(&self) -> Option<Duration> {
        *self.max_inactive_interval.read()
    }

    fn set_max_inactive_interval(&self, interval: Option<Duration>) {
        *self.max_inactive_interval.write() = interval;
    }

    fn access(&self) -> Result<()> {
        let now = now_millis();
        self.this_accessed_time.store(now, Ordering::SeqCst);
        self.set_last_accessed_time(now)
    }

    fn is_valid(&self) -> bool {
        if self.expiring.load(Ordering::SeqCst) {
            return true;
        }
        if !self.valid.load(Ordering::SeqCst) {
            return false;
        }

        // An unreadable timestamp counts as a missing one.
        let last_accessed = match self.last_accessed_time() {
            Ok(time) => time,
            Err(e) => {
                error!(parent: &self.span, session_id = %self.id(), error = %e, "Could not read last accessed time");
                MISSING_TIME
            }
        };
        if last_accessed < 0 {
            self.valid.store(false, Ordering::SeqCst);
            return false;
        }

        let policy = IdlePolicy::new(self.max_inactive_interval());
        let now = now_millis();
        if policy.timeout().is_some() && policy.is_expired(last_accessed, now) {
            debug!(
                parent: &self.span,
                session_id = %self.id(),
                idle_secs = IdlePolicy::idle_secs(last_accessed, now),
                "Expiring idle session"
            );
            self.expire();
        }

        self.valid.load(Ordering::SeqCst)
    }

    fn expire(&self) {
        if self.expiring.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.valid.swap(false, Ordering::SeqCst) {
            let id = self.id();
            if let Some(manager) = self.manager.upgrade() {
                manager.notify(&SessionEvent::Destroyed { id: id.clone() });
                manager.untrack(&id);
            }
            debug!(parent: &self.span, session_id = %id, "Session expired");
        }
        self.expiring.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for StoredSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredSession")
            .field("id", &*self.id.read())
            .field("valid", &self.valid.load(Ordering::SeqCst))
            .field("max_inactive_interval", &*self.max_inactive_interval.read())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for StoredSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoredSession[{}]", self.id.read())
    }
}
