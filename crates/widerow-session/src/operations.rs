//! The storage operations contract.
//!
//! [`SessionOperations`] is everything a stored session needs from a
//! backend: two timestamps, an attribute bag, and row-level enumeration and
//! removal. All calls are synchronous; they block until the backend has
//! answered or failed.
//!
//! # Architecture
//!
//! ```text
//! SessionOperations (trait)       - per-session storage calls
//!     └── MemorySessionOperations - in-process rows, used in tests
//!     └── ColumnStoreOperations   - wide-column backend (widerow-cassandra)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::codec::{AttributeCodec, AttributeValue, TypeRegistry};
use crate::error::{Error, Result};

/// Reserved column holding the creation timestamp.
pub const CREATION_TIME_COLUMN: &str = "creationTime";

/// Reserved column holding the last-accessed timestamp.
pub const LAST_ACCESSED_TIME_COLUMN: &str = "lastAccessedTime";

/// Returned by timestamp reads when the column does not exist.
pub const MISSING_TIME: i64 = -1;

/// Whether `name` is one of the reserved timestamp columns.
pub fn is_reserved_column(name: &str) -> bool {
    name == CREATION_TIME_COLUMN || name == LAST_ACCESSED_TIME_COLUMN
}

/// Reject attribute names that would overwrite a timestamp column.
pub fn check_attribute_name(name: &str) -> Result<()> {
    if is_reserved_column(name) {
        return Err(Error::ReservedAttributeName(name.to_string()));
    }
    Ok(())
}

/// Stored form of a timestamp column (big-endian i64).
pub fn encode_time(time: i64) -> [u8; 8] {
    time.to_be_bytes()
}

/// Read a timestamp column back.
pub fn decode_time(column: &str, bytes: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| Error::MalformedColumn {
        column: column.to_string(),
        reason: format!("expected 8 bytes, found {}", bytes.len()),
    })?;
    Ok(i64::from_be_bytes(raw))
}

// ─────────────────────────────────────────────────────────────────────────────
// Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Storage operations for session rows, keyed by session id.
///
/// Reads that find nothing return a defined "missing" result
/// ([`MISSING_TIME`] or `None`) rather than an error; errors always mean
/// the backend could not answer.
pub trait SessionOperations: Send + Sync {
    /// Acquire backend resources. `registry` resolves attribute types for
    /// every subsequent read and write.
    fn initialize(&self, registry: Arc<TypeRegistry>) -> Result<()>;

    /// Release backend resources. Valid once, after `initialize`.
    fn shutdown(&self) -> Result<()>;

    /// Creation time in epoch millis, or [`MISSING_TIME`].
    fn creation_time(&self, session_id: &str) -> Result<i64>;

    /// Store the creation time.
    fn set_creation_time(&self, session_id: &str, time: i64) -> Result<()>;

    /// Last-accessed time in epoch millis, or [`MISSING_TIME`].
    fn last_accessed_time(&self, session_id: &str) -> Result<i64>;

    /// Store the last-accessed time.
    fn set_last_accessed_time(&self, session_id: &str, time: i64) -> Result<()>;

    /// Store both timestamps of a new session.
    ///
    /// Backends that can write several columns atomically should override
    /// this so no reader ever sees a creation time without a last-accessed
    /// time.
    fn set_timestamps(&self, session_id: &str, created: i64, last_accessed: i64) -> Result<()> {
        self.set_creation_time(session_id, created)?;
        self.set_last_accessed_time(session_id, last_accessed)
    }

    /// Read one attribute.
    fn attribute(&self, session_id: &str, name: &str) -> Result<Option<AttributeValue>>;

    /// Write one attribute (last write wins).
    fn set_attribute(&self, session_id: &str, name: &str, value: &AttributeValue) -> Result<()>;

    /// Delete one attribute. Deleting a missing attribute is not an error.
    fn remove_attribute(&self, session_id: &str, name: &str) -> Result<()>;

    /// Every column name stored for the session, timestamps included.
    fn keys(&self, session_id: &str) -> Result<BTreeSet<String>>;

    /// Attribute names only (the reserved timestamp columns are left out).
    fn attribute_names(&self, session_id: &str) -> Result<Vec<String>> {
        Ok(self
            .keys(session_id)?
            .into_iter()
            .filter(|name| !is_reserved_column(name))
            .collect())
    }

    /// Ids of every session that has a row in storage.
    ///
    /// Scans the whole store; meant for startup and maintenance.
    fn find_session_keys(&self) -> Result<Vec<String>>;

    /// Delete the session's row: attributes and timestamps together.
    fn remove_session(&self, session_id: &str) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Backend lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendState {
    #[default]
    Uninitialized,
    /// An `initialize` call is acquiring resources.
    Initializing,
    Initialized,
    ShuttingDown,
    Shutdown,
}

/// Tracks a backend's [`BackendState`] and gates calls on it.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: RwLock<BackendState>,
}

impl Lifecycle {
    /// Start in [`BackendState::Uninitialized`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> BackendState {
        *self.state.read()
    }

    /// Succeeds only while initialized.
    pub fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            BackendState::Initialized => Ok(()),
            BackendState::Uninitialized | BackendState::Initializing => Err(Error::NotInitialized),
            BackendState::ShuttingDown | BackendState::Shutdown => Err(Error::ShutDown),
        }
    }

    /// Claim initialization: move from `Uninitialized` to `Initializing`.
    ///
    /// Only one caller can win; the others get [`Error::AlreadyInitialized`].
    pub fn begin_initialize(&self) -> Result<()> {
        let mut state = self.state.write();
        match *state {
            BackendState::Uninitialized => {
                *state = BackendState::Initializing;
                Ok(())
            }
            BackendState::Initializing | BackendState::Initialized => {
                Err(Error::AlreadyInitialized)
            }
            BackendState::ShuttingDown | BackendState::Shutdown => Err(Error::ShutDown),
        }
    }

    /// Move from `Initializing` to `Initialized`.
    pub fn mark_initialized(&self) -> Result<()> {
        let mut state = self.state.write();
        match *state {
            BackendState::Initializing => {
                *state = BackendState::Initialized;
                Ok(())
            }
            BackendState::Uninitialized => Err(Error::NotInitialized),
            BackendState::Initialized => Err(Error::AlreadyInitialized),
            BackendState::ShuttingDown | BackendState::Shutdown => Err(Error::ShutDown),
        }
    }

    /// Give up a failed initialization and return to `Uninitialized`.
    pub fn abort_initialize(&self) {
        let mut state = self.state.write();
        if *state == BackendState::Initializing {
            *state = BackendState::Uninitialized;
        }
    }

    /// Move from `Initialized` to `ShuttingDown`.
    pub fn begin_shutdown(&self) -> Result<()> {
        let mut state = self.state.write();
        match *state {
            BackendState::Initialized => {
                *state = BackendState::ShuttingDown;
                Ok(())
            }
            BackendState::Uninitialized | BackendState::Initializing => Err(Error::NotInitialized),
            BackendState::ShuttingDown | BackendState::Shutdown => Err(Error::ShutDown),
        }
    }

    /// Move to `Shutdown`.
    pub fn finish_shutdown(&self) {
        *self.state.write() = BackendState::Shutdown;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ─────────────────────────────────────────────────────────────────────────────

/// In-process implementation of [`SessionOperations`].
///
/// Rows live in a map behind a lock; values still go through the codec so
/// type registration mistakes show up here the same way they would against
/// a real backend. Counts data calls for tests.
#[derive(Debug, Default)]
pub struct MemorySessionOperations {
    rows: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    codec: RwLock<Option<AttributeCodec>>,
    lifecycle: Lifecycle,
    calls: AtomicUsize,
}

impl MemorySessionOperations {
    /// Create an empty, uninitialized store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of data calls made so far (lifecycle calls are not counted).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BackendState {
        self.lifecycle.state()
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.lifecycle.ensure_ready()
    }

    fn codec(&self) -> Result<AttributeCodec> {
        self.codec.read().clone().ok_or(Error::NotInitialized)
    }

    fn column(&self, session_id: &str, name: &str) -> Option<Vec<u8>> {
        self.rows
            .read()
            .get(session_id)
            .and_then(|row| row.get(name).cloned())
    }

    fn put(&self, session_id: &str, name: &str, bytes: Vec<u8>) {
        self.rows
            .write()
            .entry(session_id.to_string())
            .or_default()
            .insert(name.to_string(), bytes);
    }

    fn read_time(&self, session_id: &str, column: &str) -> Result<i64> {
        match self.column(session_id, column) {
            Some(bytes) => decode_time(column, &bytes),
            None => Ok(MISSING_TIME),
        }
    }
}

impl SessionOperations for MemorySessionOperations {
    fn initialize(&self, registry: Arc<TypeRegistry>) -> Result<()> {
        self.lifecycle.begin_initialize()?;
        *self.codec.write() = Some(AttributeCodec::new(registry));
        self.lifecycle.mark_initialized()?;
        debug!("In-memory session operations initialized");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.lifecycle.begin_shutdown()?;
        self.codec.write().take();
        self.lifecycle.finish_shutdown();
        Ok(())
    }

    fn creation_time(&self, session_id: &str) -> Result<i64> {
        self.enter()?;
        self.read_time(session_id, CREATION_TIME_COLUMN)
    }

    fn set_creation_time(&self, session_id: &str, time: i64) -> Result<()> {
        self.enter()?;
        self.put(session_id, CREATION_TIME_COLUMN, encode_time(time).to_vec());
        Ok(())
    }

    fn last_accessed_time(&self, session_id: &str) -> Result<i64> {
        self.enter()?;
        self.read_time(session_id, LAST_ACCESSED_TIME_COLUMN)
    }

    fn set_last_accessed_time(&self, session_id: &str, time: i64) -> Result<()> {
        self.enter()?;
        self.put(
            session_id,
            LAST_ACCESSED_TIME_COLUMN,
            encode_time(time).to_vec(),
        );
        Ok(())
    }

    fn set_timestamps(&self, session_id: &str, created: i64, last_accessed: i64) -> Result<()> {
        self.enter()?;
        let mut rows = self.rows.write();
        let row = rows.entry(session_id.to_string()).or_default();
        row.insert(
            CREATION_TIME_COLUMN.to_string(),
            encode_time(created).to_vec(),
        );
        row.insert(
            LAST_ACCESSED_TIME_COLUMN.to_string(),
            encode_time(last_accessed).to_vec(),
        );
        Ok(())
    }

    fn attribute(&self, session_id: &str, name: &str) -> Result<Option<AttributeValue>> {
        self.enter()?;
        check_attribute_name(name)?;
        match self.column(session_id, name) {
            Some(bytes) => Ok(Some(self.codec()?.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_attribute(&self, session_id: &str, name: &str, value: &AttributeValue) -> Result<()> {
        self.enter()?;
        check_attribute_name(name)?;
        let bytes = self.codec()?.encode(value)?;
        self.put(session_id, name, bytes);
        Ok(())
    }

    fn remove_attribute(&self, session_id: &str, name: &str) -> Result<()> {
        self.enter()?;
        check_attribute_name(name)?;
        let mut rows = self.rows.write();
        if let Some(row) = rows.get_mut(session_id) {
            row.remove(name);
            if row.is_empty() {
                rows.remove(session_id);
            }
        }
        Ok(())
    }

    fn keys(&self, session_id: &str) -> Result<BTreeSet<String>> {
        self.enter()?;
        Ok(self
            .rows
            .read()
            .get(session_id)
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn find_session_keys(&self) -> Result<Vec<String>> {
        self.enter()?;
        let mut ids: Vec<String> = self.rows.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        self.enter()?;
        self.rows.write().remove(session_id);
        Ok(())
    }
}
