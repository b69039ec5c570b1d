//! Error types for session persistence operations.

/// Error type for session persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The session id is empty or whitespace only.
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// The session already carries a different id.
    #[error("Session id already assigned: {0}")]
    IdAlreadyAssigned(String),

    /// A session with this id is already tracked or stored.
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// The storage backend has not been initialized yet.
    #[error("Storage backend not initialized")]
    NotInitialized,

    /// `initialize` was called on a backend that already left the uninitialized state.
    #[error("Storage backend already initialized")]
    AlreadyInitialized,

    /// The storage backend is shutting down or has shut down.
    #[error("Storage backend shut down")]
    ShutDown,

    /// The attribute name collides with a reserved timestamp column.
    #[error("Attribute name is reserved: {0}")]
    ReservedAttributeName(String),

    /// The value's Rust type has no entry in the type registry.
    #[error("Type not registered for attribute encoding: {0}")]
    UnregisteredType(&'static str),

    /// The stored type tag has no entry in the type registry.
    #[error("Unknown attribute type tag: {0}")]
    UnknownTypeTag(String),

    /// Attribute bytes could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A stored column does not have the expected shape.
    #[error("Malformed column '{column}': {reason}")]
    MalformedColumn { column: String, reason: String },

    /// The storage backend failed to complete an operation.
    #[error("Storage operation '{operation}' failed for session '{session_id}': {source}")]
    Storage {
        operation: &'static str,
        session_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    /// Wrap a backend failure with the operation context it happened in.
    pub fn storage(
        operation: &'static str,
        session_id: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Storage {
            operation,
            session_id: session_id.into(),
            source: source.into(),
        }
    }
}

/// Result type for session persistence operations.
pub type Result<T> = std::result::Result<T, Error>;
