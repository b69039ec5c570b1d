//! Error types for the column-store backend.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by a [`ClusterClient`](crate::ClusterClient).
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Could not establish the connection pool.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// No connection is open.
    #[error("Not connected to the cluster")]
    NotConnected,

    /// A request did not complete in time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The cluster could not serve the request (no live hosts, pool exhausted).
    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    /// Too many consecutive timeouts; requests fail fast until the cooldown ends.
    #[error("Cluster marked unhealthy after {0} consecutive timeouts")]
    Unhealthy(u32),

    /// The cluster rejected or failed a query.
    #[error("Query failed: {0}")]
    Query(String),

    /// Keyspace or column family provisioning failed.
    #[error("Schema operation failed: {0}")]
    Schema(String),

    /// A blocking call was made from inside an async runtime.
    #[error("Blocking cluster call made from an async context")]
    BlockingInAsyncContext,
}

impl ClusterError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}

/// Result type for cluster client calls.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Errors from loading or validating [`CassandraConfig`](crate::CassandraConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A seed host entry is malformed.
    #[error("Invalid seed host '{0}'")]
    InvalidSeed(String),

    /// A setting is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
