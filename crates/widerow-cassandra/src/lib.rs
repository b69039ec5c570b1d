//! Wide-column storage backend for widerow sessions.
//!
//! [`ColumnStoreOperations`] implements
//! [`SessionOperations`](widerow_session::SessionOperations) on top of a
//! [`ClusterClient`]: one row per session id, one column per attribute, and
//! two reserved columns holding the creation and last-accessed timestamps.
//!
//! Two clients are provided:
//! - [`ScyllaCluster`] talks CQL to a Scylla or Cassandra cluster
//! - [`InMemoryCluster`] keeps everything in process, for tests and local runs
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use widerow_cassandra::{CassandraConfig, ColumnStoreOperations, ScyllaCluster};
//! use widerow_session::{ManagerConfig, SessionManager, TypeRegistry};
//!
//! let config = CassandraConfig::load("cassandra.toml")?;
//! let backend = ColumnStoreOperations::new(config, Arc::new(ScyllaCluster::new()?));
//! let manager = SessionManager::new(
//!     Arc::new(backend),
//!     Arc::new(TypeRegistry::new()),
//!     ManagerConfig::default(),
//! );
//! manager.start()?;
//! ```

mod backend;
mod client;
mod config;
mod driver;
mod error;
mod health;
mod memory;

pub use backend::ColumnStoreOperations;
pub use client::{ClusterClient, Column, KeyspaceDefinition, Mutation, MutationBatch};
pub use config::{
    CassandraConfig, DEFAULT_PORT, PoolConfig, ReplicationConfig, RetryConfig, SeedHost,
};
pub use driver::ScyllaCluster;
pub use error::{ClusterError, ClusterResult, ConfigError};
pub use health::HostHealth;
pub use memory::InMemoryCluster;
