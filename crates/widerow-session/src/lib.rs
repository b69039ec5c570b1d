//! Session state persisted outside the process.
//!
//! This crate provides the storage-agnostic half of widerow:
//! - An attribute codec that resolves types through an explicit registry
//! - The [`SessionOperations`] contract every storage backend implements
//! - Session objects ([`StoredSession`], [`StandardSession`]) and the
//!   [`SessionManager`] that owns them, with idle-timeout expiry
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use widerow_session::{ManagerConfig, MemorySessionOperations, SessionManager, TypeRegistry};
//!
//! let manager = SessionManager::new(
//!     Arc::new(MemorySessionOperations::new()),
//!     Arc::new(TypeRegistry::new()),
//!     ManagerConfig::default().with_max_inactive_interval(Duration::from_secs(1800)),
//! );
//! manager.start()?;
//! let session = manager.create_session("3F2504E0")?;
//! session.set_attribute("user", Some("ana".into()))?;
//! ```

mod codec;
mod config;
mod error;
mod idle;
mod manager;
mod operations;
mod session;

pub use codec::{AttributeCodec, AttributeValue, TypeRegistry};
pub use config::{DEFAULT_MAX_INACTIVE_INTERVAL, ManagerConfig};
pub use error::{Error, Result};
pub use idle::{IdlePolicy, now_millis};
pub use manager::{SessionEvent, SessionListener, SessionManager};
pub use operations::{
    BackendState, CREATION_TIME_COLUMN, LAST_ACCESSED_TIME_COLUMN, Lifecycle, MISSING_TIME,
    MemorySessionOperations, SessionOperations, check_attribute_name, decode_time, encode_time,
    is_reserved_column,
};
pub use session::{Session, StandardSession, StoredSession, is_blank};
