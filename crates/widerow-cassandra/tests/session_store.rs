//! Integration tests: session manager and stored sessions over the column store.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use widerow_cassandra::{CassandraConfig, ColumnStoreOperations, InMemoryCluster, RetryConfig};
use widerow_session::{
    AttributeValue, CREATION_TIME_COLUMN, Error, LAST_ACCESSED_TIME_COLUMN, MISSING_TIME,
    ManagerConfig, Session, SessionManager, SessionOperations, StoredSession, TypeRegistry,
    now_millis,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Cart {
    items: Vec<String>,
    total_cents: u64,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("widerow_cassandra=debug,widerow_session=debug")
        .try_init();
}

fn registry() -> Arc<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    registry.register::<Cart>("cart");
    Arc::new(registry)
}

struct Fixture {
    cluster: Arc<InMemoryCluster>,
    backend: Arc<ColumnStoreOperations<InMemoryCluster>>,
    manager: SessionManager,
}

fn fixture_with(config: CassandraConfig, manager_config: ManagerConfig) -> Fixture {
    init_tracing();
    let cluster = Arc::new(InMemoryCluster::new());
    let backend = Arc::new(ColumnStoreOperations::new(config, Arc::clone(&cluster)));
    let manager = SessionManager::new(backend.clone(), registry(), manager_config);
    manager.start().expect("manager start failed");
    Fixture {
        cluster,
        backend,
        manager,
    }
}

fn fixture() -> Fixture {
    fixture_with(
        CassandraConfig::default(),
        ManagerConfig::default().with_max_inactive_interval(Duration::from_secs(30)),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Attributes
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_registered_struct_round_trip() {
    let f = fixture();
    let session = f.manager.create_session("3F2504E0").unwrap();
    let cart = Cart {
        items: vec!["book".into(), "lamp".into()],
        total_cents: 4_250,
    };

    session
        .set_attribute("cart", Some(AttributeValue::new(cart.clone())))
        .unwrap();

    let stored = session.attribute("cart").unwrap().unwrap();
    assert_eq!(stored.downcast_ref::<Cart>(), Some(&cart));
}

#[test]
fn test_unregistered_type_is_rejected() {
    #[derive(Debug)]
    struct Unknown;

    let f = fixture();
    let session = f.manager.create_session("s1").unwrap();
    let batches = f.cluster.batch_count();

    let result = session.set_attribute("x", Some(AttributeValue::new(Unknown)));
    assert!(matches!(result, Err(Error::UnregisteredType(_))));
    assert_eq!(f.cluster.batch_count(), batches);
}

#[test]
fn test_remove_attribute() {
    let f = fixture();
    let session = f.manager.create_session("s1").unwrap();
    session.set_attribute("a", Some("x".into())).unwrap();
    session.set_attribute("b", Some(2_i64.into())).unwrap();

    session.remove_attribute("a").unwrap();

    assert!(session.attribute("a").unwrap().is_none());
    assert_eq!(session.attribute_names().unwrap(), vec!["b".to_string()]);
}

#[test]
fn test_setting_none_removes_attribute() {
    let f = fixture();
    let session = f.manager.create_session("s1").unwrap();
    session.set_attribute("a", Some(true.into())).unwrap();

    session.set_attribute("a", None).unwrap();

    assert!(session.attribute("a").unwrap().is_none());
}

#[test]
fn test_reserved_names_are_not_attributes() {
    let f = fixture();
    let session = f.manager.create_session("s1").unwrap();

    assert!(matches!(
        session.set_attribute(CREATION_TIME_COLUMN, Some(1_i64.into())),
        Err(Error::ReservedAttributeName(_))
    ));
    assert!(session.attribute_names().unwrap().is_empty());

    let keys = f.backend.keys("s1").unwrap();
    assert!(keys.contains(CREATION_TIME_COLUMN));
    assert!(keys.contains(LAST_ACCESSED_TIME_COLUMN));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any string stored under any attribute name reads back unchanged.
    #[test]
    fn attribute_values_survive_storage(name in "[a-z][a-z0-9_]{0,15}", value in ".{0,64}") {
        let f = fixture();
        let session = f.manager.create_session("prop").unwrap();

        session.set_attribute(&name, Some(AttributeValue::from(value.clone()))).unwrap();

        let stored = session.attribute(&name).unwrap().unwrap();
        prop_assert_eq!(stored.downcast_ref::<String>(), Some(&value));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session rows
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_remove_session_clears_row() {
    let f = fixture();
    let session = f.manager.create_session("s1").unwrap();
    session.set_attribute("a", Some("x".into())).unwrap();

    f.manager.remove_session_data("s1").unwrap();

    assert!(f.backend.keys("s1").unwrap().is_empty());
    assert_eq!(f.backend.creation_time("s1").unwrap(), MISSING_TIME);
    assert_eq!(f.backend.last_accessed_time("s1").unwrap(), MISSING_TIME);
    assert_eq!(f.manager.active_sessions(), 0);
}

#[test]
fn test_creation_time_persists() {
    let f = fixture();
    let before = now_millis();
    let session = f.manager.create_session("s1").unwrap();

    let created = f.backend.creation_time("s1").unwrap();
    assert!(created >= before);
    assert_eq!(session.creation_time().unwrap(), created);

    session.set_creation_time(1_700_000_000_000).unwrap();
    assert_eq!(f.backend.creation_time("s1").unwrap(), 1_700_000_000_000);
}

#[test]
fn test_create_writes_one_batch() {
    let f = fixture();
    let batches = f.cluster.batch_count();

    f.manager.create_session("s1").unwrap();

    assert_eq!(f.cluster.batch_count(), batches + 1);
    let keys = f.backend.keys("s1").unwrap();
    assert!(keys.contains(CREATION_TIME_COLUMN));
    assert!(keys.contains(LAST_ACCESSED_TIME_COLUMN));
}

#[test]
fn test_create_keeps_existing_creation_time() {
    let f = fixture();
    f.manager.create_session("s1").unwrap();
    f.backend.set_creation_time("s1", 1_000).unwrap();

    assert!(matches!(
        f.manager.create_session("s1"),
        Err(Error::SessionExists(_))
    ));

    // Another node sharing the cluster sees the row and refuses too.
    let other = SessionManager::new(f.backend.clone(), registry(), ManagerConfig::default());
    assert!(matches!(
        other.create_session("s1"),
        Err(Error::SessionExists(_))
    ));
    assert_eq!(f.backend.creation_time("s1").unwrap(), 1_000);
    assert!(other.find_session("s1").unwrap().is_some());
}

#[test]
fn test_find_session_keys_lists_rows() {
    let f = fixture();
    f.manager.create_session("s1").unwrap();
    f.manager.create_session("s2").unwrap();

    let mut keys = f.backend.find_session_keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec!["s1".to_string(), "s2".to_string()]);
}

#[test]
fn test_second_manager_sees_sessions() {
    let f = fixture();
    f.manager.create_session("shared").unwrap();

    let other = SessionManager::new(f.backend.clone(), registry(), ManagerConfig::default());
    assert_eq!(other.load_persisted().unwrap(), 1);
    assert!(other.find_session("shared").unwrap().is_some());
    assert!(other.find_session("absent").unwrap().is_none());
}

// ─────────────────────────────────────────────────────────────────────────────
// Idle expiry
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_idle_session_expires() {
    let f = fixture();
    let session = f.manager.create_session("s1").unwrap();
    session
        .set_last_accessed_time(now_millis() - 31_000)
        .unwrap();

    assert!(!session.is_valid());
    assert_eq!(f.manager.active_sessions(), 0);
    // Expiring does not delete the row.
    assert!(!f.backend.keys("s1").unwrap().is_empty());
}

#[test]
fn test_recent_session_stays_valid() {
    let f = fixture();
    let session = f.manager.create_session("s1").unwrap();
    session
        .set_last_accessed_time(now_millis() - 10_000)
        .unwrap();

    assert!(session.is_valid());
    assert_eq!(f.manager.active_sessions(), 1);
}

#[test]
fn test_purge_removes_expired_rows() {
    let f = fixture();
    f.manager.create_session("fresh").unwrap();
    let stale = f.manager.create_session("stale").unwrap();
    stale
        .set_last_accessed_time(now_millis() - 60_000)
        .unwrap();

    assert_eq!(f.manager.purge_expired_rows().unwrap(), 1);
    assert_eq!(f.backend.find_session_keys().unwrap(), vec!["fresh".to_string()]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Blank ids
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_blank_id_never_reaches_cluster() {
    let f = fixture();
    let session = StoredSession::new(&f.manager);
    let reads = f.cluster.read_count();
    let batches = f.cluster.batch_count();

    assert!(session.attribute("a").unwrap().is_none());
    session.set_attribute("a", Some("x".into())).unwrap();
    assert_eq!(session.creation_time().unwrap(), MISSING_TIME);
    assert!(session.attribute_names().unwrap().is_empty());

    assert_eq!(f.cluster.read_count(), reads);
    assert_eq!(f.cluster.batch_count(), batches);
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_concurrent_writes_to_distinct_columns() {
    let f = fixture();
    let session = f.manager.create_session("s1").unwrap();

    let handles: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|prefix| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                for i in 0..25 {
                    session
                        .set_attribute(&format!("{prefix}_{i}"), Some((i as i64).into()))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(session.attribute_names().unwrap().len(), 50);
    let value = session.attribute("right_24").unwrap().unwrap();
    assert_eq!(value.downcast_ref::<i64>(), Some(&24));
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_cluster_failure_propagates() {
    let f = fixture();
    let session = f.manager.create_session("s1").unwrap();
    f.cluster.fail_next(1);

    let err = session.set_attribute("a", Some("x".into())).unwrap_err();
    assert!(matches!(
        err,
        Error::Storage {
            operation: "set_attribute",
            ..
        }
    ));
}

#[test]
fn test_unreadable_session_is_invalid() {
    let f = fixture();
    let session = f.manager.create_session("s1").unwrap();
    f.cluster.fail_next(1);

    assert!(!session.is_valid());
}

#[test]
fn test_retry_is_opt_in() {
    let config = CassandraConfig::default().with_retry(
        RetryConfig::attempts(3).with_backoff(Duration::from_millis(1), Duration::from_millis(4)),
    );
    let f = fixture_with(config, ManagerConfig::default());
    let session = f.manager.create_session("s1").unwrap();
    f.cluster.fail_next(2);

    session.set_attribute("a", Some("x".into())).unwrap();
    assert!(session.attribute("a").unwrap().is_some());
}

#[test]
fn test_unhealthy_cluster_fails_fast() {
    let mut config = CassandraConfig::default();
    config.pool.max_timeout_count = 2;
    config.pool.unhealthy_cooldown_ms = 60_000;
    let f = fixture_with(config, ManagerConfig::default());
    let session = f.manager.create_session("s1").unwrap();

    f.cluster.time_out_next(2);
    assert!(session.creation_time().is_err());
    assert!(session.creation_time().is_err());

    let reads = f.cluster.read_count();
    assert!(session.creation_time().is_err());
    assert_eq!(f.cluster.read_count(), reads);
}

#[test]
fn test_schema_failure_does_not_block_start() {
    init_tracing();
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.reject_schema_changes(true);
    let backend = Arc::new(ColumnStoreOperations::new(
        CassandraConfig::default(),
        Arc::clone(&cluster),
    ));
    let manager = SessionManager::new(backend, registry(), ManagerConfig::default());

    manager.start().unwrap();
    assert!(!cluster.has_keyspace("tomcat"));
    assert!(manager.create_session("s1").is_err());
}

#[test]
fn test_stop_closes_cluster() {
    let f = fixture();
    f.manager.create_session("s1").unwrap();

    f.manager.stop().unwrap();

    assert!(!f.cluster.is_connected());
    assert_eq!(f.manager.active_sessions(), 0);
    assert!(matches!(f.backend.keys("s1"), Err(Error::ShutDown)));
}
