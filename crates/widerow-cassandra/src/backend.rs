//! [`SessionOperations`] over a wide-column cluster.
//!
//! One row per session id, one column per attribute, plus the two reserved
//! timestamp columns. Reads fetch the whole row in a single round trip;
//! every write is its own single-row [`MutationBatch`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use widerow_session::{
    AttributeCodec, AttributeValue, BackendState, CREATION_TIME_COLUMN, Error,
    LAST_ACCESSED_TIME_COLUMN, Lifecycle, MISSING_TIME, Result, SessionOperations, TypeRegistry,
    check_attribute_name, decode_time, encode_time,
};

use crate::client::{ClusterClient, Column, KeyspaceDefinition, MutationBatch};
use crate::config::CassandraConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::health::HostHealth;

/// Placeholder session id for operations that span all sessions.
const ALL_SESSIONS: &str = "*";

/// Column-store implementation of [`SessionOperations`].
///
/// Failures from the cluster are logged with their context and returned as
/// [`Error::Storage`]. Nothing is retried unless `retry.max_attempts` in the
/// configuration is raised above one.
pub struct ColumnStoreOperations<C: ClusterClient> {
    config: CassandraConfig,
    client: Arc<C>,
    codec: RwLock<Option<AttributeCodec>>,
    lifecycle: Lifecycle,
    health: HostHealth,
    span: tracing::Span,
}

impl<C: ClusterClient> ColumnStoreOperations<C> {
    /// Create an uninitialized backend. Nothing connects until `initialize`.
    pub fn new(config: CassandraConfig, client: Arc<C>) -> Self {
        let health = HostHealth::new(
            config.pool.max_timeout_count,
            config.pool.unhealthy_cooldown(),
        );
        let span = tracing::info_span!(
            "widerow_cassandra",
            keyspace = %config.keyspace,
            column_family = %config.column_family
        );
        Self {
            config,
            client,
            codec: RwLock::new(None),
            lifecycle: Lifecycle::new(),
            health,
            span,
        }
    }

    /// Emit this backend's events under `span`.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &CassandraConfig {
        &self.config
    }

    /// The underlying cluster client.
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn state(&self) -> BackendState {
        self.lifecycle.state()
    }

    /// Connection health as seen by this backend.
    pub fn health(&self) -> &HostHealth {
        &self.health
    }

    /// Create the keyspace and column family if the keyspace is missing.
    ///
    /// Failures are logged and swallowed: the schema may exist already or be
    /// managed elsewhere.
    fn provision(&self) {
        let keyspace = &self.config.keyspace;
        match self.client.describe_keyspace(keyspace) {
            Ok(true) => debug!(keyspace = %keyspace, "Keyspace exists"),
            Ok(false) => {
                let definition = KeyspaceDefinition::from_config(&self.config);
                info!(
                    keyspace = %keyspace,
                    strategy = %definition.strategy_class,
                    replication_factor = definition.replication_factor,
                    "Creating keyspace"
                );
                if let Err(e) = self.client.create_keyspace(&definition) {
                    error!(keyspace = %keyspace, error = %e, "Could not create keyspace");
                }
            }
            Err(e) => error!(keyspace = %keyspace, error = %e, "Could not describe keyspace"),
        }
    }

    /// Connect, provision, and install the codec. Runs while the lifecycle
    /// is claimed as `Initializing`.
    fn connect_and_provision(&self, registry: Arc<TypeRegistry>) -> Result<()> {
        self.config
            .validate()
            .map_err(|e| Error::storage("initialize", ALL_SESSIONS, e))?;

        info!(
            seeds = %self.config.seed_hosts,
            cluster = %self.config.cluster_name,
            max_conns_per_host = self.config.pool.max_conns_per_host,
            "Connecting to cluster"
        );
        self.client.connect(&self.config).map_err(|e| {
            error!(error = %e, "Could not connect to cluster");
            Error::storage("initialize", ALL_SESSIONS, e)
        })?;

        self.provision();

        *self.codec.write() = Some(AttributeCodec::new(registry));
        self.lifecycle.mark_initialized()?;
        info!("Column store backend initialized");
        Ok(())
    }

    fn codec(&self) -> Result<AttributeCodec> {
        self.codec.read().clone().ok_or(Error::NotInitialized)
    }

    /// Run one cluster call under the health gate and retry policy.
    fn call<T>(&self, operation: &'static str, f: impl Fn() -> ClusterResult<T>) -> ClusterResult<T> {
        let retry = &self.config.retry;
        let mut attempt = 1;
        loop {
            self.health.check()?;
            match f() {
                Ok(value) => {
                    self.health.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    if matches!(e, ClusterError::Timeout(_)) {
                        self.health.record_timeout();
                    }
                    if !e.is_transient() || attempt >= retry.max_attempts {
                        return Err(e);
                    }
                    let delay = retry.backoff(attempt - 1)
                        + Duration::from_millis(rand::random::<u64>() % 50);
                    warn!(
                        parent: &self.span,
                        operation,
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying cluster call"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    fn read_row(&self, operation: &'static str, session_id: &str) -> Result<Vec<Column>> {
        self.lifecycle.ensure_ready()?;
        let result = self.call(operation, || {
            self.client.fetch_row(
                &self.config.keyspace,
                &self.config.column_family,
                session_id.as_bytes(),
            )
        });
        result.map_err(|e| {
            error!(parent: &self.span, operation, session_id = %session_id, error = %e, "Could not read session row");
            Error::storage(operation, session_id, e)
        })
    }

    fn read_column(
        &self,
        operation: &'static str,
        session_id: &str,
        column: &str,
    ) -> Result<Option<Vec<u8>>> {
        let columns = self.read_row(operation, session_id)?;
        Ok(columns
            .into_iter()
            .find(|c| c.is_named(column))
            .map(|c| c.value))
    }

    fn read_time(&self, operation: &'static str, session_id: &str, column: &str) -> Result<i64> {
        debug!(parent: &self.span, operation, session_id = %session_id, "Reading timestamp");
        match self.read_column(operation, session_id, column)? {
            Some(bytes) => decode_time(column, &bytes),
            None => Ok(MISSING_TIME),
        }
    }

    fn mutate(
        &self,
        operation: &'static str,
        session_id: &str,
        column: Option<&str>,
        build: impl FnOnce(&mut MutationBatch),
    ) -> Result<()> {
        self.lifecycle.ensure_ready()?;
        let mut batch = MutationBatch::new(self.config.column_family.as_str(), session_id.as_bytes());
        build(&mut batch);

        let result = self.call(operation, || self.client.execute(&self.config.keyspace, &batch));
        result.map_err(|e| {
            error!(
                parent: &self.span,
                operation,
                session_id = %session_id,
                column = column.unwrap_or(""),
                error = %e,
                "Could not apply session mutation"
            );
            Error::storage(operation, session_id, e)
        })
    }
}

impl<C: ClusterClient> SessionOperations for ColumnStoreOperations<C> {
    fn initialize(&self, registry: Arc<TypeRegistry>) -> Result<()> {
        let _span = self.span.enter();
        self.lifecycle.begin_initialize()?;
        let result = self.connect_and_provision(registry);
        if result.is_err() {
            self.lifecycle.abort_initialize();
        }
        result
    }

    fn shutdown(&self) -> Result<()> {
        let _span = self.span.enter();
        self.lifecycle.begin_shutdown()?;
        info!("Shutting down cluster connection");

        let result = self.client.close();
        self.codec.write().take();
        self.lifecycle.finish_shutdown();

        result.map_err(|e| {
            error!(error = %e, "Error while closing cluster connection");
            Error::storage("shutdown", ALL_SESSIONS, e)
        })?;
        info!("Cluster connection closed");
        Ok(())
    }

    fn creation_time(&self, session_id: &str) -> Result<i64> {
        self.read_time("creation_time", session_id, CREATION_TIME_COLUMN)
    }

    fn set_creation_time(&self, session_id: &str, time: i64) -> Result<()> {
        debug!(parent: &self.span, session_id = %session_id, time, "Setting creation time");
        self.mutate(
            "set_creation_time",
            session_id,
            Some(CREATION_TIME_COLUMN),
            |batch| {
                batch.put_column(CREATION_TIME_COLUMN, encode_time(time).to_vec());
            },
        )
    }

    fn last_accessed_time(&self, session_id: &str) -> Result<i64> {
        self.read_time("last_accessed_time", session_id, LAST_ACCESSED_TIME_COLUMN)
    }

    fn set_last_accessed_time(&self, session_id: &str, time: i64) -> Result<()> {
        debug!(parent: &self.span, session_id = %session_id, time, "Setting last accessed time");
        self.mutate(
            "set_last_accessed_time",
            session_id,
            Some(LAST_ACCESSED_TIME_COLUMN),
            |batch| {
                batch.put_column(LAST_ACCESSED_TIME_COLUMN, encode_time(time).to_vec());
            },
        )
    }

    fn set_timestamps(&self, session_id: &str, created: i64, last_accessed: i64) -> Result<()> {
        debug!(parent: &self.span, session_id = %session_id, created, last_accessed, "Setting timestamps");
        self.mutate("set_timestamps", session_id, None, |batch| {
            batch
                .put_column(CREATION_TIME_COLUMN, encode_time(created).to_vec())
                .put_column(LAST_ACCESSED_TIME_COLUMN, encode_time(last_accessed).to_vec());
        })
    }

    fn attribute(&self, session_id: &str, name: &str) -> Result<Option<AttributeValue>> {
        check_attribute_name(name)?;
        debug!(parent: &self.span, session_id = %session_id, attribute = name, "Reading attribute");
        match self.read_column("attribute", session_id, name)? {
            Some(bytes) => {
                let value = self.codec()?.decode(&bytes).inspect_err(|e| {
                    error!(
                        parent: &self.span,
                        session_id = %session_id,
                        attribute = name,
                        error = %e,
                        "Could not decode attribute"
                    );
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set_attribute(&self, session_id: &str, name: &str, value: &AttributeValue) -> Result<()> {
        check_attribute_name(name)?;
        debug!(
            parent: &self.span,
            session_id = %session_id,
            attribute = name,
            value_type = value.type_name(),
            "Setting attribute"
        );
        let bytes = self.codec()?.encode(value)?;
        self.mutate("set_attribute", session_id, Some(name), |batch| {
            batch.put_column(name, bytes);
        })
    }

    fn remove_attribute(&self, session_id: &str, name: &str) -> Result<()> {
        check_attribute_name(name)?;
        debug!(parent: &self.span, session_id = %session_id, attribute = name, "Removing attribute");
        self.mutate("remove_attribute", session_id, Some(name), |batch| {
            batch.delete_column(name);
        })
    }

    fn keys(&self, session_id: &str) -> Result<BTreeSet<String>> {
        let columns = self.read_row("keys", session_id)?;
        Ok(columns.iter().map(Column::name_lossy).collect())
    }

    fn find_session_keys(&self) -> Result<Vec<String>> {
        let _span = self.span.enter();
        self.lifecycle.ensure_ready()?;
        let keys = self
            .call("find_session_keys", || {
                self.client
                    .scan_row_keys(&self.config.keyspace, &self.config.column_family)
            })
            .map_err(|e| {
                error!(error = %e, "Could not scan session keys");
                Error::storage("find_session_keys", ALL_SESSIONS, e)
            })?;

        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            match String::from_utf8(key) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(key = ?e.as_bytes(), "Skipping row key that is not UTF-8"),
            }
        }
        debug!(count = ids.len(), "Scanned session keys");
        Ok(ids)
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        debug!(parent: &self.span, session_id = %session_id, "Removing session row");
        self.mutate("remove_session", session_id, None, |batch| {
            batch.delete_row();
        })
    }
}

impl<C: ClusterClient> std::fmt::Debug for ColumnStoreOperations<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnStoreOperations")
            .field("keyspace", &self.config.keyspace)
            .field("column_family", &self.config.column_family)
            .field("state", &self.lifecycle.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCluster;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn backend(config: CassandraConfig) -> (ColumnStoreOperations<InMemoryCluster>, Arc<InMemoryCluster>) {
        let cluster = Arc::new(InMemoryCluster::new());
        let ops = ColumnStoreOperations::new(config, Arc::clone(&cluster));
        (ops, cluster)
    }

    fn ready() -> (ColumnStoreOperations<InMemoryCluster>, Arc<InMemoryCluster>) {
        let (ops, cluster) = backend(CassandraConfig::default());
        ops.initialize(Arc::new(TypeRegistry::new())).unwrap();
        (ops, cluster)
    }

    #[test]
    fn test_initialize_provisions_keyspace() {
        let (ops, cluster) = ready();
        assert!(cluster.is_connected());
        assert!(cluster.has_keyspace("tomcat"));
        assert_eq!(ops.state(), BackendState::Initialized);
    }

    #[test]
    fn test_provisioning_failure_is_not_fatal() {
        let (ops, cluster) = backend(CassandraConfig::default());
        cluster.reject_schema_changes(true);

        ops.initialize(Arc::new(TypeRegistry::new())).unwrap();

        assert_eq!(ops.state(), BackendState::Initialized);
        // Without a schema, data calls surface the cluster error.
        assert!(matches!(
            ops.creation_time("s1"),
            Err(Error::Storage { operation: "creation_time", .. })
        ));
    }

    #[test]
    fn test_connect_failure_fails_initialize() {
        let (ops, cluster) = backend(CassandraConfig::default());
        cluster.fail_next(1);

        assert!(matches!(
            ops.initialize(Arc::new(TypeRegistry::new())),
            Err(Error::Storage { operation: "initialize", .. })
        ));
        assert_eq!(ops.state(), BackendState::Uninitialized);
    }

    #[test]
    fn test_invalid_config_fails_initialize() {
        let (ops, cluster) = backend(CassandraConfig::default().with_keyspace("bad-name"));
        assert!(ops.initialize(Arc::new(TypeRegistry::new())).is_err());
        assert!(!cluster.is_connected());
    }

    #[test]
    fn test_calls_before_initialize_rejected() {
        let (ops, cluster) = backend(CassandraConfig::default());
        assert!(matches!(ops.keys("s1"), Err(Error::NotInitialized)));
        assert!(matches!(ops.find_session_keys(), Err(Error::NotInitialized)));
        assert_eq!(cluster.read_count(), 0);
    }

    #[test]
    fn test_each_write_is_one_batch() {
        let (ops, cluster) = ready();
        ops.set_creation_time("s1", 1).unwrap();
        ops.set_attribute("s1", "a", &AttributeValue::from("x"))
            .unwrap();
        ops.remove_attribute("s1", "a").unwrap();
        ops.remove_session("s1").unwrap();

        assert_eq!(cluster.batch_count(), 4);
    }

    #[test]
    fn test_timestamps_written_in_one_batch() {
        let (ops, cluster) = ready();
        ops.set_timestamps("s1", 10, 20).unwrap();

        assert_eq!(cluster.batch_count(), 1);
        assert_eq!(ops.creation_time("s1").unwrap(), 10);
        assert_eq!(ops.last_accessed_time("s1").unwrap(), 20);
    }

    /// Counts connects and holds each one open long enough for callers to overlap.
    #[derive(Default)]
    struct SlowConnect {
        inner: InMemoryCluster,
        connects: AtomicUsize,
    }

    impl ClusterClient for SlowConnect {
        fn connect(&self, config: &CassandraConfig) -> ClusterResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            self.inner.connect(config)
        }

        fn describe_keyspace(&self, keyspace: &str) -> ClusterResult<bool> {
            self.inner.describe_keyspace(keyspace)
        }

        fn create_keyspace(&self, definition: &KeyspaceDefinition) -> ClusterResult<()> {
            self.inner.create_keyspace(definition)
        }

        fn fetch_row(&self, keyspace: &str, cf: &str, row_key: &[u8]) -> ClusterResult<Vec<Column>> {
            self.inner.fetch_row(keyspace, cf, row_key)
        }

        fn scan_row_keys(&self, keyspace: &str, cf: &str) -> ClusterResult<Vec<Vec<u8>>> {
            self.inner.scan_row_keys(keyspace, cf)
        }

        fn execute(&self, keyspace: &str, batch: &MutationBatch) -> ClusterResult<()> {
            self.inner.execute(keyspace, batch)
        }

        fn close(&self) -> ClusterResult<()> {
            self.inner.close()
        }
    }

    #[test]
    fn test_concurrent_initialize_connects_once() {
        let cluster = Arc::new(SlowConnect::default());
        let ops = Arc::new(ColumnStoreOperations::new(
            CassandraConfig::default(),
            Arc::clone(&cluster),
        ));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let ops = Arc::clone(&ops);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ops.initialize(Arc::new(TypeRegistry::new()))
                })
            })
            .collect();
        let results: Vec<Result<()>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(cluster.connects.load(Ordering::SeqCst), 1);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(Error::AlreadyInitialized)))
        );
        assert_eq!(ops.state(), BackendState::Initialized);
    }

    #[test]
    fn test_failed_initialize_can_be_retried() {
        let (ops, cluster) = backend(CassandraConfig::default());
        cluster.fail_next(1);
        assert!(ops.initialize(Arc::new(TypeRegistry::new())).is_err());

        ops.initialize(Arc::new(TypeRegistry::new())).unwrap();
        assert_eq!(ops.state(), BackendState::Initialized);
    }

    #[test]
    fn test_read_is_one_round_trip() {
        let (ops, cluster) = ready();
        ops.set_attribute("s1", "a", &AttributeValue::from(1_i64))
            .unwrap();

        let before = cluster.read_count();
        let value = ops.attribute("s1", "a").unwrap().unwrap();
        assert_eq!(value.downcast_ref::<i64>(), Some(&1));
        assert_eq!(cluster.read_count(), before + 1);
    }

    #[test]
    fn test_keys_include_reserved_columns() {
        let (ops, _) = ready();
        ops.set_creation_time("s1", 10).unwrap();
        ops.set_last_accessed_time("s1", 20).unwrap();
        ops.set_attribute("s1", "cart", &AttributeValue::from("full"))
            .unwrap();

        let keys = ops.keys("s1").unwrap();
        let expected: BTreeSet<String> = [CREATION_TIME_COLUMN, LAST_ACCESSED_TIME_COLUMN, "cart"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(keys, expected);
        assert_eq!(ops.attribute_names("s1").unwrap(), vec!["cart".to_string()]);
    }

    #[test]
    fn test_failure_surfaces_without_retry() {
        let (ops, cluster) = ready();
        cluster.fail_next(1);

        let err = ops
            .set_attribute("s1", "a", &AttributeValue::from(true))
            .unwrap_err();
        match err {
            Error::Storage {
                operation,
                session_id,
                ..
            } => {
                assert_eq!(operation, "set_attribute");
                assert_eq!(session_id, "s1");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(cluster.batch_count(), 0);

        // The next call is unaffected.
        ops.set_attribute("s1", "a", &AttributeValue::from(true))
            .unwrap();
    }

    #[test]
    fn test_opt_in_retry_recovers_transient_failure() {
        let config = CassandraConfig::default().with_retry(
            crate::config::RetryConfig::attempts(3)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(2)),
        );
        let (ops, cluster) = backend(config);
        ops.initialize(Arc::new(TypeRegistry::new())).unwrap();
        cluster.fail_next(2);

        ops.set_creation_time("s1", 99).unwrap();
        assert_eq!(ops.creation_time("s1").unwrap(), 99);
    }

    #[test]
    fn test_consecutive_timeouts_trip_health() {
        let mut config = CassandraConfig::default();
        config.pool.max_timeout_count = 2;
        config.pool.unhealthy_cooldown_ms = 60_000;
        let (ops, cluster) = backend(config);
        ops.initialize(Arc::new(TypeRegistry::new())).unwrap();
        cluster.time_out_next(2);

        assert!(ops.creation_time("s1").is_err());
        assert!(ops.creation_time("s1").is_err());
        assert!(!ops.health().is_healthy());

        // Fails fast without reaching the cluster.
        let reads = cluster.read_count();
        let err = ops.creation_time("s1").unwrap_err();
        assert!(err.to_string().contains("unhealthy"));
        assert_eq!(cluster.read_count(), reads);
    }

    #[test]
    fn test_shutdown_closes_client() {
        let (ops, cluster) = ready();
        ops.shutdown().unwrap();

        assert!(!cluster.is_connected());
        assert_eq!(ops.state(), BackendState::Shutdown);
        assert!(matches!(ops.creation_time("s1"), Err(Error::ShutDown)));
        assert!(matches!(ops.shutdown(), Err(Error::ShutDown)));
    }

    #[test]
    fn test_corrupt_attribute_reports_codec_error() {
        let (ops, cluster) = ready();
        let mut batch = MutationBatch::new("sessions", "s1");
        batch.put_column("broken", b"{not json".to_vec());
        cluster.execute("tomcat", &batch).unwrap();

        assert!(matches!(ops.attribute("s1", "broken"), Err(Error::Codec(_))));
    }
}
