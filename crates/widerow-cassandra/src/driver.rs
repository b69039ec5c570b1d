//! [`ClusterClient`] backed by the Scylla/Cassandra CQL driver.
//!
//! The driver is async; this client owns a small tokio runtime and blocks on
//! it so the backend stays synchronous. Calling it from inside another tokio
//! runtime returns [`ClusterError::BlockingInAsyncContext`] instead of
//! panicking.
//!
//! Each column family is a CQL table:
//!
//! ```text
//! CREATE TABLE "<keyspace>"."<cf>" (
//!     key blob, column1 blob, value blob,
//!     PRIMARY KEY (key, column1)
//! )
//! ```

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use parking_lot::RwLock;
use scylla::client::PoolSize;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::statement::batch::{Batch, BatchType};
use scylla::value::CqlValue;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

use crate::client::{ClusterClient, Column, KeyspaceDefinition, Mutation, MutationBatch};
use crate::config::CassandraConfig;
use crate::error::{ClusterError, ClusterResult};

/// Driver threads. Calls block the caller, so the runtime only drives I/O.
const RUNTIME_THREADS: usize = 2;

struct Connection {
    session: Arc<Session>,
    request_timeout: Duration,
}

/// Blocking CQL client for a Scylla or Cassandra cluster.
pub struct ScyllaCluster {
    /// Always `Some` until dropped.
    runtime: Option<Runtime>,
    connection: RwLock<Option<Connection>>,
}

impl ScyllaCluster {
    /// Build the driver runtime. Nothing connects until [`ClusterClient::connect`].
    pub fn new() -> ClusterResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(RUNTIME_THREADS)
            .thread_name("widerow-cql")
            .enable_all()
            .build()
            .map_err(|e| ClusterError::Connect(format!("failed to start driver runtime: {e}")))?;
        Ok(Self {
            runtime: Some(runtime),
            connection: RwLock::new(None),
        })
    }

    fn session(&self) -> ClusterResult<(Arc<Session>, Duration)> {
        self.connection
            .read()
            .as_ref()
            .map(|c| (Arc::clone(&c.session), c.request_timeout))
            .ok_or(ClusterError::NotConnected)
    }

    /// Run `fut` to completion on the driver runtime, bounded by `limit`.
    fn block_on<T, F>(&self, limit: Duration, fut: F) -> ClusterResult<T>
    where
        F: Future<Output = ClusterResult<T>>,
    {
        if Handle::try_current().is_ok() {
            return Err(ClusterError::BlockingInAsyncContext);
        }
        let runtime = self.runtime.as_ref().ok_or(ClusterError::NotConnected)?;
        runtime.block_on(async move {
            match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(ClusterError::Timeout(limit)),
            }
        })
    }
}

impl Drop for ScyllaCluster {
    fn drop(&mut self) {
        self.connection.get_mut().take();
        // Dropping a runtime from async code panics; let it wind down in the background.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ScyllaCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScyllaCluster")
            .field("connected", &self.connection.read().is_some())
            .finish()
    }
}

fn quoted(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn table(keyspace: &str, column_family: &str) -> String {
    format!("{}.{}", quoted(keyspace), quoted(column_family))
}

fn query_error(e: impl std::fmt::Display) -> ClusterError {
    ClusterError::Query(e.to_string())
}

fn blob(value: CqlValue) -> ClusterResult<Vec<u8>> {
    match value {
        CqlValue::Blob(bytes) => Ok(bytes),
        other => Err(ClusterError::Query(format!("expected blob, got {other:?}"))),
    }
}

impl ClusterClient for ScyllaCluster {
    fn connect(&self, config: &CassandraConfig) -> ClusterResult<()> {
        let seeds = config
            .seeds()
            .map_err(|e| ClusterError::Connect(e.to_string()))?;
        let nodes: Vec<String> = seeds.iter().map(ToString::to_string).collect();
        let per_host = NonZeroUsize::new(config.pool.max_conns_per_host as usize)
            .ok_or_else(|| ClusterError::Connect("max_conns_per_host must be at least 1".into()))?;
        let connect_timeout = config.pool.connect_timeout();
        let expected_cluster = config.cluster_name.clone();

        let session = self.block_on(connect_timeout, async move {
            let session = SessionBuilder::new()
                .known_nodes(&nodes)
                .connection_timeout(connect_timeout)
                .pool_size(PoolSize::PerHost(per_host))
                .build()
                .await
                .map_err(|e| ClusterError::Connect(e.to_string()))?;

            let rows = session
                .query_unpaged("SELECT cluster_name FROM system.local", ())
                .await
                .map_err(query_error)?
                .into_rows_result()
                .map_err(query_error)?;
            let actual = rows
                .rows::<(String,)>()
                .map_err(query_error)?
                .next()
                .transpose()
                .map_err(query_error)?
                .map(|(name,)| name);
            match actual {
                Some(name) if name != expected_cluster => warn!(
                    expected = %expected_cluster,
                    actual = %name,
                    "Connected cluster name differs from configuration"
                ),
                Some(name) => debug!(cluster = %name, "Cluster name verified"),
                None => warn!("Cluster did not report its name"),
            }
            Ok(session)
        })?;

        *self.connection.write() = Some(Connection {
            session: Arc::new(session),
            request_timeout: config.pool.request_timeout(),
        });
        info!(seeds = %config.seed_hosts, "Connected to cluster");
        Ok(())
    }

    fn describe_keyspace(&self, keyspace: &str) -> ClusterResult<bool> {
        let (session, limit) = self.session()?;
        let keyspace = keyspace.to_string();
        self.block_on(limit, async move {
            let rows = session
                .query_unpaged(
                    "SELECT keyspace_name FROM system_schema.keyspaces WHERE keyspace_name = ?",
                    (keyspace,),
                )
                .await
                .map_err(query_error)?
                .into_rows_result()
                .map_err(query_error)?;
            Ok(rows.rows_num() > 0)
        })
    }

    fn create_keyspace(&self, definition: &KeyspaceDefinition) -> ClusterResult<()> {
        let (session, limit) = self.session()?;
        let mut statements = vec![format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': '{}', 'replication_factor': {}}}",
            quoted(&definition.name),
            definition.strategy_class,
            definition.replication_factor
        )];
        for cf in &definition.column_families {
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {} (key blob, column1 blob, value blob, PRIMARY KEY (key, column1))",
                table(&definition.name, cf)
            ));
        }

        self.block_on(limit, async move {
            for statement in statements {
                debug!(%statement, "Applying schema change");
                session
                    .query_unpaged(statement, ())
                    .await
                    .map_err(|e| ClusterError::Schema(e.to_string()))?;
            }
            Ok(())
        })
    }

    fn fetch_row(
        &self,
        keyspace: &str,
        column_family: &str,
        row_key: &[u8],
    ) -> ClusterResult<Vec<Column>> {
        let (session, limit) = self.session()?;
        let statement = format!(
            "SELECT column1, value FROM {} WHERE key = ?",
            table(keyspace, column_family)
        );
        let key = CqlValue::Blob(row_key.to_vec());

        self.block_on(limit, async move {
            let rows = session
                .query_unpaged(statement, (key,))
                .await
                .map_err(query_error)?
                .into_rows_result()
                .map_err(query_error)?;
            let mut columns = Vec::with_capacity(rows.rows_num());
            for row in rows.rows::<(CqlValue, CqlValue)>().map_err(query_error)? {
                let (name, value) = row.map_err(query_error)?;
                columns.push(Column::new(blob(name)?, blob(value)?));
            }
            Ok(columns)
        })
    }

    fn scan_row_keys(&self, keyspace: &str, column_family: &str) -> ClusterResult<Vec<Vec<u8>>> {
        let (session, limit) = self.session()?;
        let statement = format!("SELECT DISTINCT key FROM {}", table(keyspace, column_family));

        self.block_on(limit, async move {
            let mut stream = session
                .query_iter(statement, ())
                .await
                .map_err(query_error)?
                .rows_stream::<(CqlValue,)>()
                .map_err(query_error)?;
            let mut keys = Vec::new();
            while let Some((key,)) = stream.try_next().await.map_err(query_error)? {
                keys.push(blob(key)?);
            }
            Ok(keys)
        })
    }

    fn execute(&self, keyspace: &str, batch: &MutationBatch) -> ClusterResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let (session, limit) = self.session()?;
        let target = table(keyspace, batch.column_family());
        let key = CqlValue::Blob(batch.row_key().to_vec());

        // Single partition, so an unlogged batch is still atomic.
        let mut statements = Batch::new(BatchType::Unlogged);
        let mut values: Vec<Vec<CqlValue>> = Vec::with_capacity(batch.len());
        for mutation in batch.mutations() {
            match mutation {
                Mutation::Put { column, value } => {
                    statements.append_statement(
                        format!("INSERT INTO {target} (key, column1, value) VALUES (?, ?, ?)").as_str(),
                    );
                    values.push(vec![
                        key.clone(),
                        CqlValue::Blob(column.clone()),
                        CqlValue::Blob(value.clone()),
                    ]);
                }
                Mutation::DeleteColumn { column } => {
                    statements.append_statement(
                        format!("DELETE FROM {target} WHERE key = ? AND column1 = ?").as_str(),
                    );
                    values.push(vec![key.clone(), CqlValue::Blob(column.clone())]);
                }
                Mutation::DeleteRow => {
                    statements.append_statement(format!("DELETE FROM {target} WHERE key = ?").as_str());
                    values.push(vec![key.clone()]);
                }
            }
        }

        self.block_on(limit, async move {
            session
                .batch(&statements, values)
                .await
                .map_err(query_error)?;
            Ok(())
        })
    }

    fn close(&self) -> ClusterResult<()> {
        if self.connection.write().take().is_some() {
            info!("Closed cluster connection");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_are_quoted() {
        assert_eq!(table("tomcat", "sessions"), "\"tomcat\".\"sessions\"");
        assert_eq!(quoted("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_calls_require_connection() {
        let cluster = ScyllaCluster::new().unwrap();
        assert!(matches!(
            cluster.fetch_row("tomcat", "sessions", b"s1"),
            Err(ClusterError::NotConnected)
        ));
        assert!(cluster.close().is_ok());
    }

    #[test]
    fn test_blocking_inside_runtime_is_rejected() {
        let cluster = ScyllaCluster::new().unwrap();
        let outer = Builder::new_current_thread().build().unwrap();
        let result = outer.block_on(async { cluster.block_on(Duration::from_secs(1), async { Ok(()) }) });
        assert!(matches!(result, Err(ClusterError::BlockingInAsyncContext)));
    }

    #[test]
    fn test_drop_inside_async_context() {
        let outer = Builder::new_current_thread().build().unwrap();
        outer.block_on(async {
            let cluster = ScyllaCluster::new().unwrap();
            drop(cluster);
        });
    }

    #[test]
    fn test_block_on_times_out() {
        let cluster = ScyllaCluster::new().unwrap();
        let result: ClusterResult<()> = cluster.block_on(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        assert!(matches!(result, Err(ClusterError::Timeout(_))));
    }
}
