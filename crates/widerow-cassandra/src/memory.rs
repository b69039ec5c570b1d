//! In-process wide-column store.
//!
//! Follows the cluster semantics the backend relies on: rows disappear once
//! their last column is deleted, batches apply atomically, and a column
//! family has to be provisioned before it can be used. Failures can be
//! injected to exercise error handling.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::client::{ClusterClient, Column, KeyspaceDefinition, Mutation, MutationBatch};
use crate::config::CassandraConfig;
use crate::error::{ClusterError, ClusterResult};

type Row = BTreeMap<Vec<u8>, Vec<u8>>;
type Table = BTreeMap<Vec<u8>, Row>;

/// A wide-column store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    keyspaces: RwLock<HashMap<String, KeyspaceDefinition>>,
    tables: RwLock<HashMap<(String, String), Table>>,
    connected: AtomicBool,
    failures: Mutex<VecDeque<ClusterError>>,
    reject_schema: AtomicBool,
    reads: AtomicUsize,
    scans: AtomicUsize,
    batches: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with [`ClusterError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push_back(ClusterError::Unavailable("injected failure".to_string()));
        }
    }

    /// Fail the next `count` calls with [`ClusterError::Timeout`].
    pub fn time_out_next(&self, count: usize) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push_back(ClusterError::Timeout(Duration::from_millis(5_000)));
        }
    }

    /// Make keyspace creation fail.
    pub fn reject_schema_changes(&self, reject: bool) {
        self.reject_schema.store(reject, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn has_keyspace(&self, name: &str) -> bool {
        self.keyspaces.read().contains_key(name)
    }

    /// Row reads served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Key scans served so far.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Batches applied so far.
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> ClusterResult<()> {
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ready(&self) -> ClusterResult<()> {
        if !self.is_connected() {
            return Err(ClusterError::NotConnected);
        }
        self.take_failure()
    }

    fn unconfigured(keyspace: &str, column_family: &str) -> ClusterError {
        ClusterError::Query(format!("unconfigured table {keyspace}.{column_family}"))
    }
}

impl ClusterClient for InMemoryCluster {
    fn connect(&self, _config: &CassandraConfig) -> ClusterResult<()> {
        self.take_failure()
            .map_err(|e| ClusterError::Connect(e.to_string()))?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn describe_keyspace(&self, keyspace: &str) -> ClusterResult<bool> {
        self.ready()?;
        Ok(self.has_keyspace(keyspace))
    }

    fn create_keyspace(&self, definition: &KeyspaceDefinition) -> ClusterResult<()> {
        self.ready()?;
        if self.reject_schema.load(Ordering::SeqCst) {
            return Err(ClusterError::Schema(format!(
                "not allowed to create keyspace {}",
                definition.name
            )));
        }

        let mut tables = self.tables.write();
        for cf in &definition.column_families {
            tables
                .entry((definition.name.clone(), cf.clone()))
                .or_default();
        }
        self.keyspaces
            .write()
            .insert(definition.name.clone(), definition.clone());
        Ok(())
    }

    fn fetch_row(
        &self,
        keyspace: &str,
        column_family: &str,
        row_key: &[u8],
    ) -> ClusterResult<Vec<Column>> {
        self.ready()?;
        self.reads.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.read();
        let table = tables
            .get(&(keyspace.to_string(), column_family.to_string()))
            .ok_or_else(|| Self::unconfigured(keyspace, column_family))?;
        Ok(table
            .get(row_key)
            .map(|row| {
                row.iter()
                    .map(|(name, value)| Column::new(name.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn scan_row_keys(&self, keyspace: &str, column_family: &str) -> ClusterResult<Vec<Vec<u8>>> {
        self.ready()?;
        self.scans.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.read();
        let table = tables
            .get(&(keyspace.to_string(), column_family.to_string()))
            .ok_or_else(|| Self::unconfigured(keyspace, column_family))?;
        Ok(table.keys().cloned().collect())
    }

    fn execute(&self, keyspace: &str, batch: &MutationBatch) -> ClusterResult<()> {
        self.ready()?;

        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&(keyspace.to_string(), batch.column_family().to_string()))
            .ok_or_else(|| Self::unconfigured(keyspace, batch.column_family()))?;

        let row = table.entry(batch.row_key().to_vec()).or_default();
        for mutation in batch.mutations() {
            match mutation {
                Mutation::Put { column, value } => {
                    row.insert(column.clone(), value.clone());
                }
                Mutation::DeleteColumn { column } => {
                    row.remove(column);
                }
                Mutation::DeleteRow => row.clear(),
            }
        }
        if row.is_empty() {
            table.remove(batch.row_key());
        }

        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> ClusterResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
