//! The cluster client seam.
//!
//! [`ClusterClient`] is the small wide-column surface the backend needs:
//! fetch one row, scan row keys, apply a single-row [`MutationBatch`], and
//! provision a keyspace. Row keys, column names, and values are raw bytes.

use crate::config::CassandraConfig;
use crate::error::ClusterResult;

/// One column of a wide row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl Column {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Whether the column is called `name`.
    pub fn is_named(&self, name: &str) -> bool {
        self.name == name.as_bytes()
    }

    /// Column name as text (invalid UTF-8 is replaced).
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// A single write inside a [`MutationBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert or overwrite a column.
    Put { column: Vec<u8>, value: Vec<u8> },
    /// Delete one column.
    DeleteColumn { column: Vec<u8> },
    /// Delete the whole row.
    DeleteRow,
}

/// Writes against one row of one column family, applied together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBatch {
    column_family: String,
    row_key: Vec<u8>,
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    /// Start an empty batch for `row_key`.
    pub fn new(column_family: impl Into<String>, row_key: impl Into<Vec<u8>>) -> Self {
        Self {
            column_family: column_family.into(),
            row_key: row_key.into(),
            mutations: Vec::new(),
        }
    }

    pub fn put_column(&mut self, column: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.mutations.push(Mutation::Put {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete_column(&mut self, column: impl Into<Vec<u8>>) -> &mut Self {
        self.mutations.push(Mutation::DeleteColumn {
            column: column.into(),
        });
        self
    }

    pub fn delete_row(&mut self) -> &mut Self {
        self.mutations.push(Mutation::DeleteRow);
        self
    }

    pub fn column_family(&self) -> &str {
        &self.column_family
    }

    pub fn row_key(&self) -> &[u8] {
        &self.row_key
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }
}

/// Keyspace to create when it does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceDefinition {
    pub name: String,
    pub strategy_class: String,
    pub replication_factor: u32,
    /// Column families created with the keyspace. Each has byte-typed keys,
    /// column names and values.
    pub column_families: Vec<String>,
}

impl KeyspaceDefinition {
    /// The keyspace and single column family described by `config`.
    pub fn from_config(config: &CassandraConfig) -> Self {
        Self {
            name: config.keyspace.clone(),
            strategy_class: config.replication.strategy_class.clone(),
            replication_factor: config.replication.factor,
            column_families: vec![config.column_family.clone()],
        }
    }
}

/// Blocking access to a wide-column cluster.
///
/// Every call blocks until the cluster answered or failed. Implementations
/// must be safe to share between threads.
pub trait ClusterClient: Send + Sync {
    /// Open the connection pool.
    fn connect(&self, config: &CassandraConfig) -> ClusterResult<()>;

    /// Whether `keyspace` exists.
    fn describe_keyspace(&self, keyspace: &str) -> ClusterResult<bool>;

    /// Create a keyspace with its column families.
    fn create_keyspace(&self, definition: &KeyspaceDefinition) -> ClusterResult<()>;

    /// All columns of one row, in one round trip. Empty if the row does not exist.
    fn fetch_row(
        &self,
        keyspace: &str,
        column_family: &str,
        row_key: &[u8],
    ) -> ClusterResult<Vec<Column>>;

    /// Keys of every row in the column family, without column data.
    fn scan_row_keys(&self, keyspace: &str, column_family: &str) -> ClusterResult<Vec<Vec<u8>>>;

    /// Apply a batch atomically.
    fn execute(&self, keyspace: &str, batch: &MutationBatch) -> ClusterResult<()>;

    /// Release the connection pool.
    fn close(&self) -> ClusterResult<()>;
}
