//! Backend configuration.
//!
//! ```toml
//! seed_hosts = "10.0.0.1:9042,10.0.0.2:9042"
//! cluster_name = "sessions"
//! keyspace = "tomcat"
//! column_family = "sessions"
//!
//! [replication]
//! strategy_class = "SimpleStrategy"
//! factor = 3
//!
//! [pool]
//! max_conns_per_host = 2
//! connect_timeout_ms = 10000
//! request_timeout_ms = 5000
//! max_timeout_count = 5
//! unhealthy_cooldown_ms = 10000
//!
//! [retry]
//! max_attempts = 1
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default CQL native protocol port.
pub const DEFAULT_PORT: u16 = 9042;

/// Identifiers are interpolated into CQL, so they are restricted to this length.
const MAX_IDENTIFIER_LEN: usize = 48;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Connection and schema settings for the column-store backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CassandraConfig {
    /// Comma separated `host:port` list; the port defaults to 9042.
    pub seed_hosts: String,

    /// Expected cluster name. Checked against the cluster after connecting.
    pub cluster_name: String,

    /// Keyspace holding the session column family.
    pub keyspace: String,

    /// Column family with one row per session.
    pub column_family: String,

    /// Replication used when the keyspace has to be created.
    pub replication: ReplicationConfig,

    /// Connection pool settings.
    pub pool: PoolConfig,

    /// Retry settings for transient failures.
    pub retry: RetryConfig,
}

impl Default for CassandraConfig {
    fn default() -> Self {
        Self {
            seed_hosts: format!("127.0.0.1:{DEFAULT_PORT}"),
            cluster_name: "Test Cluster".to_string(),
            keyspace: "tomcat".to_string(),
            column_family: "sessions".to_string(),
            replication: ReplicationConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl CassandraConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string. Missing keys take their defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Set the seed host list.
    pub fn with_seed_hosts(mut self, seeds: impl Into<String>) -> Self {
        self.seed_hosts = seeds.into();
        self
    }

    /// Set the expected cluster name.
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    /// Set the keyspace.
    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = keyspace.into();
        self
    }

    /// Set the column family.
    pub fn with_column_family(mut self, column_family: impl Into<String>) -> Self {
        self.column_family = column_family.into();
        self
    }

    /// Set replication strategy and factor.
    pub fn with_replication(mut self, strategy_class: impl Into<String>, factor: u32) -> Self {
        self.replication = ReplicationConfig {
            strategy_class: strategy_class.into(),
            factor,
        };
        self
    }

    /// Set pool settings.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Parse `seed_hosts`.
    pub fn seeds(&self) -> Result<Vec<SeedHost>, ConfigError> {
        let seeds = self
            .seed_hosts
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(SeedHost::parse)
            .collect::<Result<Vec<_>, _>>()?;

        if seeds.is_empty() {
            return Err(ConfigError::Invalid("seed_hosts is empty".to_string()));
        }
        Ok(seeds)
    }

    /// Check every setting the backend relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.seeds()?;
        validate_identifier("keyspace", &self.keyspace)?;
        validate_identifier("column_family", &self.column_family)?;

        if self.replication.strategy_class.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "replication.strategy_class is empty".to_string(),
            ));
        }
        if self.replication.strategy_class.contains('\'') {
            return Err(ConfigError::Invalid(
                "replication.strategy_class must not contain quotes".to_string(),
            ));
        }
        if self.replication.factor == 0 {
            return Err(ConfigError::Invalid(
                "replication.factor must be at least 1".to_string(),
            ));
        }
        if self.pool.max_conns_per_host == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_conns_per_host must be at least 1".to_string(),
            ));
        }
        if self.pool.max_timeout_count == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_timeout_count must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    let valid = !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{field} must be 1-{MAX_IDENTIFIER_LEN} characters of [A-Za-z0-9_], got '{value}'"
        )))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Replication used when provisioning the keyspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Replication strategy class, e.g. `SimpleStrategy`.
    pub strategy_class: String,
    /// Replication factor.
    pub factor: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            strategy_class: "SimpleStrategy".to_string(),
            factor: 1,
        }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened per host.
    pub max_conns_per_host: usize,
    /// Timeout for establishing a connection, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Timeout for a single request, in milliseconds.
    pub request_timeout_ms: u64,
    /// Consecutive timeouts after which the cluster is treated as unhealthy.
    pub max_timeout_count: u32,
    /// How long requests fail fast once unhealthy, in milliseconds.
    pub unhealthy_cooldown_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns_per_host: 1,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 5_000,
            max_timeout_count: 5,
            unhealthy_cooldown_ms: 10_000,
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn unhealthy_cooldown(&self) -> Duration {
        Duration::from_millis(self.unhealthy_cooldown_ms)
    }
}

/// Retry settings for transient cluster errors.
///
/// The default of one attempt means failures surface immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for the (doubling) delay, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 150,
            max_backoff_ms: 1_200,
        }
    }
}

impl RetryConfig {
    /// Retry up to `max_attempts` total attempts with the default backoff.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    /// Backoff before retry number `retry` (0-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Seed Hosts
// ─────────────────────────────────────────────────────────────────────────────

/// One `host:port` entry of the seed list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedHost {
    pub host: String,
    pub port: u16,
}

impl SeedHost {
    /// Parse `host` or `host:port`.
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let entry = entry.trim();
        let (host, port) = match entry.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidSeed(entry.to_string()))?;
                (host, port)
            }
            None => (entry, DEFAULT_PORT),
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidSeed(entry.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for SeedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CassandraConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.seeds().unwrap(),
            vec![SeedHost {
                host: "127.0.0.1".into(),
                port: 9042
            }]
        );
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn test_parse_seed_list() {
        let config = CassandraConfig::new().with_seed_hosts("a.local:9160, b.local ,");
        let seeds = config.seeds().unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].to_string(), "a.local:9160");
        assert_eq!(seeds[1].port, DEFAULT_PORT);
    }

    #[test]
    fn test_bad_seed_rejected() {
        let config = CassandraConfig::new().with_seed_hosts("host:notaport");
        assert!(matches!(config.seeds(), Err(ConfigError::InvalidSeed(_))));

        let config = CassandraConfig::new().with_seed_hosts(" , ");
        assert!(matches!(config.seeds(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = CassandraConfig::from_toml(
            r#"
            keyspace = "shop_sessions"

            [replication]
            factor = 3

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.keyspace, "shop_sessions");
        assert_eq!(config.column_family, "sessions");
        assert_eq!(config.replication.strategy_class, "SimpleStrategy");
        assert_eq!(config.replication.factor, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn test_identifiers_validated() {
        let result = CassandraConfig::from_toml(r#"keyspace = "drop table; --""#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let config = CassandraConfig::new().with_replication("SimpleStrategy", 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cassandra.toml");
        std::fs::write(&path, "cluster_name = \"prod\"\n[pool]\nmax_conns_per_host = 4\n").unwrap();

        let config = CassandraConfig::load(&path).unwrap();
        assert_eq!(config.cluster_name, "prod");
        assert_eq!(config.pool.max_conns_per_host, 4);

        assert!(matches!(
            CassandraConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let retry = RetryConfig::attempts(5)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(350));
        assert_eq!(retry.backoff(70), Duration::from_millis(350));
    }
}
