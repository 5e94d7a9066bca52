//! Configuration for tinykv components
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `TINYKV_` environment variables (`TINYKV_BINLOG__CAPACITY=5000`).

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging level
    pub log_level: String,

    pub storage: StorageConfig,

    /// Client-facing cache protocol listener
    pub service: ServiceConfig,

    pub replication: ReplicationConfig,

    pub binlog: BinlogConfig,

    /// Replication link tuning
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage: StorageConfig::default(),
            service: ServiceConfig::default(),
            replication: ReplicationConfig::default(),
            binlog: BinlogConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Accepts writes and streams its binlog to slaves
    Master,
    /// Read-only, follows a master
    Slave,
}

impl FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(NodeRole::Master),
            "slave" | "replica" => Ok(NodeRole::Slave),
            other => Err(Error::InvalidConfig(format!("unknown role: {}", other))),
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Slave => write!(f, "slave"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory; the engine lives in `<location>/data`
    pub location: PathBuf,

    /// RocksDB block cache size
    pub cache_size_mb: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            location: PathBuf::from("./tinykv-data"),
            cache_size_mb: 64,
        }
    }
}

impl StorageConfig {
    pub fn data_path(&self) -> PathBuf {
        self.location.join("data")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,

    /// Idle client connections are closed after this long (0 = never)
    pub timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 11211)),
            timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub role: NodeRole,

    /// Listener for slave connections (master only)
    pub bind_addr: SocketAddr,

    /// Master endpoint (slave only)
    pub master_addr: Option<SocketAddr>,

    /// A peer silent for this long is disconnected
    pub timeout_secs: u64,

    /// Slave heartbeat interval
    pub keepalive_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Master,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 11212)),
            master_addr: None,
            timeout_secs: 30,
            keepalive_secs: 5,
        }
    }
}

impl ReplicationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinlogConfig {
    /// Number of entries retained for incremental sync
    pub capacity: u64,

    pub trim_interval_ms: u64,

    /// Upper bound of deletions per write batch while trimming
    pub trim_batch: usize,
}

impl Default for BinlogConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000_000,
            trim_interval_ms: 100,
            trim_batch: 1000,
        }
    }
}

impl BinlogConfig {
    pub fn trim_interval(&self) -> Duration {
        Duration::from_millis(self.trim_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sleep between polls of an idle link
    pub tick_interval_ms: u64,

    /// Idle ticks before a NOOP is sent
    pub noop_idles: u32,

    /// Iterator steps per copy batch
    pub copy_batch: usize,

    /// Per-replica outbound message queue depth
    pub outbound_queue: usize,

    /// Upper bound on waiting for replication workers at shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 300,
            noop_idles: 10,
            copy_batch: 1000,
            outbound_queue: 4096,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl SyncConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Config {
    /// Load defaults, then the file at `path` if given, then the environment.
    ///
    /// Not validated, so command-line overrides can still complete it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("TINYKV")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize::<Config>()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.binlog.capacity == 0 {
            return Err(Error::InvalidConfig("binlog.capacity must be at least 1".into()));
        }
        if self.binlog.trim_batch == 0 {
            return Err(Error::InvalidConfig("binlog.trim_batch must be at least 1".into()));
        }
        if self.binlog.trim_interval_ms == 0 || self.sync.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("intervals must be non-zero".into()));
        }
        if self.sync.copy_batch == 0 || self.sync.outbound_queue == 0 {
            return Err(Error::InvalidConfig(
                "sync.copy_batch and sync.outbound_queue must be at least 1".into(),
            ));
        }
        if self.replication.role == NodeRole::Slave && self.replication.master_addr.is_none() {
            return Err(Error::InvalidConfig("slave requires replication.master_addr".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.replication.role, NodeRole::Master);
        assert_eq!(config.sync.copy_batch, 1000);
        assert_eq!(config.sync.tick_interval(), Duration::from_millis(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_slave_without_master() {
        let mut config = Config::default();
        config.replication.role = NodeRole::Slave;
        assert!(config.validate().is_err());

        config.replication.master_addr = Some("127.0.0.1:11212".parse().unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = Config::default();
        config.binlog.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tinykv.toml");
        std::fs::write(
            &path,
            r#"
log_level = "debug"

[storage]
location = "/var/lib/tinykv"

[replication]
role = "slave"
master_addr = "10.0.0.1:11212"

[binlog]
capacity = 5000
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.replication.role, NodeRole::Slave);
        assert_eq!(config.binlog.capacity, 5000);
        // untouched sections keep their defaults
        assert_eq!(config.binlog.trim_batch, 1000);
        assert_eq!(config.storage.data_path(), PathBuf::from("/var/lib/tinykv/data"));
    }

    #[test]
    fn test_load_leaves_validation_to_caller() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slave.toml");
        std::fs::write(&path, "[replication]\nrole = \"slave\"\n").unwrap();

        let mut config = Config::load(Some(&path)).unwrap();
        assert!(config.validate().is_err());

        // e.g. --master on the command line
        config.replication.master_addr = Some("127.0.0.1:11212".parse().unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("MASTER".parse::<NodeRole>().unwrap(), NodeRole::Master);
        assert_eq!("replica".parse::<NodeRole>().unwrap(), NodeRole::Slave);
        assert!("leader".parse::<NodeRole>().is_err());
    }
}
