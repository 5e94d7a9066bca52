//! Common utilities and types shared across tinykv

pub mod config;
pub mod error;
pub mod keys;
pub mod storage;
pub mod utils;

pub use config::{
    BinlogConfig, Config, NodeRole, ReplicationConfig, ServiceConfig, StorageConfig, SyncConfig,
};
pub use error::{Error, Result};
pub use storage::{
    open_store, successor, BatchOp, KvPair, KvStore, MemStore, RocksStore, SnapshotIter,
    WriteBatch,
};
pub use utils::{display_key, timestamp_now, validate_key};
