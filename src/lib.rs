//! # tinykv
//!
//! A single-node key-value cache server with:
//! - A memcached-style text protocol (`set`, `add`, `get`, `delete`, `incr`, ...)
//! - RocksDB as the embedded ordered engine
//! - A write-ahead binlog committed atomically with every data change
//! - Asynchronous master to slave replication with automatic full resync
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────── master ─────────────┐
//! │ clients → CacheHandler          │
//! │             │ Transaction       │
//! │             ▼                   │
//! │ BinlogQueue + KvStore (RocksDB) │
//! │             │ commits / polls   │
//! │             ▼                   │
//! │ ReplicaRegistry                 │
//! │   └─ ReplicationLink per slave  │
//! └─────────────┬───────────────────┘
//!               │ TCP frames
//! ┌─────────────▼───────────────────┐
//! │ slave: SlaveClient              │
//! │   └─ ReplicaConsumer → KvStore  │
//! └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a master
//! ```bash
//! tinykv-server --data ./master-data --bind 0.0.0.0:11211 \
//!   --replication-bind 0.0.0.0:11212
//! ```
//!
//! ### Start a slave
//! ```bash
//! tinykv-server --data ./slave-data --bind 0.0.0.0:11311 \
//!   --role slave --master 127.0.0.1:11212
//! ```
//!
//! ### Use the CLI
//! ```bash
//! tinykv --server 127.0.0.1:11211 set greeting hello
//! tinykv --server 127.0.0.1:11311 get greeting
//! ```

#![allow(clippy::result_large_err)]

pub mod binlog;
pub mod cache;
pub mod common;
pub mod replication;
pub mod server;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use server::DataServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
