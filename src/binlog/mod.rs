//! Write-ahead binlog shared by writers and replication links

pub mod entry;
pub mod queue;
pub mod transaction;

pub use entry::{BinlogCommand, BinlogEntry};
pub use queue::BinlogQueue;
pub use transaction::Transaction;
