//! Error types for tinykv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    // === Replication Errors ===
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("replica is read-only")]
    ReadOnly,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::ConnectionClosed
        )
    }

    /// Corruption is never conflated with absence
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupted(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::ConnectionClosed.is_retryable());
        assert!(Error::Timeout("read".into()).is_retryable());
        assert!(!Error::Corrupted("short".into()).is_retryable());
        assert!(!Error::InvalidConfig("x".into()).is_retryable());
    }

    #[test]
    fn test_corruption_distinct() {
        assert!(Error::Corrupted("binlog".into()).is_corruption());
        assert!(!Error::Storage("io".into()).is_corruption());
    }
}
