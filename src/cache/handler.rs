//! Executes parsed cache commands against the store
//!
//! Every write runs inside one binlog transaction, so a `STORED`/`DELETED`
//! reply is only sent once the data change and its binlog entry are
//! committed together.

use crate::binlog::BinlogQueue;
use crate::cache::protocol::Command;
use crate::common::keys::{decode_kv_key, encode_kv_key};
use crate::common::{display_key, timestamp_now, Error, NodeRole, Result, SnapshotIter};
use crate::replication::ReplicaRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

const NON_NUMERIC: &[u8] = b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n";

/// What the session should do after a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(Vec<u8>),
    /// `noreply` was requested
    Silent,
    Close,
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub cmd_get: AtomicU64,
    pub cmd_set: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
}

pub struct CacheHandler {
    binlog: Arc<BinlogQueue>,
    registry: Option<Arc<ReplicaRegistry>>,
    role: NodeRole,
    stats: ServerStats,
    started: Instant,
}

impl CacheHandler {
    pub fn new(
        binlog: Arc<BinlogQueue>,
        registry: Option<Arc<ReplicaRegistry>>,
        role: NodeRole,
    ) -> Self {
        Self {
            binlog,
            registry,
            role,
            stats: ServerStats::default(),
            started: Instant::now(),
        }
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn execute(&self, cmd: Command) -> Outcome {
        if cmd.is_write() && self.role == NodeRole::Slave {
            return Outcome::Reply(server_error(&Error::ReadOnly.to_string()));
        }

        match cmd {
            Command::Set {
                key,
                value,
                noreply,
            } => with_noreply(noreply, self.set(&key, &value, false)),
            Command::Add {
                key,
                value,
                noreply,
            } => with_noreply(noreply, self.set(&key, &value, true)),
            Command::Get { keys } => Outcome::Reply(self.get(&keys)),
            Command::Delete { key, noreply } => with_noreply(noreply, self.delete(&key)),
            Command::Incr {
                key,
                delta,
                noreply,
            } => with_noreply(noreply, self.calc(&key, delta, true)),
            Command::Decr {
                key,
                delta,
                noreply,
            } => with_noreply(noreply, self.calc(&key, delta, false)),
            Command::Version => Outcome::Reply(
                format!("VERSION {}\r\n", env!("CARGO_PKG_VERSION")).into_bytes(),
            ),
            Command::Stats => Outcome::Reply(self.stat()),
            Command::Quit => Outcome::Close,
        }
    }

    fn set(&self, key: &[u8], value: &[u8], only_new: bool) -> Vec<u8> {
        self.stats.cmd_set.fetch_add(1, Ordering::Relaxed);
        let result: Result<bool> = (|| {
            let mut tx = self.binlog.begin();
            if only_new && self.binlog.store().get(&encode_kv_key(key))?.is_some() {
                return Ok(false);
            }
            tx.set(key, value);
            tx.commit()?;
            Ok(true)
        })();

        match result {
            Ok(true) => b"STORED\r\n".to_vec(),
            Ok(false) => b"NOT_STORED\r\n".to_vec(),
            Err(e) => {
                error!("set(KEY:'{}') failed: {}", display_key(key), e);
                b"NOT_STORED\r\n".to_vec()
            }
        }
    }

    fn delete(&self, key: &[u8]) -> Vec<u8> {
        let result: Result<bool> = (|| {
            let mut tx = self.binlog.begin();
            if self.binlog.store().get(&encode_kv_key(key))?.is_none() {
                return Ok(false);
            }
            tx.del(key);
            tx.commit()?;
            Ok(true)
        })();

        match result {
            Ok(true) => b"DELETED\r\n".to_vec(),
            Ok(false) => b"NOT_FOUND\r\n".to_vec(),
            Err(e) => {
                error!("del(KEY:'{}') failed: {}", display_key(key), e);
                server_error(&e.to_string())
            }
        }
    }

    fn calc(&self, key: &[u8], delta: u64, increment: bool) -> Vec<u8> {
        let mut tx = self.binlog.begin();
        let current = match self.binlog.store().get(&encode_kv_key(key)) {
            Ok(Some(value)) => value,
            Ok(None) => return b"NOT_FOUND\r\n".to_vec(),
            Err(e) => return server_error(&e.to_string()),
        };

        let Some(number) = std::str::from_utf8(&current)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        else {
            return NON_NUMERIC.to_vec();
        };
        if delta == 0 {
            return format!("{}\r\n", number).into_bytes();
        }

        let updated = if increment {
            number.checked_add(delta)
        } else {
            number.checked_sub(delta)
        };
        let Some(updated) = updated else {
            return NON_NUMERIC.to_vec();
        };

        let text = updated.to_string();
        tx.set(key, text.as_bytes());
        if let Err(e) = tx.commit() {
            error!("calc(KEY:'{}') failed: {}", display_key(key), e);
            return server_error(&e.to_string());
        }
        format!("{}\r\n", text).into_bytes()
    }

    fn get(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        let mut response = Vec::new();
        for key in keys {
            self.stats.cmd_get.fetch_add(1, Ordering::Relaxed);

            if let Some(star) = key.iter().position(|b| *b == b'*') {
                if let Err(e) = self.scan_prefix(&key[..star], &mut response) {
                    error!("prefix get '{}' failed: {}", display_key(key), e);
                }
                continue;
            }

            match self.binlog.store().get(&encode_kv_key(key)) {
                Ok(Some(value)) => {
                    self.stats.get_hits.fetch_add(1, Ordering::Relaxed);
                    push_value(&mut response, key, &value);
                }
                Ok(None) => {
                    self.stats.get_misses.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => error!("get(KEY:'{}') failed: {}", display_key(key), e),
            }
        }
        response.extend_from_slice(b"END\r\n");
        response
    }

    fn scan_prefix(&self, prefix: &[u8], response: &mut Vec<u8>) -> Result<()> {
        let start = encode_kv_key(prefix);
        let iter = SnapshotIter::new(self.binlog.store().clone(), &start, 1000);
        let mut found = 0u64;
        for pair in iter {
            let (key, value) = pair?;
            if !key.starts_with(&start) {
                break;
            }
            if let Some(user_key) = decode_kv_key(&key) {
                push_value(response, user_key, &value);
                found += 1;
            }
        }
        debug!("prefix '{}' matched {} keys", display_key(prefix), found);
        if found > 0 {
            self.stats.get_hits.fetch_add(found, Ordering::Relaxed);
        } else {
            self.stats.get_misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn stat(&self) -> Vec<u8> {
        let replicas = self.registry.as_ref().map_or(0, |r| r.len());
        let lines = [
            ("pid", std::process::id().to_string()),
            ("uptime", self.started.elapsed().as_secs().to_string()),
            ("time", timestamp_now().to_string()),
            ("version", env!("CARGO_PKG_VERSION").to_string()),
            ("role", self.role.to_string()),
            ("cmd_get", self.stats.cmd_get.load(Ordering::Relaxed).to_string()),
            ("cmd_set", self.stats.cmd_set.load(Ordering::Relaxed).to_string()),
            ("get_hits", self.stats.get_hits.load(Ordering::Relaxed).to_string()),
            ("get_misses", self.stats.get_misses.load(Ordering::Relaxed).to_string()),
            ("binlog_min_seq", self.binlog.min_seq().to_string()),
            ("binlog_last_seq", self.binlog.last_seq().to_string()),
            ("replicas", replicas.to_string()),
        ];

        let mut response = String::new();
        for (name, value) in lines {
            response.push_str(&format!("STAT {} {}\r\n", name, value));
        }
        response.push_str("END\r\n");
        response.into_bytes()
    }
}

fn with_noreply(noreply: bool, reply: Vec<u8>) -> Outcome {
    if noreply {
        Outcome::Silent
    } else {
        Outcome::Reply(reply)
    }
}

fn server_error(message: &str) -> Vec<u8> {
    format!("SERVER_ERROR {}\r\n", message).into_bytes()
}

fn push_value(response: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    response.extend_from_slice(b"VALUE ");
    response.extend_from_slice(key);
    response.extend_from_slice(format!(" 0 {}\r\n", value.len()).as_bytes());
    response.extend_from_slice(value);
    response.extend_from_slice(b"\r\n");
}
