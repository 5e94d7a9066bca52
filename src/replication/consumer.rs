//! Slave-side replay of the master's stream

use crate::binlog::{BinlogCommand, BinlogEntry};
use crate::common::keys::{is_kv_key, SLAVE_STATUS_KEY};
use crate::common::{display_key, Error, KvStore, Result, WriteBatch};
use crate::replication::protocol::{Message, SyncMethod};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Applies streamed entries and keeps the replay cursor durable.
///
/// The cursor is stored under [`SLAVE_STATUS_KEY`] as
/// `[seq:8 little-endian][copy key:*]`, in the same write batch as the data
/// change it accounts for.
pub struct ReplicaConsumer {
    store: Arc<dyn KvStore>,
    cursor_seq: u64,
    cursor_key: Vec<u8>,
}

impl ReplicaConsumer {
    /// Load the persisted cursor (zero and empty on a fresh store)
    pub fn open(store: Arc<dyn KvStore>) -> Result<Self> {
        let (cursor_seq, cursor_key) = match store.get(SLAVE_STATUS_KEY)? {
            Some(buf) => decode_status(&buf)?,
            None => (0, Vec::new()),
        };
        info!(
            "Replica cursor loaded: seq={}, key={}",
            cursor_seq,
            display_key(&cursor_key)
        );
        Ok(Self {
            store,
            cursor_seq,
            cursor_key,
        })
    }

    pub fn cursor_seq(&self) -> u64 {
        self.cursor_seq
    }

    /// Non-empty while a full copy is in progress
    pub fn cursor_key(&self) -> &[u8] {
        &self.cursor_key
    }

    /// First message of every connection
    pub fn sync_request(&self) -> Message {
        Message::SyncRequest {
            seq: self.cursor_seq,
            key: self.cursor_key.clone(),
        }
    }

    /// Apply one inbound message; returns true if local state changed
    pub fn handle(&mut self, msg: &Message) -> Result<bool> {
        match msg {
            Message::SyncResponse {
                method,
                entry,
                value,
            } => self.apply(*method, entry, value),
            Message::Ping => Ok(false),
            Message::SyncRequest { .. } => Err(Error::Protocol(
                "unexpected sync request from master".into(),
            )),
        }
    }

    pub fn apply(&mut self, method: SyncMethod, entry: &BinlogEntry, value: &[u8]) -> Result<bool> {
        match (method, entry.cmd()) {
            (SyncMethod::Noop, _) => {
                if entry.seq() == self.cursor_seq {
                    return Ok(false);
                }
                debug!("noop lastseq: {}, seq: {}", self.cursor_seq, entry.seq());
                self.cursor_seq = entry.seq();
                self.save(WriteBatch::new())?;
                Ok(true)
            }
            (SyncMethod::Copy, BinlogCommand::Begin) => {
                info!("copy begin");
                Ok(false)
            }
            (SyncMethod::Copy, BinlogCommand::End) => {
                info!("copy end at seq {}", entry.seq());
                self.cursor_key.clear();
                self.save(WriteBatch::new())?;
                Ok(true)
            }
            _ => self.replay(method, entry, value),
        }
    }

    fn replay(&mut self, method: SyncMethod, entry: &BinlogEntry, value: &[u8]) -> Result<bool> {
        let mut batch = WriteBatch::new();
        let key = entry.key();

        if !is_kv_key(key) {
            warn!("ignoring entry outside the data namespace: {}", entry);
        } else {
            match entry.cmd() {
                // an empty value means the master could not fetch it
                BinlogCommand::Set if value.is_empty() => {}
                BinlogCommand::Set => batch.put(key, value),
                BinlogCommand::Del => batch.delete(key),
                cmd => error!("unknown binlog, cmd={}", cmd),
            }
        }

        debug!("replica {} {}", method, entry);
        // copy entries carry the pre-copy seq, so the cursor never moves back
        self.cursor_seq = entry.seq();
        if method == SyncMethod::Copy {
            self.cursor_key = key.to_vec();
        }
        self.save(batch)?;
        Ok(true)
    }

    fn save(&self, mut batch: WriteBatch) -> Result<()> {
        batch.put(SLAVE_STATUS_KEY, encode_status(self.cursor_seq, &self.cursor_key));
        self.store.write(batch)
    }
}

fn encode_status(seq: u64, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + key.len());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(key);
    buf
}

fn decode_status(buf: &[u8]) -> Result<(u64, Vec<u8>)> {
    if buf.len() < 8 {
        return Err(Error::Corrupted(format!(
            "replica status too short: {} bytes",
            buf.len()
        )));
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&buf[..8]);
    Ok((u64::from_le_bytes(seq), buf[8..].to_vec()))
}
