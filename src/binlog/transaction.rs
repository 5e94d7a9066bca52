//! Scoped writer transaction over the binlog
//!
//! Holding a [`Transaction`] is holding the binlog's writer lock. Every data
//! mutation staged through it is paired with one binlog entry in the same
//! write batch. Dropping it without [`Transaction::commit`] rolls back.

use crate::binlog::entry::{BinlogCommand, BinlogEntry};
use crate::binlog::queue::{BinlogQueue, WriterState};
use crate::common::keys::{encode_binlog_key, encode_kv_key};
use crate::common::{Error, Result};
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use tracing::{debug, error};

pub struct Transaction<'a> {
    queue: &'a BinlogQueue,
    state: MutexGuard<'a, WriterState>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(queue: &'a BinlogQueue, state: MutexGuard<'a, WriterState>) -> Self {
        Self {
            queue,
            state,
            finished: false,
        }
    }

    /// Provisional sequence of the last staged entry
    pub fn tran_seq(&self) -> u64 {
        self.state.tran_seq
    }

    /// Stage a raw engine write (no binlog entry)
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.state.batch.put(key, value);
    }

    /// Stage a raw engine delete (no binlog entry)
    pub fn delete(&mut self, key: &[u8]) {
        self.state.batch.delete(key);
    }

    /// Allocate the next sequence and stage its entry
    pub fn append(&mut self, cmd: BinlogCommand, key: &[u8]) -> u64 {
        self.state.tran_seq += 1;
        let seq = self.state.tran_seq;
        let entry = BinlogEntry::new(seq, cmd, key);
        self.state.batch.put(encode_binlog_key(seq), entry.encode());
        self.state.staged.push(entry);
        seq
    }

    /// Stage `user_key = value` with its `SET` entry
    pub fn set(&mut self, user_key: &[u8], value: &[u8]) -> u64 {
        let key = encode_kv_key(user_key);
        self.put(&key, value);
        self.append(BinlogCommand::Set, &key)
    }

    /// Stage the removal of `user_key` with its `DEL` entry
    pub fn del(&mut self, user_key: &[u8]) -> u64 {
        let key = encode_kv_key(user_key);
        self.delete(&key);
        self.append(BinlogCommand::Del, &key)
    }

    /// Apply the batch atomically and publish the committed entries
    pub fn commit(mut self) -> Result<Vec<BinlogEntry>> {
        self.finished = true;
        let batch = std::mem::take(&mut self.state.batch);
        let tran_seq = self.state.tran_seq;
        let staged = std::mem::take(&mut self.state.staged);

        if let Err(e) = self.queue.store.write(batch) {
            self.state.reset();
            error!("Binlog commit failed at seq {}: {}", tran_seq, e);
            return Err(Error::CommitFailed(e.to_string()));
        }

        if let Some(first) = staged.first() {
            let _ = self.queue.min_seq.compare_exchange(
                0,
                first.seq(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        self.queue.last_seq.store(tran_seq, Ordering::SeqCst);
        self.state.reset();

        for entry in &staged {
            debug!("Binlog commit {}", entry);
            // no subscribers is fine
            let _ = self.queue.commits.send(entry.clone());
        }
        Ok(staged)
    }

    /// Discard everything staged so far
    pub fn rollback(mut self) {
        self.finished = true;
        self.state.reset();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state.reset();
        }
    }
}
