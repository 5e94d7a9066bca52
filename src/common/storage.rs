//! Embedded ordered key-value engine
//!
//! The binlog, the replica cursor and the application data all live in one
//! engine so that a data write and its binlog entry can share a write batch.
//! Supports RocksDB (persistent) and an in-memory `BTreeMap` backend.

use crate::common::{Result, StorageConfig};
use parking_lot::RwLock;
use rocksdb::{BlockBasedOptions, Cache, Options, DB};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

pub type KvPair = (Vec<u8>, Vec<u8>);

/// A single staged mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Mutations applied all-or-nothing by [`KvStore::write`]
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Trait for ordered key-value storage backends
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Apply every op in `batch` atomically
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// First pair whose key is >= `from`
    fn seek(&self, from: &[u8]) -> Result<Option<KvPair>>;

    /// Last pair whose key is strictly < `before`
    fn seek_prev(&self, before: &[u8]) -> Result<Option<KvPair>>;

    /// Up to `limit` pairs starting at `from` (inclusive), read from one
    /// point-in-time view.
    fn scan(&self, from: &[u8], limit: usize) -> Result<Vec<KvPair>>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut map = self.map.write();
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn seek(&self, from: &[u8]) -> Result<Option<KvPair>> {
        Ok(self
            .map
            .read()
            .range(from.to_vec()..)
            .next()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn seek_prev(&self, before: &[u8]) -> Result<Option<KvPair>> {
        Ok(self
            .map
            .read()
            .range(..before.to_vec())
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn scan(&self, from: &[u8], limit: usize) -> Result<Vec<KvPair>> {
        Ok(self
            .map
            .read()
            .range(from.to_vec()..)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// RocksDB store
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a RocksDB store
    pub fn open(path: impl AsRef<Path>, cache_size_mb: usize) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        if cache_size_mb > 0 {
            let cache = Cache::new_lru_cache(cache_size_mb * 1024 * 1024);
            let mut block_opts = BlockBasedOptions::default();
            block_opts.set_block_cache(&cache);
            opts.set_block_based_table_factory(&block_opts);
        }

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(key)?;
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut wb = rocksdb::WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => wb.put(key, value),
                BatchOp::Delete { key } => wb.delete(key),
            }
        }
        self.db.write(wb)?;
        Ok(())
    }

    fn seek(&self, from: &[u8]) -> Result<Option<KvPair>> {
        let mut it = self.db.raw_iterator();
        it.seek(from);
        if let (Some(k), Some(v)) = (it.key(), it.value()) {
            return Ok(Some((k.to_vec(), v.to_vec())));
        }
        it.status()?;
        Ok(None)
    }

    fn seek_prev(&self, before: &[u8]) -> Result<Option<KvPair>> {
        let mut it = self.db.raw_iterator();
        it.seek(before);
        if it.valid() {
            it.prev();
        } else {
            // prev() requires a valid position
            it.seek_to_last();
        }
        if let (Some(k), Some(v)) = (it.key(), it.value()) {
            if k < before {
                return Ok(Some((k.to_vec(), v.to_vec())));
            }
        }
        it.status()?;
        Ok(None)
    }

    fn scan(&self, from: &[u8], limit: usize) -> Result<Vec<KvPair>> {
        let mut out = Vec::with_capacity(limit.min(1024));
        let mut it = self.db.raw_iterator();
        it.seek(from);
        while out.len() < limit {
            match (it.key(), it.value()) {
                (Some(k), Some(v)) => out.push((k.to_vec(), v.to_vec())),
                _ => break,
            }
            it.next();
        }
        it.status()?;
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Open the persistent engine described by `config`
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn KvStore>> {
    let path = config.data_path();
    std::fs::create_dir_all(&path)?;
    tracing::info!("Opening storage engine at {}", path.display());
    Ok(Arc::new(RocksStore::open(&path, config.cache_size_mb)?))
}

/// Forward iterator over the engine starting at a key.
///
/// Pairs are fetched `chunk` at a time; each chunk is one point-in-time read.
/// Keys written after the iterator has passed them are never revisited.
pub struct SnapshotIter {
    store: Arc<dyn KvStore>,
    resume: Option<Vec<u8>>,
    buffered: VecDeque<KvPair>,
    chunk: usize,
}

impl SnapshotIter {
    pub fn new(store: Arc<dyn KvStore>, start: &[u8], chunk: usize) -> Self {
        Self {
            store,
            resume: Some(start.to_vec()),
            buffered: VecDeque::new(),
            chunk: chunk.max(1),
        }
    }

    fn refill(&mut self) -> Result<()> {
        let Some(from) = self.resume.take() else {
            return Ok(());
        };
        let pairs = self.store.scan(&from, self.chunk)?;
        if pairs.len() == self.chunk {
            if let Some((last, _)) = pairs.last() {
                self.resume = Some(successor(last));
            }
        }
        self.buffered.extend(pairs);
        Ok(())
    }
}

impl Iterator for SnapshotIter {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() {
            if let Err(e) = self.refill() {
                return Some(Err(e));
            }
        }
        self.buffered.pop_front().map(Ok)
    }
}

/// Smallest key strictly greater than `key`
pub fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}
