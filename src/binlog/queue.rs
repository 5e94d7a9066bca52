//! Capacity-bounded, sequence-indexed binlog stored inside the engine

use crate::binlog::entry::BinlogEntry;
use crate::binlog::transaction::Transaction;
use crate::common::keys::{decode_binlog_key, encode_binlog_key, BINLOG_PREFIX};
use crate::common::{BinlogConfig, KvStore, Result, WriteBatch};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const COMMIT_CHANNEL_SIZE: usize = 1024;

/// State owned by the single open transaction
#[derive(Default)]
pub(crate) struct WriterState {
    pub(crate) tran_seq: u64,
    pub(crate) batch: WriteBatch,
    pub(crate) staged: Vec<BinlogEntry>,
}

impl WriterState {
    pub(crate) fn reset(&mut self) {
        self.tran_seq = 0;
        self.batch.clear();
        self.staged.clear();
    }
}

pub struct BinlogQueue {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) writer: Mutex<WriterState>,
    pub(crate) min_seq: AtomicU64,
    pub(crate) last_seq: AtomicU64,
    pub(crate) commits: broadcast::Sender<BinlogEntry>,
    capacity: u64,
    trim_batch: usize,
}

impl BinlogQueue {
    /// Open the binlog over `store`, recovering the retained window
    pub fn open(store: Arc<dyn KvStore>, config: &BinlogConfig) -> Result<Self> {
        let (commits, _) = broadcast::channel(COMMIT_CHANNEL_SIZE);
        let queue = Self {
            store,
            writer: Mutex::new(WriterState::default()),
            min_seq: AtomicU64::new(0),
            last_seq: AtomicU64::new(0),
            commits,
            capacity: config.capacity,
            trim_batch: config.trim_batch,
        };

        if let Some(last) = queue.find_last()? {
            let last_seq = last.seq();
            let floor = last_seq.saturating_sub(queue.capacity);
            let min_seq = match queue.find_next(floor)? {
                Some(first) => first.seq(),
                None => last_seq,
            };
            queue.last_seq.store(last_seq, Ordering::SeqCst);
            queue.min_seq.store(min_seq, Ordering::SeqCst);
        }

        info!(
            "Binlog opened: min_seq={}, last_seq={}, capacity={}",
            queue.min_seq(),
            queue.last_seq(),
            queue.capacity
        );
        Ok(queue)
    }

    /// Start the single writer transaction; blocks while another is open
    pub fn begin(&self) -> Transaction<'_> {
        let mut state = self.writer.lock();
        state.reset();
        state.tran_seq = self.last_seq.load(Ordering::SeqCst);
        Transaction::new(self, state)
    }

    pub fn min_seq(&self) -> u64 {
        self.min_seq.load(Ordering::SeqCst)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Receive every entry as soon as its transaction commits
    pub fn subscribe(&self) -> broadcast::Receiver<BinlogEntry> {
        self.commits.subscribe()
    }

    pub fn find_by_seq(&self, seq: u64) -> Result<Option<BinlogEntry>> {
        match self.store.get(&encode_binlog_key(seq))? {
            Some(buf) => Ok(Some(BinlogEntry::decode(&buf)?)),
            None => Ok(None),
        }
    }

    /// Entry with the smallest sequence >= `seq`
    pub fn find_next(&self, seq: u64) -> Result<Option<BinlogEntry>> {
        if let Some(entry) = self.find_by_seq(seq)? {
            return Ok(Some(entry));
        }
        match self.store.seek(&encode_binlog_key(seq))? {
            Some((key, value)) if decode_binlog_key(&key).is_some() => {
                Ok(Some(BinlogEntry::decode(&value)?))
            }
            _ => Ok(None),
        }
    }

    /// Entry with the greatest retained sequence
    pub fn find_last(&self) -> Result<Option<BinlogEntry>> {
        match self.store.seek_prev(&[BINLOG_PREFIX + 1])? {
            Some((key, value)) if decode_binlog_key(&key).is_some() => {
                Ok(Some(BinlogEntry::decode(&value)?))
            }
            _ => Ok(None),
        }
    }

    /// Reclaim entries outside the retention window.
    ///
    /// `floor` is the lowest cursor a live replica still needs; entries above
    /// it are kept unless that replica is over twice the capacity behind.
    /// Returns the number of entries deleted.
    pub fn trim(&self, floor: Option<u64>) -> Result<u64> {
        let last = self.last_seq();
        let min = self.min_seq();
        if last.saturating_sub(min) < self.capacity + self.capacity / 10 {
            return Ok(0);
        }

        let mut end = last - self.capacity;
        if let Some(floor) = floor {
            if floor < end && last - floor <= 2 * self.capacity {
                end = floor;
            }
        }
        if end < min {
            return Ok(0);
        }

        let mut deleted = 0u64;
        let mut seq = min;
        while seq <= end {
            let stop = end.min(seq.saturating_add(self.trim_batch as u64 - 1));
            let mut batch = WriteBatch::new();
            for s in seq..=stop {
                batch.delete(encode_binlog_key(s));
            }
            self.store.write(batch)?;
            deleted += stop - seq + 1;
            self.min_seq.store(stop + 1, Ordering::SeqCst);
            seq = stop + 1;
        }

        info!("Binlog trimmed [{}, {}], min_seq={}", min, end, self.min_seq());
        Ok(deleted)
    }

    /// Run [`BinlogQueue::trim`] every `interval` until `cancel` fires
    pub fn spawn_trimmer<F>(
        queue: Arc<BinlogQueue>,
        floor: F,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Option<u64> + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = queue.trim(floor()) {
                    error!("Binlog trim failed: {}", e);
                }
            }
            debug!("Binlog trimmer stopped");
        })
    }
}

impl std::fmt::Debug for BinlogQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogQueue")
            .field("min_seq", &self.min_seq())
            .field("last_seq", &self.last_seq())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::BinlogCommand;
    use crate::common::keys::encode_kv_key;
    use crate::common::{Error, MemStore, RocksStore};
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn config(capacity: u64) -> BinlogConfig {
        BinlogConfig {
            capacity,
            trim_interval_ms: 10,
            trim_batch: 4,
        }
    }

    fn queue(capacity: u64) -> BinlogQueue {
        BinlogQueue::open(Arc::new(MemStore::new()), &config(capacity)).unwrap()
    }

    fn set(queue: &BinlogQueue, key: &[u8], value: &[u8]) -> u64 {
        let mut tx = queue.begin();
        let seq = tx.set(key, value);
        tx.commit().unwrap();
        seq
    }

    /// Fails every batch write while `fail` is set
    struct FailingStore {
        inner: MemStore,
        fail: AtomicBool,
    }

    impl KvStore for FailingStore {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }
        fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.put(key, value)
        }
        fn delete(&self, key: &[u8]) -> Result<()> {
            self.inner.delete(key)
        }
        fn write(&self, batch: WriteBatch) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Storage("disk full".into()));
            }
            self.inner.write(batch)
        }
        fn seek(&self, from: &[u8]) -> Result<Option<crate::common::KvPair>> {
            self.inner.seek(from)
        }
        fn seek_prev(&self, before: &[u8]) -> Result<Option<crate::common::KvPair>> {
            self.inner.seek_prev(before)
        }
        fn scan(&self, from: &[u8], limit: usize) -> Result<Vec<crate::common::KvPair>> {
            self.inner.scan(from, limit)
        }
    }

    #[test]
    fn test_find_operations() {
        let q = queue(100);
        assert_eq!(set(&q, b"a", b"1"), 1);
        assert_eq!(set(&q, b"b", b"2"), 2);
        let mut tx = q.begin();
        assert_eq!(tx.del(b"a"), 3);
        tx.commit().unwrap();

        assert_eq!(q.find_next(1).unwrap().unwrap().seq(), 1);
        let last = q.find_last().unwrap().unwrap();
        assert_eq!(last.seq(), 3);
        assert_eq!(last.cmd(), BinlogCommand::Del);
        assert_eq!(last.key(), encode_kv_key(b"a").as_slice());
        assert!(q.find_next(4).unwrap().is_none());
        assert!(q.find_by_seq(0).unwrap().is_none());

        assert_eq!(q.store().get(&encode_kv_key(b"a")).unwrap(), None);
        assert_eq!(
            q.store().get(&encode_kv_key(b"b")).unwrap(),
            Some(b"2".to_vec())
        );
    }

    #[test]
    fn test_find_next_skips_gap() {
        let q = queue(100);
        for i in 0..5u8 {
            set(&q, &[b'x', i], b"v");
        }
        q.store().delete(&encode_binlog_key(2)).unwrap();
        q.store().delete(&encode_binlog_key(3)).unwrap();
        assert_eq!(q.find_next(2).unwrap().unwrap().seq(), 4);
    }

    #[test]
    fn test_corrupt_entry_is_not_absent() {
        let q = queue(100);
        q.store().put(&encode_binlog_key(9), &[1, 2, 3]).unwrap();
        assert!(q.find_by_seq(9).unwrap_err().is_corruption());
        assert!(q.find_last().unwrap_err().is_corruption());
    }

    #[test]
    fn test_failed_commit_leaves_nothing() {
        let store = Arc::new(FailingStore {
            inner: MemStore::new(),
            fail: AtomicBool::new(false),
        });
        let q = BinlogQueue::open(store.clone(), &config(100)).unwrap();
        set(&q, b"a", b"1");

        store.fail.store(true, Ordering::SeqCst);
        let mut tx = q.begin();
        assert_eq!(tx.set(b"b", b"2"), 2);
        assert!(matches!(tx.commit(), Err(Error::CommitFailed(_))));
        store.fail.store(false, Ordering::SeqCst);

        assert_eq!(q.last_seq(), 1);
        assert!(q.find_by_seq(2).unwrap().is_none());
        assert_eq!(q.store().get(&encode_kv_key(b"b")).unwrap(), None);

        // the failed sequence is reallocated only because it never became visible
        assert_eq!(set(&q, b"c", b"3"), 2);
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let q = queue(100);
        {
            let mut tx = q.begin();
            tx.set(b"a", b"1");
        }
        assert_eq!(q.last_seq(), 0);
        assert!(q.find_last().unwrap().is_none());
        assert_eq!(set(&q, b"a", b"2"), 1);
    }

    #[test]
    fn test_concurrent_writers_get_distinct_sequences() {
        let q = Arc::new(queue(1_000_000));
        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let q = q.clone();
                std::thread::spawn(move || {
                    (0..50u8)
                        .map(|i| set(&q, &[t, i], b"v"))
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut seqs: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=400).collect::<Vec<u64>>());
        assert_eq!(q.last_seq(), 400);
    }

    #[test]
    fn test_commit_publishes_entries() {
        let q = queue(100);
        let mut rx = q.subscribe();
        let mut tx = q.begin();
        tx.set(b"a", b"1");
        tx.del(b"b");
        let committed = tx.commit().unwrap();
        assert_eq!(committed.len(), 2);

        assert_eq!(rx.try_recv().unwrap().seq(), 1);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.seq(), 2);
        assert_eq!(second.cmd(), BinlogCommand::Del);
    }

    #[test]
    fn test_trim_window() {
        let q = queue(10);
        for i in 0..30u8 {
            set(&q, &[i], b"v");
        }
        assert_eq!(q.min_seq(), 1);

        assert_eq!(q.trim(None).unwrap(), 20);
        assert_eq!(q.min_seq(), 21);
        assert!(q.find_by_seq(20).unwrap().is_none());
        assert_eq!(q.find_next(0).unwrap().unwrap().seq(), 21);

        // inside the window: nothing to do
        assert_eq!(q.trim(None).unwrap(), 0);

        // sequences keep growing past trimmed entries
        assert_eq!(set(&q, b"new", b"v"), 31);
    }

    #[test]
    fn test_trim_respects_replica_floor() {
        let q = queue(10);
        for i in 0..30u8 {
            set(&q, &[i], b"v");
        }
        assert_eq!(q.trim(Some(15)).unwrap(), 15);
        assert_eq!(q.min_seq(), 16);

        let q = queue(10);
        for i in 0..30u8 {
            set(&q, &[i], b"v");
        }
        // 25 behind with capacity 10: the replica is starved
        assert_eq!(q.trim(Some(5)).unwrap(), 20);
    }

    #[test]
    fn test_reopen_recovers_window() {
        let dir = tempdir().unwrap();
        {
            let store = Arc::new(RocksStore::open(dir.path(), 0).unwrap());
            let q = BinlogQueue::open(store, &config(10)).unwrap();
            for i in 0..30u8 {
                set(&q, &[i], b"v");
            }
            q.trim(None).unwrap();
        }

        let store = Arc::new(RocksStore::open(dir.path(), 0).unwrap());
        let q = BinlogQueue::open(store, &config(10)).unwrap();
        assert_eq!(q.last_seq(), 30);
        assert_eq!(q.min_seq(), 21);
        assert_eq!(set(&q, b"after", b"v"), 31);
    }

    #[tokio::test]
    async fn test_trimmer_task() {
        let q = Arc::new(queue(10));
        for i in 0..30u8 {
            set(&q, &[i], b"v");
        }
        let cancel = CancellationToken::new();
        let handle = BinlogQueue::spawn_trimmer(
            q.clone(),
            || None,
            Duration::from_millis(5),
            cancel.clone(),
        );

        for _ in 0..100 {
            if q.min_seq() == 21 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(q.min_seq(), 21);
    }
}
