//! Restart recovery on the RocksDB engine

use std::sync::Arc;
use tempfile::TempDir;
use tinykv::binlog::{BinlogCommand, BinlogEntry, BinlogQueue};
use tinykv::common::keys::encode_kv_key;
use tinykv::common::{open_store, BinlogConfig, KvStore, StorageConfig};
use tinykv::replication::{ReplicaConsumer, SyncMethod};

fn storage(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        location: dir.path().to_path_buf(),
        cache_size_mb: 8,
    }
}

#[test]
fn test_binlog_sequence_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = BinlogConfig::default();

    {
        let store = open_store(&storage(&dir)).unwrap();
        let binlog = BinlogQueue::open(store, &config).unwrap();
        for i in 0..5u8 {
            let mut tx = binlog.begin();
            tx.set(&[b'a' + i], b"v");
            tx.commit().unwrap();
        }
        let mut tx = binlog.begin();
        tx.del(b"a");
        tx.commit().unwrap();
        binlog.store().flush().unwrap();
    }

    let store = open_store(&storage(&dir)).unwrap();
    let binlog = BinlogQueue::open(store.clone(), &config).unwrap();
    assert_eq!(binlog.min_seq(), 1);
    assert_eq!(binlog.last_seq(), 6);
    assert_eq!(binlog.find_last().unwrap().unwrap().cmd(), BinlogCommand::Del);

    // numbering continues after the recovered tail
    let mut tx = binlog.begin();
    assert_eq!(tx.set(b"z", b"after"), 7);
    tx.commit().unwrap();
    assert_eq!(binlog.last_seq(), 7);

    assert!(store.get(&encode_kv_key(b"a")).unwrap().is_none());
    assert_eq!(store.get(&encode_kv_key(b"e")).unwrap().unwrap(), b"v");
}

#[test]
fn test_trimmed_window_recovered_on_restart() {
    let dir = TempDir::new().unwrap();
    let config = BinlogConfig {
        capacity: 10,
        trim_batch: 3,
        ..BinlogConfig::default()
    };

    {
        let store = open_store(&storage(&dir)).unwrap();
        let binlog = BinlogQueue::open(store, &config).unwrap();
        for i in 0..30u32 {
            let mut tx = binlog.begin();
            tx.set(format!("key{}", i).as_bytes(), b"v");
            tx.commit().unwrap();
        }
        binlog.trim(None).unwrap();
        assert_eq!(binlog.min_seq(), 21);
    }

    let store = open_store(&storage(&dir)).unwrap();
    let binlog = BinlogQueue::open(store, &config).unwrap();
    assert_eq!(binlog.min_seq(), 21);
    assert_eq!(binlog.last_seq(), 30);
    assert!(binlog.find_by_seq(20).unwrap().is_none());
    assert_eq!(binlog.find_next(1).unwrap().unwrap().seq(), 21);
}

#[test]
fn test_replica_cursor_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let store: Arc<dyn KvStore> = open_store(&storage(&dir)).unwrap();
        let mut consumer = ReplicaConsumer::open(store.clone()).unwrap();
        let entry = BinlogEntry::new(12, BinlogCommand::Set, encode_kv_key(b"copied"));
        consumer.apply(SyncMethod::Copy, &entry, b"value").unwrap();
        store.flush().unwrap();
    }

    // an interrupted copy resumes from the last copied key
    let store = open_store(&storage(&dir)).unwrap();
    let mut consumer = ReplicaConsumer::open(store.clone()).unwrap();
    assert_eq!(consumer.cursor_seq(), 12);
    assert_eq!(consumer.cursor_key(), encode_kv_key(b"copied").as_slice());
    assert_eq!(store.get(&encode_kv_key(b"copied")).unwrap().unwrap(), b"value");

    consumer
        .apply(SyncMethod::Copy, &BinlogEntry::marker(12, BinlogCommand::End), &[])
        .unwrap();
    drop(consumer);

    let consumer = ReplicaConsumer::open(store).unwrap();
    assert_eq!(consumer.cursor_seq(), 12);
    assert!(consumer.cursor_key().is_empty());
}
