//! Master and slave data servers replicating over TCP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tinykv::binlog::BinlogQueue;
use tinykv::common::keys::{encode_kv_key, SLAVE_STATUS_KEY};
use tinykv::common::{KvStore, MemStore, NodeRole};
use tinykv::replication::{ReplicaConsumer, ReplicaRegistry};
use tinykv::{Config, DataServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Node {
    cache: SocketAddr,
    replication: Option<SocketAddr>,
    binlog: Arc<BinlogQueue>,
    registry: Arc<ReplicaRegistry>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<tinykv::Result<()>>,
}

impl Node {
    async fn stop(self) {
        self.stop.send(()).unwrap();
        self.task.await.unwrap().unwrap();
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.sync.tick_interval_ms = 20;
    config.sync.noop_idles = 2;
    config.binlog.trim_interval_ms = 10;
    config
}

async fn start(config: Config, store: Arc<dyn KvStore>) -> Node {
    let role = config.replication.role;
    let server = DataServer::with_store(config, store).unwrap();
    let binlog = server.binlog().clone();
    let registry = server.registry().clone();

    let cache = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cache_addr = cache.local_addr().unwrap();
    let replication = match role {
        NodeRole::Master => Some(TcpListener::bind("127.0.0.1:0").await.unwrap()),
        NodeRole::Slave => None,
    };
    let replication_addr = replication.as_ref().map(|l| l.local_addr().unwrap());

    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run(cache, replication, async move {
        let _ = stopped.await;
    }));

    Node {
        cache: cache_addr,
        replication: replication_addr,
        binlog,
        registry,
        stop,
        task,
    }
}

async fn start_slave(master: &Node, store: Arc<dyn KvStore>) -> Node {
    let mut config = test_config();
    config.replication.role = NodeRole::Slave;
    config.replication.master_addr = master.replication;
    start(config, store).await
}

async fn call(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(b"quit\r\n").await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("server did not answer")
        .unwrap();
    String::from_utf8(response).unwrap()
}

async fn set(addr: SocketAddr, key: &str, value: &str) {
    let reply = call(addr, &format!("set {} 0 0 {}\r\n{}\r\n", key, value.len(), value)).await;
    assert_eq!(reply, "STORED\r\n");
}

async fn delete(addr: SocketAddr, key: &str) {
    assert_eq!(call(addr, &format!("delete {}\r\n", key)).await, "DELETED\r\n");
}

fn value(store: &Arc<dyn KvStore>, key: &str) -> Option<Vec<u8>> {
    store.get(&encode_kv_key(key.as_bytes())).unwrap()
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_slave_copies_then_follows() {
    let master = start(test_config(), Arc::new(MemStore::new())).await;
    for i in 0..20 {
        set(master.cache, &format!("pre{:02}", i), &format!("v{}", i)).await;
    }

    let slave_store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let slave = start_slave(&master, slave_store.clone()).await;

    eventually("full copy", || {
        (0..20).all(|i| value(&slave_store, &format!("pre{:02}", i)).is_some())
    })
    .await;

    set(master.cache, "live", "after-copy").await;
    delete(master.cache, "pre03").await;
    eventually("live writes", || {
        value(&slave_store, "live").as_deref() == Some(&b"after-copy"[..])
            && value(&slave_store, "pre03").is_none()
    })
    .await;

    // cursor catches up with the master once idle
    let last = master.binlog.last_seq();
    eventually("cursor", || {
        ReplicaConsumer::open(slave_store.clone())
            .map(|c| c.cursor_seq() == last && c.cursor_key().is_empty())
            .unwrap_or(false)
    })
    .await;
    assert_eq!(master.registry.len(), 1);

    slave.stop().await;
    eventually("replica removal", || master.registry.is_empty()).await;
    master.stop().await;
}

#[tokio::test]
async fn test_slave_serves_reads_but_rejects_writes() {
    let master = start(test_config(), Arc::new(MemStore::new())).await;
    set(master.cache, "greeting", "hello").await;

    let slave_store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let slave = start_slave(&master, slave_store.clone()).await;
    eventually("replicated key", || value(&slave_store, "greeting").is_some()).await;

    assert_eq!(
        call(slave.cache, "get greeting\r\n").await,
        "VALUE greeting 0 5\r\nhello\r\nEND\r\n"
    );
    assert!(call(slave.cache, "set greeting 0 0 3\r\nbye\r\n")
        .await
        .starts_with("SERVER_ERROR"));
    assert!(call(slave.cache, "delete greeting\r\n")
        .await
        .starts_with("SERVER_ERROR"));

    slave.stop().await;
    master.stop().await;
}

#[tokio::test]
async fn test_stale_slave_falls_back_to_full_copy() {
    let mut config = test_config();
    config.binlog.capacity = 5;
    let master = start(config, Arc::new(MemStore::new())).await;
    for i in 0..40 {
        set(master.cache, &format!("key{:02}", i), "x").await;
    }
    eventually("binlog trim", || master.binlog.min_seq() > 10).await;

    // a slave that stopped long ago at seq 3
    let slave_store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    slave_store
        .put(SLAVE_STATUS_KEY, &3u64.to_le_bytes())
        .unwrap();
    let slave = start_slave(&master, slave_store.clone()).await;

    eventually("resync", || {
        (0..40).all(|i| value(&slave_store, &format!("key{:02}", i)).is_some())
    })
    .await;

    set(master.cache, "after", "resync").await;
    eventually("live write after resync", || value(&slave_store, "after").is_some()).await;

    slave.stop().await;
    master.stop().await;
}

#[tokio::test]
async fn test_slave_resumes_after_master_restart() {
    let master_store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let master = start(test_config(), master_store.clone()).await;
    set(master.cache, "first", "1").await;

    let replication_addr = master.replication.unwrap();
    let slave_store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let slave = start_slave(&master, slave_store.clone()).await;
    eventually("first key", || value(&slave_store, "first").is_some()).await;

    // restart the master on the same store and address
    master.stop().await;
    let server = DataServer::with_store(test_config(), master_store).unwrap();
    let cache = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cache_addr = cache.local_addr().unwrap();
    let replication = TcpListener::bind(replication_addr).await.unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run(cache, Some(replication), async move {
        let _ = stopped.await;
    }));

    set(cache_addr, "second", "2").await;
    eventually("write after restart", || value(&slave_store, "second").is_some()).await;

    slave.stop().await;
    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}
