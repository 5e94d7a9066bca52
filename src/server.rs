//! Data server: wires storage, binlog, replication and the cache listener

use crate::binlog::BinlogQueue;
use crate::cache::{CacheHandler, CacheServer};
use crate::common::{open_store, Config, Error, KvStore, NodeRole, Result};
use crate::replication::{MasterService, ReplicaConsumer, ReplicaRegistry, SlaveClient};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct DataServer {
    config: Config,
    store: Arc<dyn KvStore>,
    binlog: Arc<BinlogQueue>,
    registry: Arc<ReplicaRegistry>,
    handler: Arc<CacheHandler>,
    cancel: CancellationToken,
}

impl DataServer {
    /// Open the persistent store described by `config`
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.storage)?;
        Self::with_store(config, store)
    }

    /// Build every component over an already opened store
    pub fn with_store(config: Config, store: Arc<dyn KvStore>) -> Result<Self> {
        let binlog = Arc::new(BinlogQueue::open(store.clone(), &config.binlog)?);
        let registry = ReplicaRegistry::new(binlog.clone(), config.sync.clone());
        let handler = Arc::new(CacheHandler::new(
            binlog.clone(),
            Some(registry.clone()),
            config.replication.role,
        ));

        Ok(Self {
            config,
            store,
            binlog,
            registry,
            handler,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn binlog(&self) -> &Arc<BinlogQueue> {
        &self.binlog
    }

    pub fn registry(&self) -> &Arc<ReplicaRegistry> {
        &self.registry
    }

    pub fn handler(&self) -> &Arc<CacheHandler> {
        &self.handler
    }

    /// Bind the configured addresses and run until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        let cache = TcpListener::bind(self.config.service.bind_addr).await?;
        let replication = match self.config.replication.role {
            NodeRole::Master => Some(TcpListener::bind(self.config.replication.bind_addr).await?),
            NodeRole::Slave => None,
        };

        self.run(cache, replication, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await
    }

    /// Run on pre-bound listeners until `shutdown` resolves
    pub async fn run<F>(
        self,
        cache: TcpListener,
        replication: Option<TcpListener>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting tinykv {} as {}", crate::BUILD_INFO, self.config.replication.role);
        info!("  Cache API: {}", cache.local_addr()?);
        info!("  Data path: {}", self.config.storage.data_path().display());

        let mut tasks: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

        let registry = self.registry.clone();
        let trimmer = BinlogQueue::spawn_trimmer(
            self.binlog.clone(),
            move || registry.min_cursor(),
            self.config.binlog.trim_interval(),
            self.cancel.clone(),
        );

        let cache_server = CacheServer::new(
            self.handler.clone(),
            timeout(self.config.service.timeout_secs),
        );
        let cancel = self.cancel.clone();
        tasks.push((
            "cache",
            tokio::spawn(async move { cache_server.serve(cache, cancel).await }),
        ));

        match self.config.replication.role {
            NodeRole::Master => {
                let listener = replication.ok_or_else(|| {
                    Error::InvalidConfig("master requires a replication listener".into())
                })?;
                info!("  Replication: {}", listener.local_addr()?);
                self.registry.spawn_push_loop();
                let master = MasterService::new(
                    self.registry.clone(),
                    &self.config.replication,
                    &self.config.sync,
                );
                tasks.push(("master", tokio::spawn(master.serve(listener, self.cancel.clone()))));
            }
            NodeRole::Slave => {
                let master_addr = self.config.replication.master_addr.ok_or_else(|| {
                    Error::InvalidConfig("slave requires replication.master_addr".into())
                })?;
                info!("  Master: {}", master_addr);
                let consumer = ReplicaConsumer::open(self.store.clone())?;
                let client = SlaveClient::new(master_addr, consumer, &self.config.replication);
                tasks.push(("slave", tokio::spawn(client.run(self.cancel.clone()))));
            }
        }

        info!("✓ tinykv ready");
        shutdown.await;

        self.cancel.cancel();
        self.registry.shutdown().await;
        for (name, task) in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} task failed: {}", name, e),
                Err(e) => error!("{} task panicked: {}", name, e),
            }
        }
        if let Err(e) = trimmer.await {
            error!("trimmer task panicked: {}", e);
        }

        self.store.flush()?;
        info!("tinykv stopped");
        Ok(())
    }
}

fn timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
