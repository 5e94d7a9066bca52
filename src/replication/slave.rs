//! Slave side: follows a master and replays its stream locally

use crate::common::{Error, ReplicationConfig, Result};
use crate::replication::consumer::ReplicaConsumer;
use crate::replication::protocol::{Message, ReplicationCodec};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SlaveClient {
    master_addr: SocketAddr,
    consumer: ReplicaConsumer,
    timeout: Option<Duration>,
    keepalive: Option<Duration>,
    reconnect_delay: Duration,
    established: bool,
}

impl SlaveClient {
    pub fn new(master_addr: SocketAddr, consumer: ReplicaConsumer, config: &ReplicationConfig) -> Self {
        Self {
            master_addr,
            consumer,
            timeout: (config.timeout_secs > 0).then(|| config.timeout()),
            keepalive: (config.keepalive_secs > 0).then(|| config.keepalive()),
            reconnect_delay: INITIAL_RECONNECT_DELAY,
            established: false,
        }
    }

    /// Override the first reconnect delay
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn consumer(&self) -> &ReplicaConsumer {
        &self.consumer
    }

    /// Follow the master until `cancel` fires, reconnecting with backoff
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let initial_delay = self.reconnect_delay;
        let mut delay = initial_delay;

        loop {
            self.established = false;
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.session() => result,
            };

            if self.established {
                delay = initial_delay;
            }
            match result {
                Ok(()) => info!("Master {} closed the session", self.master_addr),
                Err(e) if e.is_retryable() => {
                    warn!("Replication error: {}. Reconnecting in {:?}", e, delay)
                }
                Err(e) => error!("Replication error: {}. Reconnecting in {:?}", e, delay),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = std::cmp::min(delay * 2, MAX_RECONNECT_DELAY);
        }

        info!(
            "Slave client stopped at seq {}",
            self.consumer.cursor_seq()
        );
        Ok(())
    }

    async fn session(&mut self) -> Result<()> {
        info!("Connecting to master at {}", self.master_addr);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.master_addr))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {}", self.master_addr)))?
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", self.master_addr, e)))?;
        let _ = stream.set_nodelay(true);

        let mut framed = Framed::new(stream, ReplicationCodec);
        let request = self.consumer.sync_request();
        info!("Sync request sent: {:?}", request);
        framed.send(request).await?;
        self.established = true;

        let idle_limit = self.timeout.unwrap_or(Duration::from_secs(3600));
        let mut keepalive = tokio::time::interval(self.keepalive.unwrap_or(Duration::from_secs(3600)));
        keepalive.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = keepalive.tick(), if self.keepalive.is_some() => {
                    framed.send(Message::Ping).await?;
                }
                _ = tokio::time::sleep_until(last_seen + idle_limit), if self.timeout.is_some() => {
                    return Err(Error::Timeout(format!(
                        "master silent for {:?}",
                        idle_limit
                    )));
                }
                frame = framed.next() => {
                    let msg = match frame {
                        Some(msg) => msg?,
                        None => return Err(Error::ConnectionClosed),
                    };
                    last_seen = Instant::now();
                    if self.consumer.handle(&msg)? {
                        debug!("Replica cursor at seq {}", self.consumer.cursor_seq());
                    }
                }
            }
        }
    }
}
