//! Master side: accepts replica connections and hands them to the registry

use crate::common::{Error, ReplicationConfig, Result, SyncConfig};
use crate::replication::protocol::{Message, ReplicationCodec};
use crate::replication::registry::{ReplicaRegistry, SessionId};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub struct MasterService {
    registry: Arc<ReplicaRegistry>,
    timeout: Option<Duration>,
    outbound_queue: usize,
    next_sid: AtomicU64,
    sessions: TaskTracker,
}

impl MasterService {
    pub fn new(
        registry: Arc<ReplicaRegistry>,
        replication: &ReplicationConfig,
        sync: &SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            timeout: (replication.timeout_secs > 0).then(|| replication.timeout()),
            outbound_queue: sync.outbound_queue,
            next_sid: AtomicU64::new(1),
            sessions: TaskTracker::new(),
        })
    }

    /// Accept replicas on `listener` until `cancel` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!("Master service listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Master service shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst);
                        let service = self.clone();
                        let cancel = cancel.clone();
                        self.sessions.spawn(async move {
                            service.handle_session(sid, stream, addr, cancel).await;
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
            }
        }

        self.sessions.close();
        self.sessions.wait().await;
        Ok(())
    }

    async fn handle_session(
        &self,
        sid: SessionId,
        stream: TcpStream,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) {
        info!("sid: {}, replica connected from {}", sid, addr);
        let _ = stream.set_nodelay(true);

        let (mut sink, mut frames) = Framed::new(stream, ReplicationCodec).split();
        let (outbound, mut queue) = mpsc::channel::<Message>(self.outbound_queue);

        let writer = tokio::spawn(async move {
            while let Some(msg) = queue.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!("sid: {}, write failed: {}", sid, e);
                    break;
                }
            }
        });

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut frames, self.timeout) => frame,
            };
            match frame {
                Ok(Message::SyncRequest { seq, key }) => {
                    if let Err(e) = self.registry.open(sid, seq, key, outbound.clone()) {
                        error!("sid: {}, cannot start sync worker: {}", sid, e);
                        break;
                    }
                }
                Ok(Message::Ping) => {
                    if outbound.send(Message::Ping).await.is_err() {
                        break;
                    }
                }
                Ok(other) => {
                    warn!("sid: {}, unexpected {:?} from replica", sid, other.kind());
                    break;
                }
                Err(Error::ConnectionClosed) => break,
                Err(e) => {
                    warn!("sid: {}, replica session error: {}", sid, e);
                    break;
                }
            }
        }

        self.registry.close(sid);
        drop(outbound);
        writer.abort();
        info!("sid: {}, replica {} disconnected", sid, addr);
    }
}

/// Next frame, `ConnectionClosed` on EOF, `Timeout` if the peer went silent
pub(crate) async fn read_frame<S>(frames: &mut S, timeout: Option<Duration>) -> Result<Message>
where
    S: futures_util::Stream<Item = Result<Message>> + Unpin,
{
    let next = match timeout {
        Some(limit) => tokio::time::timeout(limit, frames.next())
            .await
            .map_err(|_| Error::Timeout(format!("no frame within {:?}", limit)))?,
        None => frames.next().await,
    };
    next.unwrap_or(Err(Error::ConnectionClosed))
}
