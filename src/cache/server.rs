//! Cache protocol listener and per-connection session loop

use crate::cache::handler::{CacheHandler, Outcome};
use crate::cache::protocol::Parser;
use crate::common::{Error, Result};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

pub struct CacheServer {
    handler: Arc<CacheHandler>,
    timeout: Option<Duration>,
}

impl CacheServer {
    pub fn new(handler: Arc<CacheHandler>, timeout: Option<Duration>) -> Self {
        Self { handler, timeout }
    }

    /// Accept clients until `cancel` fires, then wait for open sessions
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!("Cache service listening on {}", listener.local_addr()?);
        let sessions = TaskTracker::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let handler = self.handler.clone();
                        let timeout = self.timeout;
                        let cancel = cancel.clone();
                        sessions.spawn(async move {
                            debug!("client {} connected", addr);
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                result = serve_session(stream, handler, timeout) => {
                                    if let Err(e) = result {
                                        debug!("client {} session ended: {}", addr, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
            }
        }

        sessions.close();
        sessions.wait().await;
        info!("Cache service stopped");
        Ok(())
    }
}

/// Run one client session until EOF, `quit` or an idle timeout.
///
/// Partially received commands stay buffered across reads.
pub async fn serve_session<S>(
    mut stream: S,
    handler: Arc<CacheHandler>,
    timeout: Option<Duration>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    let mut parser = Parser::new();

    loop {
        while let Some(parsed) = parser.parse(&mut buf) {
            let outcome = match parsed {
                Ok(cmd) => handler.execute(cmd),
                Err(e) => Outcome::Reply(e.reply()),
            };
            match outcome {
                Outcome::Reply(bytes) => stream.write_all(&bytes).await?,
                Outcome::Silent => {}
                Outcome::Close => {
                    stream.flush().await?;
                    return Ok(());
                }
            }
        }
        stream.flush().await?;

        let read = match timeout {
            Some(limit) => tokio::time::timeout(limit, stream.read_buf(&mut buf))
                .await
                .map_err(|_| Error::Timeout(format!("client idle for {:?}", limit)))??,
            None => stream.read_buf(&mut buf).await?,
        };
        if read == 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::BinlogQueue;
    use crate::common::{BinlogConfig, MemStore, NodeRole};
    use tokio_test::io::Builder;

    fn handler() -> Arc<CacheHandler> {
        let binlog = Arc::new(
            BinlogQueue::open(Arc::new(MemStore::new()), &BinlogConfig::default()).unwrap(),
        );
        Arc::new(CacheHandler::new(binlog, None, NodeRole::Master))
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let mock = Builder::new()
            .read(b"set a 0 0 1\r\n1\r\n")
            .write(b"STORED\r\n")
            .read(b"get a\r\n")
            .write(b"VALUE a 0 1\r\n1\r\nEND\r\n")
            .build();
        serve_session(mock, handler(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_split_across_reads() {
        let mock = Builder::new()
            .read(b"set greeting 0 0 5\r\nhe")
            .read(b"llo\r\nget gree")
            .write(b"STORED\r\n")
            .read(b"ting\r\n")
            .write(b"VALUE greeting 0 5\r\nhello\r\nEND\r\n")
            .build();
        serve_session(mock, handler(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_keep_session_open() {
        let mock = Builder::new()
            .read(b"bogus\r\nincr\r\nset a 0 0 1 noreply\r\n1\r\nget a\r\n")
            .write(b"ERROR unknown command:bogus\r\n")
            .write(b"CLIENT_ERROR bad command line format\r\n")
            .write(b"VALUE a 0 1\r\n1\r\nEND\r\n")
            .build();
        serve_session(mock, handler(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_closes_before_remaining_input() {
        let mock = Builder::new()
            .read(b"version\r\nquit\r\nget a\r\n")
            .write(format!("VERSION {}\r\n", env!("CARGO_PKG_VERSION")).as_bytes())
            .build();
        serve_session(mock, handler(), None).await.unwrap();
    }
}
