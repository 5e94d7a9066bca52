//! Per-replica replication state machine
//!
//! One link drives one replica from its last cursor to the live binlog head:
//! a full keyspace copy when the replica is new or diverged, then incremental
//! replay in sequence order.

use crate::binlog::{BinlogCommand, BinlogEntry, BinlogQueue};
use crate::common::keys::{is_kv_key, KV_PREFIX};
use crate::common::{display_key, successor, Error, Result, SnapshotIter, SyncConfig};
use crate::replication::protocol::{Message, SyncMethod};
use crate::replication::registry::{ReplicaRegistry, SessionId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Init,
    Copy,
    Sync,
    OutOfSync,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Init => write!(f, "INIT"),
            LinkState::Copy => write!(f, "COPY"),
            LinkState::Sync => write!(f, "SYNC"),
            LinkState::OutOfSync => write!(f, "OUT_OF_SYNC"),
        }
    }
}

/// Result of one pass of the driving loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Something was streamed or the state changed
    Busy,
    /// Nothing to do until new writes arrive
    Idle,
}

pub struct ReplicationLink {
    sid: SessionId,
    link_id: u64,
    state: LinkState,
    cursor_seq: u64,
    cursor_key: Vec<u8>,
    iter: Option<SnapshotIter>,
    binlog: Arc<BinlogQueue>,
    registry: Arc<ReplicaRegistry>,
    outbound: mpsc::Sender<Message>,
    inbox: mpsc::Receiver<BinlogEntry>,
    published: Arc<AtomicU64>,
    cancel: CancellationToken,
    config: SyncConfig,
}

pub(crate) struct LinkParts {
    pub sid: SessionId,
    pub link_id: u64,
    pub seq: u64,
    pub key: Vec<u8>,
    pub binlog: Arc<BinlogQueue>,
    pub registry: Arc<ReplicaRegistry>,
    pub outbound: mpsc::Sender<Message>,
    pub inbox: mpsc::Receiver<BinlogEntry>,
    pub published: Arc<AtomicU64>,
    pub cancel: CancellationToken,
    pub config: SyncConfig,
}

impl ReplicationLink {
    pub(crate) fn new(parts: LinkParts) -> Self {
        let mut link = Self {
            sid: parts.sid,
            link_id: parts.link_id,
            state: LinkState::Init,
            cursor_seq: parts.seq,
            cursor_key: parts.key,
            iter: None,
            binlog: parts.binlog,
            registry: parts.registry,
            outbound: parts.outbound,
            inbox: parts.inbox,
            published: parts.published,
            cancel: parts.cancel,
            config: parts.config,
        };
        link.init();
        link
    }

    fn init(&mut self) {
        // a replica clears its copy key when it receives the copy END marker
        self.state = if self.cursor_key.is_empty() && self.cursor_seq != 0 {
            LinkState::Sync
        } else {
            LinkState::Copy
        };
        self.published.store(self.cursor_seq, Ordering::SeqCst);
        info!(
            "sid: {}, link start in {}, seq={}, key={}",
            self.sid,
            self.state,
            self.cursor_seq,
            display_key(&self.cursor_key)
        );
    }

    pub fn sid(&self) -> SessionId {
        self.sid
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn cursor_seq(&self) -> u64 {
        self.cursor_seq
    }

    pub fn cursor_key(&self) -> &[u8] {
        &self.cursor_key
    }

    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && self.registry.is_member(self.sid, self.link_id)
    }

    fn set_cursor(&mut self, seq: u64) {
        self.cursor_seq = seq;
        self.published.store(seq, Ordering::SeqCst);
    }

    /// Drive the link until the session closes or the registry drops it
    pub async fn run(mut self) {
        let mut idle = 0u32;
        while self.is_live() {
            match self.step().await {
                Ok(Step::Busy) => idle = 0,
                Ok(Step::Idle) => {
                    if self.state == LinkState::Sync {
                        self.registry.mark_syncing(self.sid, self.link_id);
                    }
                    let result = if idle >= self.config.noop_idles {
                        idle = 0;
                        self.noop().await
                    } else {
                        idle += 1;
                        match self.wait().await {
                            Ok(true) => {
                                idle = 0;
                                Ok(())
                            }
                            Ok(false) => Ok(()),
                            Err(e) => Err(e),
                        }
                    };
                    if let Err(e) = result {
                        debug!("sid: {}, link stopping: {}", self.sid, e);
                        break;
                    }
                }
                Err(Error::ConnectionClosed) | Err(Error::ShuttingDown) => break,
                Err(e) => {
                    error!("sid: {}, replication step failed: {}", self.sid, e);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.tick_interval()) => {}
                    }
                }
            }
        }

        self.registry.detach(self.sid, self.link_id);
        info!("sid: {}, sync link quit at seq {}", self.sid, self.cursor_seq);
    }

    /// One iteration: resync if diverged, then SYNC, then COPY.
    ///
    /// SYNC runs first because it may move the cursor and invalidate the copy
    /// iterator.
    pub async fn step(&mut self) -> Result<Step> {
        if self.state == LinkState::OutOfSync {
            self.reset().await?;
            return Ok(Step::Busy);
        }

        let mut busy = self.sync().await?;
        if self.state == LinkState::Copy && self.copy().await? {
            busy = true;
        }
        Ok(if busy { Step::Busy } else { Step::Idle })
    }

    /// Idle until the next tick, a pushed entry or cancellation.
    /// Returns true when a pushed entry was streamed.
    async fn wait(&mut self) -> Result<bool> {
        let pushed = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::ShuttingDown),
            _ = tokio::time::sleep(self.config.tick_interval()) => return Ok(false),
            pushed = self.inbox.recv() => pushed,
        };
        match pushed {
            Some(entry) => self.on_push(entry).await,
            None => Ok(false),
        }
    }

    /// Stream a freshly committed entry if it is exactly the next one
    pub async fn on_push(&mut self, entry: BinlogEntry) -> Result<bool> {
        if self.state != LinkState::Sync || entry.seq() != self.cursor_seq + 1 {
            return Ok(false);
        }
        self.set_cursor(entry.seq());
        self.stream(entry).await?;
        Ok(true)
    }

    async fn sync(&mut self) -> Result<bool> {
        let mut skipped = 0usize;
        let entry = loop {
            let expect = self.cursor_seq + 1;
            // a fresh copy covers every write up to the newest entry
            let fresh = self.state == LinkState::Copy
                && self.cursor_seq == 0
                && self.cursor_key.is_empty();
            let found = if fresh {
                self.binlog.find_last()?
            } else {
                self.binlog.find_next(expect)?
            };
            let Some(entry) = found else {
                return Ok(skipped > 0);
            };

            if !fresh && entry.seq() != expect {
                warn!(
                    "sid: {}, OUT_OF_SYNC! log.seq: {}, expect_seq: {}",
                    self.sid,
                    entry.seq(),
                    expect
                );
                self.state = LinkState::OutOfSync;
                return Ok(true);
            }

            if self.state == LinkState::Copy && entry.key() > self.cursor_key.as_slice() {
                // the copy has not reached this key yet and will send it
                self.set_cursor(entry.seq());
                self.iter = None;
                skipped += 1;
                if skipped >= self.config.copy_batch {
                    return Ok(true);
                }
                continue;
            }

            self.set_cursor(entry.seq());
            break entry;
        };

        self.stream(entry).await?;
        Ok(true)
    }

    async fn stream(&mut self, entry: BinlogEntry) -> Result<()> {
        match entry.cmd() {
            BinlogCommand::Set => match self.binlog.store().get(entry.key())? {
                Some(value) => {
                    self.send(Message::response(SyncMethod::Sync, entry, value))
                        .await
                }
                None => {
                    error!(
                        "sid: {}, get key={} error, skipping seq {}",
                        self.sid,
                        display_key(entry.key()),
                        entry.seq()
                    );
                    Ok(())
                }
            },
            BinlogCommand::Del => {
                self.send(Message::response(SyncMethod::Sync, entry, Vec::new()))
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn copy(&mut self) -> Result<bool> {
        if self.iter.is_none() {
            let start = if self.cursor_key.is_empty() {
                vec![KV_PREFIX]
            } else {
                successor(&self.cursor_key)
            };
            info!(
                "sid: {}, new iterator, lastkey: '{}'",
                self.sid,
                display_key(&self.cursor_key)
            );
            self.iter = Some(SnapshotIter::new(
                self.binlog.store().clone(),
                &start,
                self.config.copy_batch,
            ));
        }

        let mut sent = false;
        for _ in 0..self.config.copy_batch {
            let next = self.iter.as_mut().and_then(|it| it.next());
            let (key, value) = match next {
                Some(pair) => pair?,
                None => {
                    self.finish_copy().await?;
                    return Ok(true);
                }
            };
            if key.first().is_some_and(|b| *b > KV_PREFIX) {
                self.finish_copy().await?;
                return Ok(true);
            }
            if !is_kv_key(&key) {
                continue;
            }

            self.cursor_key = key.clone();
            let entry = BinlogEntry::new(self.cursor_seq, BinlogCommand::Set, key);
            self.send(Message::response(SyncMethod::Copy, entry, value))
                .await?;
            sent = true;
        }
        Ok(sent)
    }

    async fn finish_copy(&mut self) -> Result<()> {
        self.state = LinkState::Sync;
        self.iter = None;
        info!("sid: {}, copy end at seq {}", self.sid, self.cursor_seq);
        let end = BinlogEntry::marker(self.cursor_seq, BinlogCommand::End);
        self.send(Message::response(SyncMethod::Copy, end, Vec::new()))
            .await
    }

    /// Forget the cursor and start a full copy
    async fn reset(&mut self) -> Result<()> {
        info!("sid: {}, copy begin", self.sid);
        self.state = LinkState::Copy;
        self.set_cursor(0);
        self.cursor_key.clear();
        self.iter = None;
        self.registry.mark_copying(self.sid, self.link_id);

        let begin = BinlogEntry::marker(0, BinlogCommand::Begin);
        self.send(Message::response(SyncMethod::Copy, begin, Vec::new()))
            .await
    }

    /// Heartbeat carrying the cursor so the replica can persist it
    async fn noop(&mut self) -> Result<()> {
        let seq = if self.state == LinkState::Copy && self.cursor_key.is_empty() {
            0
        } else {
            self.cursor_seq
        };
        let noop = BinlogEntry::marker(seq, BinlogCommand::None);
        self.send(Message::response(SyncMethod::Noop, noop, Vec::new()))
            .await
    }

    async fn send(&self, msg: Message) -> Result<()> {
        tokio::select! {
            sent = self.outbound.send(msg) => sent.map_err(|_| Error::ConnectionClosed),
            _ = self.cancel.cancelled() => Err(Error::ShuttingDown),
        }
    }
}
