//! Membership of active replication links

use crate::binlog::{BinlogEntry, BinlogQueue};
use crate::common::{Error, Result, SyncConfig};
use crate::replication::link::{LinkParts, ReplicationLink};
use crate::replication::protocol::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Stable identity of one replica connection
pub type SessionId = u64;

const INBOX_SIZE: usize = 256;

/// Coarse status used to pick push-on-commit targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    Copy,
    Sync,
}

impl std::fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaStatus::Copy => write!(f, "COPY"),
            ReplicaStatus::Sync => write!(f, "SYNC"),
        }
    }
}

struct Member {
    link_id: u64,
    status: ReplicaStatus,
    cursor: Arc<AtomicU64>,
    inbox: mpsc::Sender<BinlogEntry>,
    cancel: CancellationToken,
}

pub struct ReplicaRegistry {
    binlog: Arc<BinlogQueue>,
    config: SyncConfig,
    members: Mutex<HashMap<SessionId, Member>>,
    next_link: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ReplicaRegistry {
    pub fn new(binlog: Arc<BinlogQueue>, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            binlog,
            config,
            members: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Register a link for `sid` without starting its worker.
    ///
    /// A link already registered under `sid` is replaced and stops on its
    /// next iteration.
    pub fn attach(
        self: &Arc<Self>,
        sid: SessionId,
        seq: u64,
        key: Vec<u8>,
        outbound: mpsc::Sender<Message>,
    ) -> ReplicationLink {
        let link_id = self.next_link.fetch_add(1, Ordering::SeqCst);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_SIZE);
        let cursor = Arc::new(AtomicU64::new(seq));
        let cancel = self.cancel.child_token();

        let previous = self.members.lock().insert(
            sid,
            Member {
                link_id,
                status: ReplicaStatus::Copy,
                cursor: cursor.clone(),
                inbox: inbox_tx,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!("sid: {}, replacing link {}", sid, previous.link_id);
            previous.cancel.cancel();
        }

        ReplicationLink::new(LinkParts {
            sid,
            link_id,
            seq,
            key,
            binlog: self.binlog.clone(),
            registry: self.clone(),
            outbound,
            inbox: inbox_rx,
            published: cursor,
            cancel,
            config: self.config.clone(),
        })
    }

    /// Start a replication worker for `sid` from the replica's cursor
    pub fn open(
        self: &Arc<Self>,
        sid: SessionId,
        seq: u64,
        key: Vec<u8>,
        outbound: mpsc::Sender<Message>,
    ) -> Result<()> {
        if self.cancel.is_cancelled() || self.tracker.is_closed() {
            return Err(Error::ShuttingDown);
        }
        info!("sid: {}, accept sync client", sid);
        let link = self.attach(sid, seq, key, outbound);
        self.tracker.spawn(link.run());
        Ok(())
    }

    /// Remove the link for `sid`; its worker exits on its next iteration.
    /// Returns false if no link was registered.
    pub fn close(&self, sid: SessionId) -> bool {
        match self.members.lock().remove(&sid) {
            Some(member) => {
                member.cancel.cancel();
                info!("sid: {}, replica closed", sid);
                true
            }
            None => false,
        }
    }

    /// Called by a link on exit; leaves a replacement link in place
    pub(crate) fn detach(&self, sid: SessionId, link_id: u64) {
        let mut members = self.members.lock();
        if members.get(&sid).is_some_and(|m| m.link_id == link_id) {
            members.remove(&sid);
        }
    }

    pub(crate) fn is_member(&self, sid: SessionId, link_id: u64) -> bool {
        self.members
            .lock()
            .get(&sid)
            .is_some_and(|m| m.link_id == link_id)
    }

    fn set_status(&self, sid: SessionId, link_id: u64, status: ReplicaStatus) {
        let mut members = self.members.lock();
        if let Some(member) = members.get_mut(&sid) {
            if member.link_id == link_id && member.status != status {
                debug!("sid: {}, status {} -> {}", sid, member.status, status);
                member.status = status;
            }
        }
    }

    /// Make `sid` eligible for push-on-commit.
    ///
    /// Ignored when `link_id` is no longer the registered link for `sid`.
    pub fn mark_syncing(&self, sid: SessionId, link_id: u64) {
        self.set_status(sid, link_id, ReplicaStatus::Sync);
    }

    /// Take `sid` out of push-on-commit while it copies
    pub(crate) fn mark_copying(&self, sid: SessionId, link_id: u64) {
        self.set_status(sid, link_id, ReplicaStatus::Copy);
    }

    /// Hand a committed entry to every link in SYNC.
    ///
    /// Never blocks: a full inbox drops the push and the link's own poll
    /// delivers the entry. Returns the number of links notified.
    pub fn push_on_commit(&self, entry: &BinlogEntry) -> usize {
        let members = self.members.lock();
        let mut notified = 0;
        for (sid, member) in members.iter() {
            if member.status != ReplicaStatus::Sync {
                continue;
            }
            match member.inbox.try_send(entry.clone()) {
                Ok(()) => notified += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("sid: {}, inbox full, dropped push of seq {}", sid, entry.seq())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        notified
    }

    /// Forward binlog commits to [`ReplicaRegistry::push_on_commit`] until
    /// shutdown
    pub fn spawn_push_loop(self: &Arc<Self>) {
        let registry = self.clone();
        let mut commits = self.binlog.subscribe();
        self.tracker.spawn(async move {
            loop {
                let entry = tokio::select! {
                    _ = registry.cancel.cancelled() => break,
                    received = commits.recv() => received,
                };
                match entry {
                    Ok(entry) => {
                        registry.push_on_commit(&entry);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("push loop lagged by {} entries", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("push loop stopped");
        });
    }

    /// Lowest cursor among replicas that need the binlog; the trimming floor.
    ///
    /// A copying link at cursor 0 has not picked a start point yet and does
    /// not hold the binlog back. A syncing link at cursor 0 does.
    pub fn min_cursor(&self) -> Option<u64> {
        self.members
            .lock()
            .values()
            .filter_map(|m| {
                let seq = m.cursor.load(Ordering::SeqCst);
                (seq != 0 || m.status == ReplicaStatus::Sync).then_some(seq)
            })
            .min()
    }

    pub fn status(&self, sid: SessionId) -> Option<ReplicaStatus> {
        self.members.lock().get(&sid).map(|m| m.status)
    }

    /// `(sid, status, cursor)` of every link
    pub fn snapshot(&self) -> Vec<(SessionId, ReplicaStatus, u64)> {
        let mut out: Vec<_> = self
            .members
            .lock()
            .iter()
            .map(|(sid, m)| (*sid, m.status, m.cursor.load(Ordering::SeqCst)))
            .collect();
        out.sort_unstable_by_key(|(sid, _, _)| *sid);
        out
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Stop every worker and wait for them to exit.
    ///
    /// Returns false if they did not drain within the configured timeout.
    pub async fn shutdown(&self) -> bool {
        self.cancel.cancel();
        self.tracker.close();
        let drained =
            tokio::time::timeout(self.config.shutdown_timeout(), self.tracker.wait())
                .await
                .is_ok();
        self.members.lock().clear();
        if drained {
            debug!("replication workers drained");
        } else {
            warn!(
                "{} replication workers did not exit within {:?}",
                self.tracker.len(),
                self.config.shutdown_timeout()
            );
        }
        drained
    }
}
