//! Steady-state driver for the consensus engine.
//!
//! A [`NodeServer`] owns the raft [`RawNode`] together with the log,
//! snapshotter and store handed over by bootstrap, and runs the usual
//! raft-rs loop: tick on a timer, step inbound messages, submit proposals,
//! and drain `Ready` (persist, send, apply, advance).  HTTP handlers talk to
//! it through a cloneable [`NodeHandle`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use protobuf::Message as PbMessage;
use raft::eraftpb::{Entry, EntryType, Message};
use raft::RawNode;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bootstrap::Bootstrapped;
use crate::cluster::Cluster;
use crate::consensus::NodeStorage;
use crate::errors::ApiError;
use crate::metrics::{
    ENTRIES_APPLIED_TOTAL, HAS_LEADER, PEER_MESSAGES_SENT_TOTAL, PROPOSALS_TOTAL,
    SNAPSHOTS_SAVED_TOTAL,
};
use crate::storage::snap::{SnapError, Snapshot, Snapshotter};
use crate::storage::wal::{Wal, WalError};
use crate::store::{Event, Op, Request, Store, StoreError};

/// Interval between raft ticks.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

const CHANNEL_CAPACITY: usize = 1024;

/// Errors that stop the node server.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("consensus error: {0}")]
    Raft(#[from] raft::Error),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Snapshot(#[from] SnapError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("snapshot at index {0} from leader carries no store data")]
    EmptySnapshot(u64),
}

struct Proposal {
    request: Request,
    reply: oneshot::Sender<Result<Event, ApiError>>,
}

/// Cloneable handle used by HTTP handlers.
#[derive(Clone)]
pub struct NodeHandle {
    id: u64,
    proposals: mpsc::Sender<Proposal>,
    messages: mpsc::Sender<Message>,
    store: Arc<Store>,
    cluster: Arc<Cluster>,
    leader: Arc<AtomicU64>,
    timeout: Duration,
}

impl NodeHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Current leader id, or 0 if unknown.
    pub fn leader(&self) -> u64 {
        self.leader.load(Ordering::Relaxed)
    }

    /// Replicate `op` and wait until it has been applied locally.
    pub async fn propose(&self, op: Op) -> Result<Event, ApiError> {
        let (reply, rx) = oneshot::channel();
        let request = Request {
            id: rand::random(),
            op,
        };
        self.proposals
            .send(Proposal { request, reply })
            .await
            .map_err(|_| stopped())?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(stopped()),
            Err(_) => {
                counter!(PROPOSALS_TOTAL, "outcome" => "timeout").increment(1);
                Err(ApiError::Timeout)
            }
        }
    }

    /// Hand an inbound peer message to the engine.
    pub async fn step(&self, msg: Message) -> Result<(), ApiError> {
        self.messages.send(msg).await.map_err(|_| stopped())
    }
}

fn stopped() -> ApiError {
    ApiError::Unavailable {
        message: "node is not running".into(),
    }
}

/// Delivers outbound consensus messages over HTTP.
#[derive(Clone)]
pub struct PeerSender {
    client: reqwest::Client,
    cluster: Arc<Cluster>,
}

impl PeerSender {
    pub fn new(client: reqwest::Client, cluster: Arc<Cluster>) -> Self {
        Self { client, cluster }
    }

    /// Fire-and-forget: raft retransmits on its own.
    fn send(&self, msgs: Vec<Message>) {
        for msg in msgs {
            let Some(url) = self
                .cluster
                .find_id(msg.to)
                .and_then(|m| m.peer_urls.first())
                .map(|u| format!("{}/raft", u.trim_end_matches('/')))
            else {
                warn!(to = %format!("{:016x}", msg.to), "No peer URL for message recipient");
                continue;
            };
            let body = match msg.write_to_bytes() {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "Cannot encode consensus message");
                    continue;
                }
            };
            let client = self.client.clone();
            tokio::spawn(async move {
                let status = match client
                    .post(&url)
                    .header("content-type", "application/protobuf")
                    .body(body)
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => "ok",
                    Ok(resp) => {
                        debug!(%url, status = %resp.status(), "Peer rejected message");
                        "rejected"
                    }
                    Err(e) => {
                        debug!(%url, error = %e, "Cannot reach peer");
                        "unreachable"
                    }
                };
                counter!(PEER_MESSAGES_SENT_TOTAL, "status" => status).increment(1);
            });
        }
    }
}

/// Owner of the running consensus participant.
pub struct NodeServer {
    raw: RawNode<NodeStorage>,
    wal: Wal,
    snapshotter: Snapshotter,
    store: Arc<Store>,
    sender: PeerSender,
    peers: Vec<u64>,
    snapshot_count: u64,
    applied_index: u64,
    snapshot_index: u64,
    waiters: HashMap<u64, oneshot::Sender<Result<Event, ApiError>>>,
    proposals: mpsc::Receiver<Proposal>,
    messages: mpsc::Receiver<Message>,
    leader: Arc<AtomicU64>,
}

impl NodeServer {
    /// Take ownership of the bootstrapped state and the engine built from it.
    pub fn new(
        boot: Bootstrapped,
        raw: RawNode<NodeStorage>,
        sender: PeerSender,
        snapshot_count: u64,
        timeout: Duration,
    ) -> (Self, NodeHandle) {
        let (proposal_tx, proposals) = mpsc::channel(CHANNEL_CAPACITY);
        let (message_tx, messages) = mpsc::channel(CHANNEL_CAPACITY);
        let leader = Arc::new(AtomicU64::new(0));
        let applied = boot.initial.applied();

        let handle = NodeHandle {
            id: boot.self_id,
            proposals: proposal_tx,
            messages: message_tx,
            store: boot.store.clone(),
            cluster: Arc::new(boot.cluster.clone()),
            leader: leader.clone(),
            timeout,
        };
        let server = Self {
            raw,
            wal: boot.wal,
            snapshotter: boot.snapshotter,
            store: boot.store,
            sender,
            peers: boot.initial.peers().to_vec(),
            snapshot_count,
            applied_index: applied,
            snapshot_index: applied,
            waiters: HashMap::new(),
            proposals,
            messages,
            leader,
        };
        (server, handle)
    }

    /// Drive the engine until every handle is dropped or an error occurs.
    pub async fn run(mut self) -> Result<(), NodeError> {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.raw.tick();
                    self.waiters.retain(|_, reply| !reply.is_closed());
                }
                proposal = self.proposals.recv() => match proposal {
                    Some(proposal) => self.propose(proposal),
                    None => return Ok(()),
                },
                Some(msg) = self.messages.recv() => {
                    if let Err(e) = self.raw.step(msg) {
                        debug!(error = %e, "Dropping peer message");
                    }
                }
            }
            self.on_ready()?;
        }
    }

    fn propose(&mut self, proposal: Proposal) {
        let Proposal { request, reply } = proposal;
        let data = match serde_json::to_vec(&request) {
            Ok(data) => data,
            Err(e) => {
                let _ = reply.send(Err(ApiError::Internal(e.into())));
                return;
            }
        };
        match self.raw.propose(vec![], data) {
            Ok(()) => {
                counter!(PROPOSALS_TOTAL, "outcome" => "submitted").increment(1);
                self.waiters.insert(request.id, reply);
            }
            Err(e) => {
                counter!(PROPOSALS_TOTAL, "outcome" => "dropped").increment(1);
                let _ = reply.send(Err(ApiError::Unavailable {
                    message: format!("proposal dropped: {e}"),
                }));
            }
        }
    }

    fn on_ready(&mut self) -> Result<(), NodeError> {
        if !self.raw.has_ready() {
            return Ok(());
        }
        let mut ready = self.raw.ready();

        if let Some(ss) = ready.ss() {
            self.leader.store(ss.leader_id, Ordering::Relaxed);
            gauge!(HAS_LEADER).set(if ss.leader_id == 0 { 0.0 } else { 1.0 });
        }

        // Leaders may send before persisting.
        if !ready.messages().is_empty() {
            self.sender.send(ready.take_messages());
        }

        if *ready.snapshot() != raft::eraftpb::Snapshot::default() {
            self.apply_snapshot(ready.snapshot().clone())?;
        }

        self.apply_committed(ready.take_committed_entries())?;

        let hard_state = ready.hs().cloned().unwrap_or_default();
        self.wal.save(&hard_state, ready.entries())?;
        if !ready.entries().is_empty() {
            self.raw.raft.raft_log.store.wl().append(ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            self.raw.raft.raft_log.store.wl().set_hardstate(hs.clone());
        }

        if !ready.persisted_messages().is_empty() {
            self.sender.send(ready.take_persisted_messages());
        }

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.raw.raft.raft_log.store.wl().mut_hard_state().commit = commit;
            self.wal.save(&self.raw.raft.hard_state(), &[])?;
        }
        self.sender.send(light.take_messages());
        self.apply_committed(light.take_committed_entries())?;
        self.raw.advance_apply();

        self.maybe_snapshot()
    }

    /// Install a snapshot received from the leader and persist it, so a
    /// restart resumes from it rather than from the log alone.
    fn apply_snapshot(&mut self, snap: raft::eraftpb::Snapshot) -> Result<(), NodeError> {
        let meta = snap.get_metadata();
        let index = meta.index;
        if snap.data.is_empty() {
            return Err(NodeError::EmptySnapshot(index));
        }
        let saved = Snapshot {
            index,
            term: meta.term,
            nodes: meta.get_conf_state().voters.clone(),
            data: snap.data.to_vec(),
        };
        self.store.recovery(&saved.data)?;
        self.raw.raft.raft_log.store.wl().apply_snapshot(snap)?;
        let path = self.snapshotter.save(&saved)?;
        self.set_applied(index);
        self.snapshot_index = index;
        counter!(SNAPSHOTS_SAVED_TOTAL).increment(1);
        info!(index, file = %path.display(), "Applied snapshot from leader");
        Ok(())
    }

    fn set_applied(&mut self, index: u64) {
        self.applied_index = index;
        self.raw.raft.raft_log.store.set_applied(index);
    }

    fn apply_committed(&mut self, entries: Vec<Entry>) -> Result<(), NodeError> {
        for entry in entries {
            self.set_applied(entry.index);
            if entry.data.is_empty() {
                // Empty entry appended by a new leader.
                continue;
            }
            if entry.get_entry_type() != EntryType::EntryNormal {
                debug!(index = entry.index, "Ignoring configuration change entry");
                continue;
            }
            let request: Request = match serde_json::from_slice(&entry.data) {
                Ok(request) => request,
                Err(e) => {
                    warn!(index = entry.index, error = %e, "Skipping undecodable entry");
                    continue;
                }
            };
            let result = self.store.apply(entry.index, &request.op);
            counter!(ENTRIES_APPLIED_TOTAL).increment(1);
            if let Some(reply) = self.waiters.remove(&request.id) {
                let _ = reply.send(result.map_err(ApiError::from));
            }
        }
        Ok(())
    }

    fn maybe_snapshot(&mut self) -> Result<(), NodeError> {
        if self.applied_index.saturating_sub(self.snapshot_index) < self.snapshot_count {
            return Ok(());
        }
        let index = self.applied_index;
        let snap = Snapshot {
            index,
            term: self.raw.raft.raft_log.term(index)?,
            nodes: self.peers.clone(),
            data: self.store.save()?,
        };
        let path = self.snapshotter.save(&snap)?;
        self.snapshot_index = index;
        counter!(SNAPSHOTS_SAVED_TOTAL).increment(1);
        info!(index, file = %path.display(), "Saved snapshot");
        Ok(())
    }
}
