//! Consensus engine initialization.
//!
//! The engine is raft-rs's [`RawNode`] over [`NodeStorage`], a
//! [`MemStorage`] whose snapshots carry the store's serialized state.  It
//! is created exactly once per process, either from nothing
//! ([`InitialState::Start`]) or from what the log and snapshot recorded
//! ([`InitialState::Restart`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLockWriteGuard};

use raft::eraftpb::{ConfState, Entry, HardState};
use raft::storage::{MemStorage, MemStorageCore};
use raft::{GetEntriesContext, RaftState, RawNode, Storage, StorageError};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::snap::Snapshot;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Raft(#[from] raft::Error),

    #[error("hard state commit {commit} is beyond last log index {last_index}")]
    InvalidHardState { commit: u64, last_index: u64 },
}

/// Fixed election and heartbeat intervals, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub election_tick: usize,
    pub heartbeat_tick: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            election_tick: 10,
            heartbeat_tick: 1,
        }
    }
}

/// The reconciled state handed to the engine.
#[derive(Debug, Clone)]
pub enum InitialState {
    /// Brand-new participant with no history.
    Start { id: u64, peers: Vec<u64> },
    /// Resume from persisted state.  `entries` start right after the
    /// snapshot (or at index 1 without one).
    Restart {
        id: u64,
        peers: Vec<u64>,
        snapshot: Option<Snapshot>,
        hard_state: HardState,
        entries: Vec<Entry>,
    },
}

impl InitialState {
    pub fn id(&self) -> u64 {
        match self {
            InitialState::Start { id, .. } | InitialState::Restart { id, .. } => *id,
        }
    }

    pub fn peers(&self) -> &[u64] {
        match self {
            InitialState::Start { peers, .. } | InitialState::Restart { peers, .. } => peers,
        }
    }

    /// Index the store has already applied up to.
    pub fn applied(&self) -> u64 {
        match self {
            InitialState::Restart {
                snapshot: Some(snap),
                ..
            } => snap.index,
            _ => 0,
        }
    }
}

/// Raft log storage backed by memory.  Snapshots handed to lagging
/// followers are cut from the store at the last applied index.
pub struct NodeStorage {
    mem: MemStorage,
    store: Arc<Store>,
    applied: AtomicU64,
}

impl NodeStorage {
    pub fn new(mem: MemStorage, store: Arc<Store>, applied: u64) -> Self {
        Self {
            mem,
            store,
            applied: AtomicU64::new(applied),
        }
    }

    pub fn wl(&self) -> RwLockWriteGuard<'_, MemStorageCore> {
        self.mem.wl()
    }

    /// Record that the store now reflects every entry up to `index`.
    pub fn set_applied(&self, index: u64) {
        self.applied.store(index, Ordering::Release);
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }
}

impl Storage for NodeStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<raft::eraftpb::Snapshot> {
        let applied = self.applied();
        if applied < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        let data = self
            .store
            .save()
            .map_err(|e| raft::Error::Store(StorageError::Other(Box::new(e))))?;

        let mut snap = raft::eraftpb::Snapshot::default();
        snap.data = data.into();
        let meta = snap.mut_metadata();
        meta.index = applied;
        meta.term = self.mem.term(applied)?;
        *meta.mut_conf_state() = self.mem.initial_state()?.conf_state;
        debug!(index = applied, to = %format!("{to:016x}"), "Serving snapshot");
        Ok(snap)
    }
}

/// Build the engine from `initial`, snapshotting out of `store`.
pub fn initialize(
    initial: InitialState,
    tuning: Tuning,
    store: Arc<Store>,
) -> Result<RawNode<NodeStorage>, ConsensusError> {
    let config = raft::Config {
        id: initial.id(),
        election_tick: tuning.election_tick,
        heartbeat_tick: tuning.heartbeat_tick,
        applied: initial.applied(),
        ..Default::default()
    };
    config.validate()?;

    let mem = match initial {
        InitialState::Start { id, peers } => {
            info!(id = %format!("{id:016x}"), members = peers.len(), "Starting consensus");
            MemStorage::new_with_conf_state(ConfState::from((peers, Vec::<u64>::new())))
        }
        InitialState::Restart {
            id,
            peers,
            snapshot,
            hard_state,
            entries,
        } => {
            info!(
                id = %format!("{id:016x}"),
                snapshot_index = snapshot.as_ref().map_or(0, |s| s.index),
                entries = entries.len(),
                commit = hard_state.commit,
                "Restarting consensus"
            );
            restore(peers, snapshot, hard_state, &entries)?
        }
    };

    let storage = NodeStorage::new(mem, store, config.applied);
    Ok(RawNode::new(&config, storage, &raft::default_logger())?)
}

fn restore(
    peers: Vec<u64>,
    snapshot: Option<Snapshot>,
    mut hard_state: HardState,
    entries: &[Entry],
) -> Result<MemStorage, ConsensusError> {
    let storage = MemStorage::new();
    let (snap_index, snap_term) = snapshot.as_ref().map_or((0, 0), |s| (s.index, s.term));
    {
        let mut core = storage.wl();
        match snapshot {
            Some(snap) => {
                let mut raft_snap = raft::eraftpb::Snapshot::default();
                let meta = raft_snap.mut_metadata();
                meta.index = snap.index;
                meta.term = snap.term;
                *meta.mut_conf_state() = ConfState::from((peers, Vec::<u64>::new()));
                core.apply_snapshot(raft_snap)?;
            }
            None => core.set_conf_state(ConfState::from((peers, Vec::<u64>::new()))),
        }

        if !entries.is_empty() {
            core.append(entries)?;
        }

        if hard_state != HardState::default() {
            let last_index = entries.last().map_or(snap_index, |e| e.index);
            hard_state.commit = hard_state.commit.max(snap_index);
            hard_state.term = hard_state.term.max(snap_term);
            if hard_state.commit > last_index {
                return Err(ConsensusError::InvalidHardState {
                    commit: hard_state.commit,
                    last_index,
                });
            }
            core.set_hardstate(hard_state);
        }
    }
    Ok(storage)
}
