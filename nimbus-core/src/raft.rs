//! The consensus capability set.
//!
//! The core does not implement consensus; it orchestrates over a consensus
//! primitive offering command submission, membership change, an out-of-band
//! membership reset, leadership transfer, log truncation and a leadership
//! oracle. Everything in the master and the replica daemons is written
//! against [`RaftGroup`] so it can be exercised against [`MemoryRaft`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::{Learner, Peer};
use crate::NodeId;

/// A single membership change applied through consensus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberChange {
    AddPeer(Peer),
    RemovePeer(Peer),
    AddLearner(Learner),
    PromoteLearner(Peer),
}

/// The apply callback invoked for every committed command.
pub type ApplyFn = Arc<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

/// Capabilities the core consumes from the consensus library.
#[async_trait]
pub trait RaftGroup: Send + Sync + 'static {
    /// Submit an opaque command, returning only once it has committed and
    /// been applied locally.
    async fn submit(&self, cmd: Vec<u8>) -> Result<()>;

    /// Drive a single membership change through consensus.
    async fn change_member(&self, change: MemberChange) -> Result<()>;

    /// Out-of-band membership reset; not a consensus operation.
    async fn reset_member(&self, peers: Vec<Peer>) -> Result<()>;

    /// Ask the group to transfer leadership to the given node.
    async fn try_to_leader(&self, target: NodeId) -> Result<()>;

    /// Release log entries up to and including the given applied ID.
    async fn truncate(&self, applied_id: u64) -> Result<()>;

    /// Leadership oracle for the local member.
    fn is_leader(&self) -> bool;

    /// The current `(leader id, term)`; a leader id of `0` means unknown.
    fn leader_term(&self) -> (NodeId, u64);

    /// Stop the local member, keeping its data on disk.
    async fn stop(&self);

    /// Stop the local member and delete its data.
    async fn delete(&self) -> Result<()>;
}

/// An in-memory, single-member consensus group.
///
/// Commands commit immediately and are applied through the registered apply
/// callback, preserving the submit→commit→apply contract. Used by tests and
/// by single-node bootstrap.
pub struct MemoryRaft {
    id: NodeId,
    apply: Mutex<Option<ApplyFn>>,
    log: Mutex<Vec<Vec<u8>>>,
    member_changes: Mutex<Vec<MemberChange>>,
    reset_peers: Mutex<Option<Vec<Peer>>>,
    leader: AtomicU64,
    term: AtomicU64,
    truncated: AtomicU64,
    transfer_target: AtomicU64,
    is_leader: AtomicBool,
    stopped: AtomicBool,
    fail_submits: AtomicBool,
}

impl MemoryRaft {
    pub fn new(id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            id,
            apply: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            member_changes: Mutex::new(Vec::new()),
            reset_peers: Mutex::new(None),
            leader: AtomicU64::new(id),
            term: AtomicU64::new(1),
            truncated: AtomicU64::new(0),
            transfer_target: AtomicU64::new(0),
            is_leader: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            fail_submits: AtomicBool::new(false),
        })
    }

    /// Register the apply callback invoked on every commit.
    pub fn set_apply(&self, apply: ApplyFn) {
        *self.apply.lock() = Some(apply);
    }

    /// Demote or promote the local member.
    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
        if is_leader {
            self.leader.store(self.id, Ordering::SeqCst);
            self.term.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Make every subsequent submit fail, for exercising journal failures.
    pub fn set_fail_submits(&self, fail: bool) {
        self.fail_submits.store(fail, Ordering::SeqCst);
    }

    /// All commands committed so far, in commit order.
    pub fn committed(&self) -> Vec<Vec<u8>> {
        self.log.lock().clone()
    }

    /// All membership changes requested so far.
    pub fn changes(&self) -> Vec<MemberChange> {
        self.member_changes.lock().clone()
    }

    /// The peer set given to the last `reset_member` call, if any.
    pub fn last_reset(&self) -> Option<Vec<Peer>> {
        self.reset_peers.lock().clone()
    }

    /// The watermark of the last truncate call.
    pub fn truncated(&self) -> u64 {
        self.truncated.load(Ordering::SeqCst)
    }

    /// The target of the last leadership-transfer request, `0` if none.
    pub fn transfer_target(&self) -> NodeId {
        self.transfer_target.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RaftGroup for MemoryRaft {
    async fn submit(&self, cmd: Vec<u8>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            bail!("raft group is stopped");
        }
        if self.fail_submits.load(Ordering::SeqCst) {
            bail!("raft group rejected the command");
        }
        let apply = self.apply.lock().clone();
        if let Some(apply) = apply {
            apply(&cmd)?;
        }
        self.log.lock().push(cmd);
        Ok(())
    }

    async fn change_member(&self, change: MemberChange) -> Result<()> {
        self.member_changes.lock().push(change);
        Ok(())
    }

    async fn reset_member(&self, peers: Vec<Peer>) -> Result<()> {
        *self.reset_peers.lock() = Some(peers);
        Ok(())
    }

    async fn try_to_leader(&self, target: NodeId) -> Result<()> {
        self.transfer_target.store(target, Ordering::SeqCst);
        Ok(())
    }

    async fn truncate(&self, applied_id: u64) -> Result<()> {
        self.truncated.store(applied_id, Ordering::SeqCst);
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn leader_term(&self) -> (NodeId, u64) {
        (self.leader.load(Ordering::SeqCst), self.term.load(Ordering::SeqCst))
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn delete(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.log.lock().clear();
        Ok(())
    }
}
