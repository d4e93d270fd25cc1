//! The replica-side partition object.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use nimbus_core::raft::RaftGroup;
use nimbus_core::types::{Learner, Peer};
use nimbus_core::PartitionId;

use crate::extent::ExtentStore;
use crate::meta::{self, CreateType, PartitionManifest};

/// Replica membership as known locally.
#[derive(Clone, Debug, Default)]
pub struct ReplicaConfig {
    pub hosts: Vec<String>,
    pub peers: Vec<Peer>,
    pub learners: Vec<Learner>,
    pub create_type: CreateType,
    /// Inode range, meta partitions only.
    pub inode_range: Option<(u64, u64)>,
}

/// One replica of a partition, pinned to this node.
///
/// Owns the applied-ID bookkeeping, the local raft handle, and the stop
/// signals observed by the per-partition daemons.
pub struct ReplicaPartition {
    pub id: PartitionId,
    pub vol_name: String,
    pub local_addr: String,
    pub node_id: u64,
    pub path: PathBuf,
    pub extents: Arc<dyn ExtentStore>,

    config: RwLock<ReplicaConfig>,
    raft: Arc<dyn RaftGroup>,
    raft_started: AtomicBool,

    applied_id: AtomicU64,
    min_applied_id: AtomicU64,
    max_applied_id: AtomicU64,
    last_truncate_id: AtomicU64,

    /// Metadata counters, meta partitions only; fed by the metadata engine.
    pub max_inode_id: AtomicU64,
    pub inode_count: AtomicU64,
    pub dentry_count: AtomicU64,

    stop_tx: broadcast::Sender<()>,
    stop_raft_tx: broadcast::Sender<u64>,
}

impl ReplicaPartition {
    pub fn new(
        id: PartitionId, vol_name: impl Into<String>, local_addr: impl Into<String>, node_id: u64, path: PathBuf,
        config: ReplicaConfig, raft: Arc<dyn RaftGroup>, extents: Arc<dyn ExtentStore>,
    ) -> Arc<Self> {
        let (stop_tx, _) = broadcast::channel(1);
        let (stop_raft_tx, _) = broadcast::channel(8);
        Arc::new(Self {
            id,
            vol_name: vol_name.into(),
            local_addr: local_addr.into(),
            node_id,
            path,
            extents,
            config: RwLock::new(config),
            raft,
            raft_started: AtomicBool::new(false),
            applied_id: AtomicU64::new(0),
            min_applied_id: AtomicU64::new(0),
            max_applied_id: AtomicU64::new(0),
            last_truncate_id: AtomicU64::new(0),
            max_inode_id: AtomicU64::new(0),
            inode_count: AtomicU64::new(0),
            dentry_count: AtomicU64::new(0),
            stop_tx,
            stop_raft_tx,
        })
    }

    pub fn config(&self) -> ReplicaConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: ReplicaConfig) {
        *self.config.write() = config;
    }

    pub fn hosts(&self) -> Vec<String> {
        self.config.read().hosts.clone()
    }

    pub fn set_create_type(&self, create_type: CreateType) {
        self.config.write().create_type = create_type;
    }

    pub fn create_type(&self) -> CreateType {
        self.config.read().create_type
    }

    pub fn applied_id(&self) -> u64 {
        self.applied_id.load(Ordering::SeqCst)
    }

    /// Record log application progress, keeping min/max in bounds.
    pub fn set_applied_id(&self, applied_id: u64) {
        self.applied_id.store(applied_id, Ordering::SeqCst);
        self.max_applied_id.fetch_max(applied_id, Ordering::SeqCst);
    }

    pub fn min_applied_id(&self) -> u64 {
        self.min_applied_id.load(Ordering::SeqCst)
    }

    pub fn set_min_applied_id(&self, min: u64) {
        self.min_applied_id.store(min, Ordering::SeqCst);
    }

    pub fn max_applied_id(&self) -> u64 {
        self.max_applied_id.load(Ordering::SeqCst)
    }

    pub fn set_max_applied_id(&self, max: u64) {
        self.max_applied_id.store(max, Ordering::SeqCst);
    }

    pub fn last_truncate_id(&self) -> u64 {
        self.last_truncate_id.load(Ordering::SeqCst)
    }

    pub fn set_last_truncate_id(&self, id: u64) {
        self.last_truncate_id.store(id, Ordering::SeqCst);
    }

    /// The raft handle, for daemons that truncate or transfer leadership.
    pub fn raft(&self) -> Arc<dyn RaftGroup> {
        self.raft.clone()
    }

    /// Start participating in the consensus group.
    pub fn start_raft(&self) -> Result<()> {
        self.raft_started.store(true, Ordering::SeqCst);
        tracing::debug!(partition = self.id, "raft started");
        Ok(())
    }

    /// Stop the raft instance but keep the partition object resident.
    pub async fn stop_raft(&self) {
        if self.raft_started.swap(false, Ordering::SeqCst) {
            self.raft.stop().await;
            tracing::error!(partition = self.id, "raft instance stopped");
        }
    }

    pub fn is_raft_started(&self) -> bool {
        self.raft_started.load(Ordering::SeqCst)
    }

    pub fn is_raft_leader(&self) -> bool {
        self.is_raft_started() && self.raft.is_leader()
    }

    /// Whether this node is the group's designated primary (first host).
    pub fn is_designated_leader(&self) -> bool {
        self.config.read().hosts.first().map_or(false, |host| host == &self.local_addr)
    }

    /// Subscribe to the partition stop signal.
    pub fn stop_rx(&self) -> broadcast::Receiver<()> {
        self.stop_tx.subscribe()
    }

    /// Subscribe to the stop-raft-for-extent signal.
    pub fn stop_raft_rx(&self) -> broadcast::Receiver<u64> {
        self.stop_raft_tx.subscribe()
    }

    /// Stop the partition and all of its daemons. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Stop the raft instance for a failed extent, keeping the partition.
    pub fn signal_stop_raft(&self, extent_id: u64) {
        let _ = self.stop_raft_tx.send(extent_id);
    }

    /// The manifest describing this replica's current state.
    pub fn manifest(&self) -> PartitionManifest {
        let config = self.config.read();
        PartitionManifest {
            partition_id: self.id,
            vol_name: self.vol_name.clone(),
            hosts: config.hosts.clone(),
            peers: config.peers.clone(),
            learners: config.learners.clone(),
            create_type: config.create_type,
            inode_range: config.inode_range,
            last_truncate_id: self.last_truncate_id(),
        }
    }

    /// Persist the manifest sidecar.
    pub async fn persist_manifest(&self) -> Result<()> {
        let manifest = self.manifest();
        meta::store_manifest(&self.path, &manifest)
            .await
            .with_context(|| format!("error persisting manifest for partition {}", self.id))
    }

    /// Restore applied-ID state from the sidecar files.
    pub async fn load_sidecar(&self) -> Result<()> {
        if let Some(applied_id) = meta::load_applied_id(&self.path).await? {
            self.set_applied_id(applied_id);
        }
        if let Some(manifest) = meta::load_manifest(&self.path).await? {
            self.set_last_truncate_id(manifest.last_truncate_id);
            self.config.write().create_type = manifest.create_type;
        }
        Ok(())
    }

    // Membership mutations applied on behalf of master admin tasks. Each is
    // idempotent: re-applying reports no update.

    /// Add a voting peer; returns whether the config changed.
    pub fn add_raft_node(&self, peer: Peer) -> bool {
        let mut config = self.config.write();
        if config.peers.iter().any(|existing| existing.id == peer.id) {
            return false;
        }
        config.hosts.push(peer.addr.clone());
        config.peers.push(peer);
        true
    }

    /// Remove a peer; returns whether the config changed and whether the
    /// removed peer was this node.
    pub fn remove_raft_node(&self, peer: &Peer) -> (bool, bool) {
        let mut config = self.config.write();
        let before = config.peers.len();
        config.peers.retain(|existing| !(existing.id == peer.id && existing.addr == peer.addr));
        if config.peers.len() == before {
            return (false, false);
        }
        config.hosts.retain(|host| host != &peer.addr);
        config.learners.retain(|learner| !(learner.id == peer.id && learner.addr == peer.addr));
        (true, peer.id == self.node_id)
    }

    /// Add a learner; returns whether the config changed.
    pub fn add_raft_learner(&self, learner: Learner) -> bool {
        let mut config = self.config.write();
        let mut updated = false;
        if !config.peers.iter().any(|existing| existing.id == learner.id) {
            config.hosts.push(learner.addr.clone());
            config.peers.push(learner.as_peer());
            updated = true;
        }
        if !config.learners.iter().any(|existing| existing.id == learner.id) {
            config.learners.push(learner);
            updated = true;
        }
        updated
    }

    /// Promote a learner; returns whether the config changed.
    pub fn promote_raft_learner(&self, peer: &Peer) -> bool {
        let mut config = self.config.write();
        let before = config.learners.len();
        config.learners.retain(|learner| learner.id != peer.id);
        config.learners.len() != before
    }

    /// Overwrite membership from an out-of-band reset.
    pub fn reset_raft_members(&self, peers: Vec<Peer>, learners: Vec<Learner>) {
        let mut config = self.config.write();
        config.hosts = peers.iter().map(|peer| peer.addr.clone()).collect();
        config.peers = peers;
        config.learners = learners;
    }
}
