//! The partition registry.
//!
//! The canonical in-memory copy of every data and meta partition, indexed by
//! partition ID and by owning volume, plus the bad-partition index consumed
//! by the recovery sweeper. Every mutation of a partition's membership runs
//! persist-then-apply: the mutated snapshot is journaled first, and only on
//! success are the in-memory fields swapped under the partition's lock.

#[cfg(test)]
mod mod_test;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use nimbus_core::types::{Learner, PartitionStatus, Peer};
use nimbus_core::{ClusterError, PartitionId, VolumeId};

/// The two flavors of partition managed by the master.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionKind {
    Data,
    Meta,
}

/// Live bookkeeping for one replica of a partition, fed by heartbeats.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReplicaMeta {
    pub addr: String,
    pub disk_path: String,
    pub is_leader: bool,
    pub status: PartitionStatus,
    pub used: u64,
    pub total: u64,
    pub applied_id: u64,
    /// Metadata partitions only.
    pub max_inode_id: u64,
    pub inode_count: u64,
    pub dentry_count: u64,
    /// Unix seconds of the last report carrying this replica.
    pub last_report: i64,
}

/// The mutable membership and progress state of a partition.
#[derive(Clone, Debug, Default)]
pub struct PartitionState {
    pub hosts: Vec<String>,
    pub peers: Vec<Peer>,
    pub learners: Vec<Learner>,
    pub status: PartitionStatus,
    pub is_recovering: bool,
    /// The peer currently being removed; `0` when idle.
    pub offline_peer_id: u64,
    pub replicas: Vec<ReplicaMeta>,
    pub applied_id: u64,
    pub min_applied_id: u64,
    pub max_applied_id: u64,
    pub last_truncate_id: u64,
    /// Observed max inode ID across replicas (meta partitions).
    pub max_inode_id: u64,
    /// Extents whose replica CRCs diverge, keyed by extent ID with the
    /// unix seconds at which the divergence was first observed.
    pub files_with_missing_replica: HashMap<u64, i64>,
}

/// A partition of a volume, replicated N ways via a consensus group.
pub struct Partition {
    pub id: PartitionId,
    pub vol_id: VolumeId,
    pub vol_name: String,
    pub kind: PartitionKind,
    pub replica_num: u8,
    /// Inode range `[start, end)`; zero for data partitions.
    pub inode_start: u64,
    pub inode_end: u64,

    state: RwLock<PartitionState>,
    /// Serializes offline (remove-member) operations on this partition.
    pub offline_mutex: tokio::sync::Mutex<()>,
}

impl Partition {
    pub fn new(id: PartitionId, vol_id: VolumeId, vol_name: impl Into<String>, kind: PartitionKind, replica_num: u8) -> Self {
        Self {
            id,
            vol_id,
            vol_name: vol_name.into(),
            kind,
            replica_num,
            inode_start: 0,
            inode_end: 0,
            state: RwLock::new(PartitionState::default()),
            offline_mutex: tokio::sync::Mutex::new(()),
        }
    }

    pub fn new_meta(
        id: PartitionId, vol_id: VolumeId, vol_name: impl Into<String>, replica_num: u8, inode_start: u64, inode_end: u64,
    ) -> Self {
        let mut partition = Self::new(id, vol_id, vol_name, PartitionKind::Meta, replica_num);
        partition.inode_start = inode_start;
        partition.inode_end = inode_end;
        partition
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PartitionState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PartitionState> {
        self.state.write()
    }

    pub fn contains_host(&self, addr: &str) -> bool {
        self.state.read().hosts.iter().any(|host| host == addr)
    }

    /// The address of this partition's raft leader, per the latest reports.
    pub fn leader_addr(&self) -> Option<String> {
        self.state
            .read()
            .replicas
            .iter()
            .find(|replica| replica.is_leader)
            .map(|replica| replica.addr.clone())
    }

    /// Find the peer registered for the given address.
    pub fn peer_of(&self, addr: &str) -> Result<Peer, ClusterError> {
        self.state
            .read()
            .peers
            .iter()
            .find(|peer| peer.addr == addr)
            .cloned()
            .ok_or_else(|| ClusterError::NotMember {
                partition: self.id,
                addr: addr.to_string(),
            })
    }

    /// Swap in new membership, enforcing the structural invariants.
    ///
    /// Callers must have journaled the new membership already; this is the
    /// apply half of persist-then-apply.
    pub fn apply_membership(&self, hosts: Vec<String>, peers: Vec<Peer>, learners: Vec<Learner>) -> Result<(), ClusterError> {
        validate_membership(&hosts, &peers, &learners)?;
        let mut state = self.state.write();
        state.replicas.retain(|replica| hosts.iter().any(|host| host == &replica.addr));
        state.hosts = hosts;
        state.peers = peers;
        state.learners = learners;
        Ok(())
    }

    /// Record a replica report, replacing any prior report for its address.
    pub fn update_replica(&self, meta: ReplicaMeta) {
        let mut state = self.state.write();
        if meta.is_leader {
            for replica in state.replicas.iter_mut() {
                replica.is_leader = false;
            }
        }
        if meta.max_inode_id > state.max_inode_id {
            state.max_inode_id = meta.max_inode_id;
        }
        if let Some(existing) = state.replicas.iter_mut().find(|replica| replica.addr == meta.addr) {
            *existing = meta;
        } else {
            state.replicas.push(meta);
        }
    }

    /// Drop replica reports which have not been refreshed within `timeout`.
    pub fn prune_stale_replicas(&self, now: i64, timeout: i64) {
        let mut state = self.state.write();
        state.replicas.retain(|replica| now.saturating_sub(replica.last_report) <= timeout);
    }

    /// Spread of used bytes across replicas (data partitions).
    pub fn used_spread(&self) -> u64 {
        let state = self.state.read();
        let min = state.replicas.iter().map(|replica| replica.used).min().unwrap_or(0);
        let max = state.replicas.iter().map(|replica| replica.used).max().unwrap_or(0);
        max.saturating_sub(min)
    }

    /// Spread of max inode IDs across replicas (meta partitions).
    pub fn max_inode_spread(&self) -> u64 {
        let state = self.state.read();
        let min = state.replicas.iter().map(|replica| replica.max_inode_id).min().unwrap_or(0);
        let max = state.replicas.iter().map(|replica| replica.max_inode_id).max().unwrap_or(0);
        max.saturating_sub(min)
    }

    /// The zones currently hosting live replicas, excluding `exclude_addr`.
    pub fn live_zones(&self, zone_of: impl Fn(&str) -> Option<String>, exclude_addr: &str) -> Vec<String> {
        let state = self.state.read();
        let mut zones = Vec::new();
        for host in state.hosts.iter().filter(|host| host.as_str() != exclude_addr) {
            if let Some(zone) = zone_of(host) {
                if !zones.contains(&zone) {
                    zones.push(zone);
                }
            }
        }
        zones
    }
}

/// Validate the structural invariants of a proposed membership.
///
/// Hosts and peers must agree position-wise, and every learner must also be
/// present in the host list.
pub fn validate_membership(hosts: &[String], peers: &[Peer], learners: &[Learner]) -> Result<(), ClusterError> {
    if hosts.len() != peers.len() {
        return Err(ClusterError::InvariantViolation(format!(
            "hosts/peers length mismatch: {} hosts, {} peers",
            hosts.len(),
            peers.len()
        )));
    }
    for (host, peer) in hosts.iter().zip(peers.iter()) {
        if host != &peer.addr {
            return Err(ClusterError::InvariantViolation(format!(
                "host {} does not agree with peer {} at the same position",
                host, peer.addr
            )));
        }
    }
    for learner in learners {
        if !hosts.iter().any(|host| host == &learner.addr) {
            return Err(ClusterError::InvariantViolation(format!("learner {} is not a host", learner.addr)));
        }
    }
    Ok(())
}

/// Whether a strict majority of voters survives the removal of one peer.
///
/// `voters` and `learners` describe the membership before the removal; the
/// removed peer is assumed to be a voter. `down_except_victim` counts the
/// currently-down replicas other than the one being removed. For an even
/// replica count the comparison is non-strict.
pub fn quorum_survives_removal(voters: usize, learners: usize, down_except_victim: usize, replica_num: u8) -> bool {
    let voting = voters.saturating_sub(learners);
    let survivors = voting.saturating_sub(1).saturating_sub(down_except_victim);
    let half = (replica_num / 2) as usize;
    if replica_num % 2 == 1 {
        survivors > half
    } else {
        survivors >= half
    }
}

/// In-memory index of every partition, plus the bad-partition index.
#[derive(Default)]
pub struct PartitionRegistry {
    partitions: DashMap<PartitionId, Arc<Partition>>,
    /// Partitions flagged as recovering, keyed by the source address or
    /// disk they are being moved away from. Values are replaced wholesale
    /// on every sweep, never mutated in place.
    bad_partitions: DashMap<String, Vec<PartitionId>>,
}

impl PartitionRegistry {
    pub fn put(&self, partition: Arc<Partition>) {
        self.partitions.insert(partition.id, partition);
    }

    pub fn remove(&self, id: PartitionId) {
        self.partitions.remove(&id);
    }

    pub fn get(&self, id: PartitionId) -> Result<Arc<Partition>, ClusterError> {
        self.partitions.get(&id).map(|p| p.value().clone()).ok_or_else(|| ClusterError::NotFound {
            kind: "partition",
            key: id.to_string(),
        })
    }

    /// Lookup scoped to a volume; rejects IDs owned by other volumes.
    pub fn get_in_vol(&self, vol_id: VolumeId, id: PartitionId) -> Result<Arc<Partition>, ClusterError> {
        let partition = self.get(id)?;
        if partition.vol_id != vol_id {
            return Err(ClusterError::NotFound {
                kind: "partition",
                key: format!("{}/{}", vol_id, id),
            });
        }
        Ok(partition)
    }

    /// Snapshot of all partitions, optionally filtered by kind.
    pub fn all(&self, kind: Option<PartitionKind>) -> Vec<Arc<Partition>> {
        self.partitions
            .iter()
            .filter(|entry| kind.map_or(true, |kind| entry.value().kind == kind))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// All partitions hosting a replica on the given address.
    pub fn partitions_of_node(&self, addr: &str) -> Vec<Arc<Partition>> {
        self.partitions
            .iter()
            .filter(|entry| entry.value().contains_host(addr))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Record a partition as recovering away from the given source.
    pub fn mark_bad(&self, source: impl Into<String>, id: PartitionId) {
        let mut list = self.bad_partitions.entry(source.into()).or_default();
        if !list.contains(&id) {
            // Replace rather than push so concurrent readers of a snapshot
            // never observe a partially-grown list.
            let mut next = list.clone();
            next.push(id);
            *list = next;
        }
    }

    /// Snapshot of the bad-partition index.
    pub fn bad_snapshot(&self) -> Vec<(String, Vec<PartitionId>)> {
        self.bad_partitions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Replace a source's bad list wholesale; an empty list drops the key.
    pub fn replace_bad_list(&self, source: &str, list: Vec<PartitionId>) {
        if list.is_empty() {
            self.bad_partitions.remove(source);
        } else {
            self.bad_partitions.insert(source.to_string(), list);
        }
    }

    pub fn is_bad(&self, source: &str, id: PartitionId) -> bool {
        self.bad_partitions.get(source).map_or(false, |list| list.contains(&id))
    }
}
