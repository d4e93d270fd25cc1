use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use nimbus_core::raft::MemoryRaft;
use nimbus_core::types::Peer;
use nimbus_core::PartitionId;

use crate::applied::PeerClient;
use crate::extent::MemoryExtentStore;
use crate::meta::CreateType;
use crate::partition::{ReplicaConfig, ReplicaPartition};

pub const LOCAL: &str = "127.0.0.1:17310";
pub const PEER_B: &str = "127.0.0.2:17310";
pub const PEER_C: &str = "127.0.0.3:17310";

/// A peer client answering from canned state, recording every broadcast.
#[derive(Default)]
pub struct FakePeerClient {
    applied: Mutex<HashMap<String, u64>>,
    sizes: Mutex<HashMap<String, (u64, u64)>>,
    broadcasts: Mutex<Vec<(String, u64)>>,
    fail_addrs: Mutex<HashSet<String>>,
}

impl FakePeerClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_applied(&self, addr: &str, applied_id: u64) {
        self.applied.lock().insert(addr.to_string(), applied_id);
    }

    pub fn set_size(&self, addr: &str, max_extent_id: u64, size: u64) {
        self.sizes.lock().insert(addr.to_string(), (max_extent_id, size));
    }

    pub fn set_fail(&self, addr: &str) {
        self.fail_addrs.lock().insert(addr.to_string());
    }

    pub fn clear_fail(&self, addr: &str) {
        self.fail_addrs.lock().remove(addr);
    }

    /// Every `(addr, min)` broadcast so far, in order.
    pub fn broadcasts(&self) -> Vec<(String, u64)> {
        self.broadcasts.lock().clone()
    }

    fn check_fail(&self, addr: &str) -> Result<()> {
        if self.fail_addrs.lock().contains(addr) {
            bail!("injected peer failure for {}", addr);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerClient for FakePeerClient {
    async fn get_applied_id(&self, addr: &str, _partition_id: PartitionId) -> Result<u64> {
        self.check_fail(addr)?;
        match self.applied.lock().get(addr) {
            Some(applied_id) => Ok(*applied_id),
            None => bail!("no canned applied id for {}", addr),
        }
    }

    async fn broadcast_min_applied_id(&self, addr: &str, _partition_id: PartitionId, min_applied_id: u64) -> Result<()> {
        self.check_fail(addr)?;
        self.broadcasts.lock().push((addr.to_string(), min_applied_id));
        Ok(())
    }

    async fn get_partition_size(&self, addr: &str, _partition_id: PartitionId, _extent_id: u64) -> Result<u64> {
        self.check_fail(addr)?;
        match self.sizes.lock().get(addr) {
            Some((_, size)) => Ok(*size),
            None => bail!("no canned size for {}", addr),
        }
    }

    async fn get_max_extent_id_and_partition_size(&self, addr: &str, _partition_id: PartitionId) -> Result<(u64, u64)> {
        self.check_fail(addr)?;
        match self.sizes.lock().get(addr) {
            Some(pair) => Ok(*pair),
            None => bail!("no canned size for {}", addr),
        }
    }
}

/// Build a three-replica partition rooted at `dir` with this node leading.
pub fn three_replica_partition(id: PartitionId, dir: &Path, create_type: CreateType) -> (Arc<ReplicaPartition>, Arc<MemoryRaft>, Arc<MemoryExtentStore>) {
    let raft = MemoryRaft::new(1);
    let extents = MemoryExtentStore::new();
    let hosts = vec![LOCAL.to_string(), PEER_B.to_string(), PEER_C.to_string()];
    let peers = hosts.iter().enumerate().map(|(idx, addr)| Peer::new(idx as u64 + 1, addr.clone())).collect();
    let partition = ReplicaPartition::new(
        id,
        "v",
        LOCAL,
        1,
        dir.to_path_buf(),
        ReplicaConfig {
            hosts,
            peers,
            learners: vec![],
            create_type,
            inode_range: None,
        },
        raft.clone(),
        extents.clone(),
    );
    (partition, raft, extents)
}
