//! The persistent journal.
//!
//! Every cluster-state mutation travels through the master's own consensus
//! group as an opaque [`RaftCmd`]: `submit` marshals the command, hands it
//! to the group, and returns only after commit. The apply callback, invoked
//! on every member of the master group, dispatches on the opcode and writes
//! the applied state into the journal's sled tree; the same stored records
//! are replayed under prefix iterators on startup to rebuild the in-memory
//! registries.
//!
//! Apply is idempotent: re-applying any command (or the whole log) produces
//! the same stored state.

#[cfg(test)]
mod mod_test;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use nimbus_core::raft::RaftGroup;
use nimbus_core::types::{Learner, NodeKind, PartitionStatus, Peer};
use nimbus_core::{ClusterError, NodeId, PartitionId, VolumeId};

use crate::database::Tree;
use crate::error::{ClusterResult, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::partitions::{Partition, PartitionKind, ReplicaMeta};
use crate::topology::Node;
use crate::volumes::Volume;

// Journal opcodes. 1..30 are reserved for cluster-state records.
pub const OP_PUT_CLUSTER: u32 = 1;
pub const OP_ADD_NODE_SET: u32 = 2;
pub const OP_UPDATE_NODE_SET: u32 = 3;
pub const OP_ADD_DATA_NODE: u32 = 4;
pub const OP_UPDATE_DATA_NODE: u32 = 5;
pub const OP_DELETE_DATA_NODE: u32 = 6;
pub const OP_ADD_META_NODE: u32 = 7;
pub const OP_UPDATE_META_NODE: u32 = 8;
pub const OP_DELETE_META_NODE: u32 = 9;
pub const OP_ADD_VOL: u32 = 10;
pub const OP_UPDATE_VOL: u32 = 11;
pub const OP_DELETE_VOL: u32 = 12;
pub const OP_ADD_DATA_PARTITION: u32 = 13;
pub const OP_UPDATE_DATA_PARTITION: u32 = 14;
pub const OP_DELETE_DATA_PARTITION: u32 = 15;
pub const OP_ADD_META_PARTITION: u32 = 16;
pub const OP_UPDATE_META_PARTITION: u32 = 17;
pub const OP_DELETE_META_PARTITION: u32 = 18;
pub const OP_ADD_TOKEN: u32 = 19;
pub const OP_UPDATE_TOKEN: u32 = 20;
pub const OP_DELETE_TOKEN: u32 = 21;
pub const OP_ADD_USER: u32 = 22;
pub const OP_DELETE_USER: u32 = 23;
pub const OP_ALLOC_COMMON_ID: u32 = 24;
pub const OP_ALLOC_DATA_PARTITION_ID: u32 = 25;
pub const OP_ALLOC_META_PARTITION_ID: u32 = 26;
pub const OP_BATCH_PUT: u32 = 27;

// Key prefixes and separator; see the persisted journal format.
pub const KEY_SEPARATOR: &str = ",";
pub const PREFIX_CLUSTER: &str = "#c#";
pub const PREFIX_NODE_SET: &str = "#s#";
pub const PREFIX_DATA_NODE: &str = "#dn#";
pub const PREFIX_META_NODE: &str = "#mn#";
pub const PREFIX_VOL: &str = "#vol#";
pub const PREFIX_DATA_PARTITION: &str = "#dp#";
pub const PREFIX_META_PARTITION: &str = "#mp#";
pub const PREFIX_TOKEN: &str = "#tk#";
pub const PREFIX_USER: &str = "#u#";
pub const PREFIX_ACCESS_KEY: &str = "#ak#";
pub const PREFIX_USER_VOL: &str = "#uv#";
pub const PREFIX_ID: &str = "#id#";

pub const KEY_MAX_COMMON_ID: &str = "#id#common";
pub const KEY_MAX_DATA_PARTITION_ID: &str = "#id#data_partition";
pub const KEY_MAX_META_PARTITION_ID: &str = "#id#meta_partition";
pub const KEY_BATCH_PUT: &str = "batch_put";

/// The journaled unit: an opcode, a structured key, and the value bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftCmd {
    pub op: u32,
    pub k: String,
    pub v: Vec<u8>,
}

impl RaftCmd {
    pub fn new(op: u32, k: impl Into<String>, v: Vec<u8>) -> Self {
        Self { op, k: k.into(), v }
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("error marshaling raft command")
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("error unmarshaling raft command")
    }

    /// Whether this opcode deletes its key rather than writing it.
    fn is_delete(&self) -> bool {
        matches!(
            self.op,
            OP_DELETE_DATA_NODE
                | OP_DELETE_META_NODE
                | OP_DELETE_VOL
                | OP_DELETE_DATA_PARTITION
                | OP_DELETE_META_PARTITION
                | OP_DELETE_TOKEN
                | OP_DELETE_USER
        )
    }
}

/// The journaled form of the cluster-wide settings record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterValue {
    pub name: String,
    pub threshold: f32,
    pub disable_auto_allocate: bool,
    pub data_node_delete_limit_rate: u64,
    pub meta_node_delete_batch_count: u64,
    pub meta_node_delete_worker_sleep_ms: u64,
    pub data_node_auto_repair_limit_rate: u64,
}

/// The journaled form of a node-set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSetValue {
    pub id: u64,
    pub capacity: usize,
    pub zone_name: String,
}

/// The journaled form of a node, data or meta.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeValue {
    pub id: NodeId,
    pub node_set_id: u64,
    pub addr: String,
    pub zone_name: String,
}

impl NodeValue {
    pub fn from_node(node: &Node) -> Self {
        Self {
            id: node.id,
            node_set_id: node.node_set_id(),
            addr: node.addr.clone(),
            zone_name: node.zone_name(),
        }
    }
}

/// Durable replica bookkeeping carried inside a partition record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaValue {
    pub addr: String,
    pub disk_path: String,
}

/// The journaled form of a partition, data or meta.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionValue {
    pub partition_id: PartitionId,
    pub vol_id: VolumeId,
    pub vol_name: String,
    pub replica_num: u8,
    pub status: PartitionStatus,
    pub hosts: Vec<String>,
    pub peers: Vec<Peer>,
    pub learners: Vec<Learner>,
    pub offline_peer_id: u64,
    pub is_recovering: bool,
    /// Inode range, meta partitions only.
    pub start: u64,
    pub end: u64,
    pub replicas: Vec<ReplicaValue>,
}

impl PartitionValue {
    pub fn from_partition(partition: &Partition) -> Self {
        let state = partition.read();
        Self {
            partition_id: partition.id,
            vol_id: partition.vol_id,
            vol_name: partition.vol_name.clone(),
            replica_num: partition.replica_num,
            status: state.status,
            hosts: state.hosts.clone(),
            peers: state.peers.clone(),
            learners: state.learners.clone(),
            offline_peer_id: state.offline_peer_id,
            is_recovering: state.is_recovering,
            start: partition.inode_start,
            end: partition.inode_end,
            replicas: state
                .replicas
                .iter()
                .map(|replica| ReplicaValue {
                    addr: replica.addr.clone(),
                    disk_path: replica.disk_path.clone(),
                })
                .collect(),
        }
    }

    /// Build the record for a proposed membership which has not yet been
    /// applied in memory, for journal-before-memory mutations.
    pub fn from_partition_with(partition: &Partition, hosts: &[String], peers: &[Peer], learners: &[Learner]) -> Self {
        let mut value = Self::from_partition(partition);
        value.hosts = hosts.to_vec();
        value.peers = peers.to_vec();
        value.learners = learners.to_vec();
        value.replicas.retain(|replica| hosts.iter().any(|host| host == &replica.addr));
        value
    }

    /// Rebuild an in-memory partition from this record.
    pub fn into_partition(self, kind: PartitionKind) -> Result<Partition, ClusterError> {
        let partition = match kind {
            PartitionKind::Data => Partition::new(self.partition_id, self.vol_id, self.vol_name, kind, self.replica_num),
            PartitionKind::Meta => Partition::new_meta(self.partition_id, self.vol_id, self.vol_name, self.replica_num, self.start, self.end),
        };
        partition.apply_membership(self.hosts.clone(), self.peers, self.learners)?;
        {
            let mut state = partition.write();
            state.status = self.status;
            state.offline_peer_id = self.offline_peer_id;
            state.is_recovering = self.is_recovering;
        }
        for replica in self.replicas {
            if !self.hosts.iter().any(|host| host == &replica.addr) {
                continue;
            }
            partition.update_replica(ReplicaMeta {
                addr: replica.addr,
                disk_path: replica.disk_path,
                ..Default::default()
            });
        }
        Ok(partition)
    }
}

// Key builders.

pub fn key_cluster(name: &str) -> String {
    format!("{}{}", PREFIX_CLUSTER, name)
}

pub fn key_node_set(id: u64) -> String {
    format!("{}{}", PREFIX_NODE_SET, id)
}

pub fn key_node(kind: NodeKind, id: NodeId, addr: &str) -> String {
    let prefix = match kind {
        NodeKind::Data => PREFIX_DATA_NODE,
        NodeKind::Meta => PREFIX_META_NODE,
    };
    format!("{}{}{}{}", prefix, id, KEY_SEPARATOR, addr)
}

pub fn key_vol(id: VolumeId) -> String {
    format!("{}{}", PREFIX_VOL, id)
}

pub fn key_partition(kind: PartitionKind, vol_id: VolumeId, id: PartitionId) -> String {
    let prefix = match kind {
        PartitionKind::Data => PREFIX_DATA_PARTITION,
        PartitionKind::Meta => PREFIX_META_PARTITION,
    };
    format!("{}{}{}{}", prefix, vol_id, KEY_SEPARATOR, id)
}

pub fn key_token(vol_name: &str, value: &str) -> String {
    format!("{}{}{}{}", PREFIX_TOKEN, vol_name, KEY_SEPARATOR, value)
}

/// The persistent journal over the master's own consensus group.
pub struct Journal {
    raft: Arc<dyn RaftGroup>,
    tree: Tree,
}

impl Journal {
    pub fn new(raft: Arc<dyn RaftGroup>, tree: Tree) -> Arc<Self> {
        Arc::new(Self { raft, tree })
    }

    /// The apply callback, invoked for every committed command.
    ///
    /// Dispatches on the opcode and mutates the stored state; `batch_put`
    /// is applied atomically. Runs on every member of the master group and
    /// is safe to re-run over the same log.
    pub fn apply(&self, data: &[u8]) -> Result<()> {
        let cmd = RaftCmd::unmarshal(data)?;
        self.apply_cmd(&cmd)?;
        self.tree.flush().context(ERR_DB_FLUSH)?;
        Ok(())
    }

    fn apply_cmd(&self, cmd: &RaftCmd) -> Result<()> {
        if cmd.op == OP_BATCH_PUT {
            let cmds: HashMap<String, RaftCmd> = serde_json::from_slice(&cmd.v).context("error decoding batch_put payload")?;
            let mut batch = sled::Batch::default();
            for (key, inner) in cmds {
                if inner.op == OP_BATCH_PUT {
                    bail!("nested batch_put is not allowed");
                }
                if inner.is_delete() {
                    batch.remove(key.as_bytes());
                } else {
                    batch.insert(key.as_bytes(), inner.v.clone());
                }
            }
            self.tree.apply_batch(batch).context("error applying batch_put")?;
            return Ok(());
        }
        if cmd.is_delete() {
            self.tree.remove(cmd.k.as_bytes()).context("error applying journal delete")?;
        } else {
            self.tree.insert(cmd.k.as_bytes(), cmd.v.clone()).context("error applying journal put")?;
        }
        Ok(())
    }

    /// Submit a command through consensus, returning after commit.
    ///
    /// On failure the stored and in-memory state are untouched and the
    /// caller may retry.
    pub async fn submit(&self, cmd: RaftCmd) -> ClusterResult<()> {
        let data = cmd.marshal().map_err(|err| ClusterError::JournalFailed(err.to_string()))?;
        self.raft
            .submit(data)
            .await
            .map_err(|err| ClusterError::JournalFailed(err.to_string()))
    }

    fn marshal_value<T: Serialize>(value: &T) -> ClusterResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|err| ClusterError::JournalFailed(err.to_string()))
    }

    // key=#c#<name>
    pub async fn sync_put_cluster(&self, value: &ClusterValue) -> ClusterResult<()> {
        let v = Self::marshal_value(value)?;
        self.submit(RaftCmd::new(OP_PUT_CLUSTER, key_cluster(&value.name), v)).await
    }

    // key=#s#<id>
    pub async fn sync_add_node_set(&self, value: &NodeSetValue) -> ClusterResult<()> {
        self.put_node_set(OP_ADD_NODE_SET, value).await
    }

    pub async fn sync_update_node_set(&self, value: &NodeSetValue) -> ClusterResult<()> {
        self.put_node_set(OP_UPDATE_NODE_SET, value).await
    }

    async fn put_node_set(&self, op: u32, value: &NodeSetValue) -> ClusterResult<()> {
        let v = Self::marshal_value(value)?;
        self.submit(RaftCmd::new(op, key_node_set(value.id), v)).await
    }

    // key=#dn#<id>,<addr> / #mn#<id>,<addr>
    pub async fn sync_add_node(&self, kind: NodeKind, value: &NodeValue) -> ClusterResult<()> {
        self.put_node(add_node_op(kind), kind, value).await
    }

    pub async fn sync_update_node(&self, kind: NodeKind, value: &NodeValue) -> ClusterResult<()> {
        let op = match kind {
            NodeKind::Data => OP_UPDATE_DATA_NODE,
            NodeKind::Meta => OP_UPDATE_META_NODE,
        };
        self.put_node(op, kind, value).await
    }

    pub async fn sync_delete_node(&self, kind: NodeKind, value: &NodeValue) -> ClusterResult<()> {
        let op = match kind {
            NodeKind::Data => OP_DELETE_DATA_NODE,
            NodeKind::Meta => OP_DELETE_META_NODE,
        };
        self.put_node(op, kind, value).await
    }

    async fn put_node(&self, op: u32, kind: NodeKind, value: &NodeValue) -> ClusterResult<()> {
        let v = Self::marshal_value(value)?;
        self.submit(RaftCmd::new(op, key_node(kind, value.id, &value.addr), v)).await
    }

    // key=#vol#<id>
    pub async fn sync_add_vol(&self, vol: &Volume) -> ClusterResult<()> {
        self.put_vol(OP_ADD_VOL, vol).await
    }

    pub async fn sync_update_vol(&self, vol: &Volume) -> ClusterResult<()> {
        self.put_vol(OP_UPDATE_VOL, vol).await
    }

    pub async fn sync_delete_vol(&self, vol: &Volume) -> ClusterResult<()> {
        self.put_vol(OP_DELETE_VOL, vol).await
    }

    async fn put_vol(&self, op: u32, vol: &Volume) -> ClusterResult<()> {
        let v = Self::marshal_value(vol)?;
        self.submit(RaftCmd::new(op, key_vol(vol.id), v)).await
    }

    // key=#dp#<volid>,<pid> / #mp#<volid>,<pid>
    pub async fn sync_add_partition(&self, partition: &Partition) -> ClusterResult<()> {
        let op = match partition.kind {
            PartitionKind::Data => OP_ADD_DATA_PARTITION,
            PartitionKind::Meta => OP_ADD_META_PARTITION,
        };
        self.put_partition(op, partition).await
    }

    pub async fn sync_update_partition(&self, partition: &Partition) -> ClusterResult<()> {
        let op = match partition.kind {
            PartitionKind::Data => OP_UPDATE_DATA_PARTITION,
            PartitionKind::Meta => OP_UPDATE_META_PARTITION,
        };
        self.put_partition(op, partition).await
    }

    pub async fn sync_delete_partition(&self, partition: &Partition) -> ClusterResult<()> {
        let op = match partition.kind {
            PartitionKind::Data => OP_DELETE_DATA_PARTITION,
            PartitionKind::Meta => OP_DELETE_META_PARTITION,
        };
        self.put_partition(op, partition).await
    }

    async fn put_partition(&self, op: u32, partition: &Partition) -> ClusterResult<()> {
        let value = PartitionValue::from_partition(partition);
        let v = Self::marshal_value(&value)?;
        self.submit(RaftCmd::new(op, key_partition(partition.kind, partition.vol_id, partition.id), v)).await
    }

    /// Journal a partition with a proposed membership, before that
    /// membership is applied in memory. A failure here leaves both the
    /// stored and the in-memory state untouched.
    pub async fn sync_update_partition_with(
        &self, partition: &Partition, hosts: &[String], peers: &[Peer], learners: &[Learner],
    ) -> ClusterResult<()> {
        let op = match partition.kind {
            PartitionKind::Data => OP_UPDATE_DATA_PARTITION,
            PartitionKind::Meta => OP_UPDATE_META_PARTITION,
        };
        let value = PartitionValue::from_partition_with(partition, hosts, peers, learners);
        let v = Self::marshal_value(&value)?;
        self.submit(RaftCmd::new(op, key_partition(partition.kind, partition.vol_id, partition.id), v)).await
    }

    // key=#id#<counter>
    pub async fn sync_alloc_id(&self, key: &str, value: u64) -> ClusterResult<()> {
        let op = match key {
            KEY_MAX_DATA_PARTITION_ID => OP_ALLOC_DATA_PARTITION_ID,
            KEY_MAX_META_PARTITION_ID => OP_ALLOC_META_PARTITION_ID,
            _ => OP_ALLOC_COMMON_ID,
        };
        let v = Self::marshal_value(&value)?;
        self.submit(RaftCmd::new(op, key, v)).await
    }

    /// Submit a map of commands applied atomically by every member.
    pub async fn sync_batch(&self, cmds: HashMap<String, RaftCmd>) -> ClusterResult<()> {
        let v = serde_json::to_vec(&cmds).map_err(|err| ClusterError::JournalFailed(err.to_string()))?;
        self.submit(RaftCmd::new(OP_BATCH_PUT, KEY_BATCH_PUT, v)).await
    }

    /// Iterate all stored records under a key prefix, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry.context(ERR_ITER_FAILURE)?;
            let key = String::from_utf8(key.to_vec()).context("error decoding journal key as utf-8")?;
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }

    /// Read a single stored record.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key.as_bytes()).context("error reading journal state")?.map(|v| v.to_vec()))
    }
}

fn add_node_op(kind: NodeKind) -> u32 {
    match kind {
        NodeKind::Data => OP_ADD_DATA_NODE,
        NodeKind::Meta => OP_ADD_META_NODE,
    }
}
