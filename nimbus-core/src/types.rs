//! The shared data model of the cluster.

use serde::{Deserialize, Serialize};

use crate::{NodeId, PartitionId};

/// The identity tuple used by the consensus layer.
///
/// The peer list of a partition is the authoritative voting set; hosts and
/// peers are maintained position-wise in lockstep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub addr: String,
}

impl Peer {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self { id, addr: addr.into() }
    }
}

/// A non-voting member which tails the log and may be promoted once its
/// applied progress crosses the configured threshold.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Learner {
    pub id: NodeId,
    pub addr: String,
    pub auto_promote: bool,
    /// Promotion watermark, percent of the leader's applied progress.
    pub promote_threshold: u8,
}

impl Learner {
    pub fn new(id: NodeId, addr: impl Into<String>, auto_promote: bool, promote_threshold: u8) -> Self {
        Self {
            id,
            addr: addr.into(),
            auto_promote,
            promote_threshold,
        }
    }

    /// The peer identity of this learner.
    pub fn as_peer(&self) -> Peer {
        Peer::new(self.id, self.addr.clone())
    }
}

/// Partition availability status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    #[default]
    Unknown,
    Readonly,
    Writable,
    Unavailable,
}

/// The role of a node within the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Data,
    Meta,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Meta => write!(f, "meta"),
        }
    }
}

/// A per-partition status report carried inside a node heartbeat.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartitionReport {
    pub partition_id: PartitionId,
    pub vol_name: String,
    pub is_leader: bool,
    pub status: PartitionStatus,
    pub used: u64,
    pub total: u64,
    pub applied_id: u64,
    pub disk_path: String,
    /// Metadata partitions only.
    pub max_inode_id: u64,
    pub inode_count: u64,
    pub dentry_count: u64,
}

/// A node heartbeat report.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub addr: String,
    pub zone_name: String,
    pub used: u64,
    pub total: u64,
    pub partition_reports: Vec<PartitionReport>,
}

/// The response to a load-partition task issued against a metadata replica.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetaLoadResponse {
    pub addr: String,
    /// False while the replica is still restoring; comparisons are skipped
    /// unless every replica reports true.
    pub do_compare: bool,
    pub applied_id: u64,
    pub max_inode_id: u64,
    pub inode_count: u64,
    pub dentry_count: u64,
}

/// The response to a load-partition task issued against a data replica.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DataLoadResponse {
    pub addr: String,
    pub do_compare: bool,
    pub applied_id: u64,
    pub used: u64,
    /// CRC32 per extent file, keyed by extent ID.
    pub extent_crcs: std::collections::BTreeMap<u64, u32>,
}
