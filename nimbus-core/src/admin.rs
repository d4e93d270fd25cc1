//! The admin-task RPC envelope.
//!
//! Every command the master issues to a node travels as an [`AdminTask`]:
//! an opcode, the address of the node expected to execute it, and a JSON
//! request payload. Nodes echo the task back with the response payload and
//! a terminal status.

use serde::{Deserialize, Serialize};

use crate::types::{HeartbeatReport, Learner, Peer};
use crate::PartitionId;

/// Terminal status of an admin task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    Created,
    Running,
    Succeeded,
    Failed,
}

/// The command payload of an admin task.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", content = "req")]
pub enum AdminCmd {
    Heartbeat,
    CreateReplica(CreateReplicaRequest),
    DeleteReplica(DeleteReplicaRequest),
    LoadPartition(LoadPartitionRequest),
    AddRaftMember(AddRaftMemberRequest),
    RemoveRaftMember(RemoveRaftMemberRequest),
    ResetRaftMember(ResetRaftMemberRequest),
    AddRaftLearner(AddRaftLearnerRequest),
    PromoteRaftLearner(PromoteRaftLearnerRequest),
    TryToLeader(TryToLeaderRequest),
}

impl AdminCmd {
    /// The partition this command targets; `0` for node-scoped commands.
    pub fn partition_id(&self) -> PartitionId {
        match self {
            Self::Heartbeat => 0,
            Self::CreateReplica(req) => req.partition_id,
            Self::DeleteReplica(req) => req.partition_id,
            Self::LoadPartition(req) => req.partition_id,
            Self::AddRaftMember(req) => req.partition_id,
            Self::RemoveRaftMember(req) => req.partition_id,
            Self::ResetRaftMember(req) => req.partition_id,
            Self::AddRaftLearner(req) => req.partition_id,
            Self::PromoteRaftLearner(req) => req.partition_id,
            Self::TryToLeader(req) => req.partition_id,
        }
    }

    /// A short operation name used in task IDs and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::CreateReplica(_) => "create_replica",
            Self::DeleteReplica(_) => "delete_replica",
            Self::LoadPartition(_) => "load_partition",
            Self::AddRaftMember(_) => "add_raft_member",
            Self::RemoveRaftMember(_) => "remove_raft_member",
            Self::ResetRaftMember(_) => "reset_raft_member",
            Self::AddRaftLearner(_) => "add_raft_learner",
            Self::PromoteRaftLearner(_) => "promote_raft_learner",
            Self::TryToLeader(_) => "try_to_leader",
        }
    }
}

/// The envelope dispatched to a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminTask {
    /// Task ID, unique per (operator, partition, operation).
    pub id: String,
    /// The address of the node expected to execute this task.
    pub operator_addr: String,
    pub cmd: AdminCmd,
    pub status: TaskStatus,
    /// Response payload, JSON-encoded by the executing node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Vec<u8>>,
}

impl AdminTask {
    pub fn new(operator_addr: impl Into<String>, partition_id: PartitionId, cmd: AdminCmd) -> Self {
        let operator_addr = operator_addr.into();
        let id = format!("{}_{}_{}", &operator_addr, partition_id, cmd.name());
        Self {
            id,
            operator_addr,
            cmd,
            status: TaskStatus::Created,
            response: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateReplicaRequest {
    pub partition_id: PartitionId,
    pub vol_name: String,
    pub hosts: Vec<String>,
    pub peers: Vec<Peer>,
    pub learners: Vec<Learner>,
    /// Inode range for metadata partitions, `None` for data partitions.
    pub inode_range: Option<(u64, u64)>,
    pub partition_size: u64,
    /// True when the replica is created to backfill an existing group and
    /// must wait for repair before starting raft.
    pub repair: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeleteReplicaRequest {
    pub partition_id: PartitionId,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LoadPartitionRequest {
    pub partition_id: PartitionId,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddRaftMemberRequest {
    pub partition_id: PartitionId,
    pub add_peer: Peer,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoveRaftMemberRequest {
    pub partition_id: PartitionId,
    pub remove_peer: Peer,
}

/// Out-of-band membership reset, used only when quorum is lost.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResetRaftMemberRequest {
    pub partition_id: PartitionId,
    pub new_peers: Vec<Peer>,
    pub new_learners: Vec<Learner>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddRaftLearnerRequest {
    pub partition_id: PartitionId,
    pub add_learner: Learner,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PromoteRaftLearnerRequest {
    pub partition_id: PartitionId,
    pub promote_peer: Peer,
}

/// Ask a node to transfer its partition's raft leadership to itself.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TryToLeaderRequest {
    pub partition_id: PartitionId,
}

/// The generic task response body.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskResponse {
    pub status: TaskStatus,
    /// Failure detail when `status == Failed`.
    #[serde(default)]
    pub result: String,
}

/// A heartbeat task response body.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: String,
    pub report: HeartbeatReport,
}
