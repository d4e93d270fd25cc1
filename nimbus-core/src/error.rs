//! NimbusFS error abstractions.

use thiserror::Error;

use crate::{NodeId, PartitionId};

/// Cluster error variants.
///
/// These are the failure kinds surfaced by the replica-set controller and
/// its collaborators. Transient kinds (`RpcFailed`, `NoEligibleTarget`) are
/// retried by the recovery loop on its next tick; the rest are surfaced to
/// the operator and never retried automatically.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A membership change would leave fewer than a majority of voters alive.
    #[error("partition {partition}: removing {addr} would break quorum")]
    QuorumWouldBreak { partition: PartitionId, addr: String },
    /// The topology could not produce a replacement target.
    #[error("no eligible target node for partition {partition}")]
    NoEligibleTarget { partition: PartitionId },
    /// Fewer writable nodes exist than were requested, after all fallbacks.
    #[error("insufficient capacity: wanted {want} nodes, found {found}")]
    InsufficientCapacity { want: usize, found: usize },
    /// The address is already a member of the partition's replica set.
    #[error("partition {partition} already contains host {addr}")]
    AlreadyMember { partition: PartitionId, addr: String },
    /// The address is not a member of the partition's replica set.
    #[error("partition {partition} does not contain {addr}")]
    NotMember { partition: PartitionId, addr: String },
    /// A remote admin task could not be delivered to any candidate.
    #[error("rpc to partition {partition} failed: {detail}")]
    RpcFailed { partition: PartitionId, detail: String },
    /// The master's own consensus group rejected the command.
    #[error("journal submit failed: {0}")]
    JournalFailed(String),
    /// Another offline operation holds the partition's offline slot.
    #[error("partition {partition}: peer {peer_id} is already being taken offline")]
    ConcurrentOfflineInProgress { partition: PartitionId, peer_id: NodeId },
    /// A mutation would break a structural invariant of the data model.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// The local master is not the raft leader; sweepers no-op on this.
    #[error("this node is not the raft leader")]
    NotLeader,
    /// The subsystem has not finished restoring state.
    #[error("the cluster state is not ready")]
    NotReady,
    /// The requested object does not exist.
    #[error("unknown {kind} {key}")]
    NotFound { kind: &'static str, key: String },
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = std::result::Result<T, ShutdownError>;
