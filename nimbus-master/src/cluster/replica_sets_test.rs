use anyhow::Result;

use nimbus_core::admin::AdminCmd;
use nimbus_core::types::NodeKind;
use nimbus_core::ClusterError;

use crate::fixtures::{test_cluster, TestCluster};
use crate::journal::{PartitionValue, OP_UPDATE_DATA_PARTITION};
use crate::partitions::PartitionKind;

const A: &str = "10.0.0.1:17310";
const B: &str = "10.0.0.2:17310";
const C: &str = "10.0.0.3:17310";
const D: &str = "10.0.0.4:17310";
const E: &str = "10.0.0.5:17310";

async fn three_replica_cluster() -> Result<TestCluster> {
    let harness = test_cluster().await?;
    for addr in [A, B, C, D] {
        harness.add_active_node(NodeKind::Data, addr, "default").await?;
    }
    harness.add_volume(1, "v", 3);
    Ok(harness)
}

#[tokio::test]
async fn test_decommission_under_safe_quorum() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;

    harness.cluster.decommission(&partition, A).await?;

    // Survivor order preserved, replacement appended.
    let state = partition.read();
    assert_eq!(state.hosts, vec![B.to_string(), C.to_string(), D.to_string()]);
    assert_eq!(state.peers.iter().map(|peer| peer.addr.as_str()).collect::<Vec<_>>(), vec![B, C, D]);
    assert!(state.is_recovering, "expected the partition to be flagged recovering");
    drop(state);
    assert!(harness.cluster.partitions.is_bad(A, 1001), "expected the bad index to track the victim");

    // The remote side saw remove-member before add-member, and the new node
    // received a create-replica task.
    let ops = harness.transport.sent_ops();
    let remove_idx = ops.iter().position(|op| *op == "remove_raft_member").expect("missing remove dispatch");
    let add_idx = ops.iter().position(|op| *op == "add_raft_member").expect("missing add dispatch");
    assert!(remove_idx < add_idx, "remove must precede add, got {:?}", ops);
    let (create_addr, _) = harness
        .transport
        .sent()
        .into_iter()
        .find(|(_, task)| matches!(task.cmd, AdminCmd::CreateReplica(_)))
        .expect("missing create-replica dispatch");
    assert_eq!(create_addr, D);

    // The journal ends with a partition update carrying the final state.
    let committed = harness.committed_cmds();
    let last = committed.last().expect("empty journal");
    assert_eq!(last.op, OP_UPDATE_DATA_PARTITION);
    let value: PartitionValue = serde_json::from_slice(&last.v)?;
    assert_eq!(value.hosts, vec![B.to_string(), C.to_string(), D.to_string()]);
    assert!(value.is_recovering);
    assert_eq!(value.offline_peer_id, 0, "offline slot must be released");
    Ok(())
}

#[tokio::test]
async fn test_decommission_refused_when_quorum_would_break() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;
    harness.cluster.topology.node(NodeKind::Data, B)?.set_active(false);

    let journaled_before = harness.raft.committed().len();
    let hosts_before = partition.read().hosts.clone();

    let res = harness.cluster.decommission(&partition, A).await;
    assert!(matches!(res, Err(ClusterError::QuorumWouldBreak { .. })), "expected QuorumWouldBreak, got {:?}", res);

    assert_eq!(partition.read().hosts, hosts_before, "partition must be unchanged");
    assert!(!partition.read().is_recovering);
    assert_eq!(harness.raft.committed().len(), journaled_before, "no journal entry may be produced");
    assert!(!harness.cluster.partitions.is_bad(A, 1001));
    Ok(())
}

#[tokio::test]
async fn test_decommission_rejected_while_recovering() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;
    partition.write().is_recovering = true;

    let res = harness.cluster.decommission(&partition, A).await;
    assert!(matches!(res, Err(ClusterError::InvariantViolation(_))), "expected rejection, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn test_decommission_rejected_while_offline_in_progress() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;
    partition.write().offline_peer_id = 42;

    let res = harness.cluster.decommission(&partition, A).await;
    assert!(matches!(res, Err(ClusterError::ConcurrentOfflineInProgress { peer_id: 42, .. })), "got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn test_add_then_remove_replica_roundtrip() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;
    let (hosts_before, peers_before, learners_before) = {
        let state = partition.read();
        (state.hosts.clone(), state.peers.clone(), state.learners.clone())
    };

    harness.cluster.add_replica(&partition, D).await?;
    assert_eq!(partition.read().hosts.len(), 4);
    harness.cluster.delete_replica(&partition, D, false).await?;

    let state = partition.read();
    assert_eq!(state.hosts, hosts_before);
    assert_eq!(state.peers, peers_before);
    assert_eq!(state.learners, learners_before);
    assert_eq!(state.offline_peer_id, 0);
    Ok(())
}

#[tokio::test]
async fn test_add_replica_rejects_existing_member() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;

    let res = harness.cluster.add_replica(&partition, B).await;
    assert!(matches!(res, Err(ClusterError::AlreadyMember { .. })), "got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn test_promote_learner_not_member() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;

    let res = harness.cluster.promote_learner(&partition, D).await;
    assert!(matches!(res, Err(ClusterError::NotMember { .. })), "got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn test_add_and_promote_learner() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;

    harness.cluster.add_learner(&partition, D, true, 90).await?;
    {
        let state = partition.read();
        assert_eq!(state.hosts.len(), 4);
        assert_eq!(state.peers.len(), 4);
        assert_eq!(state.learners.len(), 1);
        assert_eq!(state.learners[0].addr, D);
        assert!(state.learners[0].auto_promote);
        assert_eq!(state.learners[0].promote_threshold, 90);
    }

    harness.cluster.promote_learner(&partition, D).await?;
    let state = partition.read();
    assert!(state.learners.is_empty(), "expected the learner entry to be dropped on promotion");
    assert_eq!(state.peers.len(), 4, "the peer stays, promotion is learner-list-only");
    Ok(())
}

#[tokio::test]
async fn test_reset_members_on_lost_quorum() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;
    harness.cluster.topology.node(NodeKind::Data, B)?.set_active(false);
    harness.cluster.topology.node(NodeKind::Data, C)?.set_active(false);

    let journaled_before = harness.raft.committed().len();
    harness.cluster.reset_members(&partition, &[A.to_string()]).await?;

    let state = partition.read();
    assert_eq!(state.hosts, vec![A.to_string()]);
    assert_eq!(state.peers.len(), 1);
    assert_eq!(state.peers[0].addr, A);
    assert!(state.learners.is_empty());
    drop(state);

    // Exactly one reset RPC, to the survivor, carrying the survivor peer set.
    let resets: Vec<_> = harness
        .transport
        .sent()
        .into_iter()
        .filter(|(_, task)| matches!(task.cmd, AdminCmd::ResetRaftMember(_)))
        .collect();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].0, A);
    if let AdminCmd::ResetRaftMember(req) = &resets[0].1.cmd {
        assert_eq!(req.new_peers.len(), 1);
        assert_eq!(req.new_peers[0].addr, A);
    }

    // One journal entry: the membership rewrite.
    assert_eq!(harness.raft.committed().len(), journaled_before + 1);
    Ok(())
}

#[tokio::test]
async fn test_reset_members_preconditions() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;

    // Too many survivors: quorum is not lost.
    let res = harness.cluster.reset_members(&partition, &[A.to_string(), B.to_string()]).await;
    assert!(matches!(res, Err(ClusterError::InvariantViolation(_))), "got {:?}", res);

    // No survivors at all.
    let res = harness.cluster.reset_members(&partition, &[]).await;
    assert!(matches!(res, Err(ClusterError::InvariantViolation(_))), "got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn test_reset_members_requires_every_survivor_ack() -> Result<()> {
    let harness = test_cluster().await?;
    for addr in [A, B, C, D, E] {
        harness.add_active_node(NodeKind::Data, addr, "default").await?;
    }
    harness.add_volume(1, "v", 5);
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C, D, E]).await?;
    harness.transport.set_fail(B);

    let hosts_before = partition.read().hosts.clone();
    let res = harness.cluster.reset_members(&partition, &[A.to_string(), B.to_string()]).await;
    assert!(matches!(res, Err(ClusterError::RpcFailed { .. })), "got {:?}", res);
    assert_eq!(partition.read().hosts, hosts_before, "a partial ack must not rewrite membership");
    Ok(())
}

#[tokio::test]
async fn test_leader_first_dispatch_falls_back() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;
    // The leader (A) refuses; the dispatch must fall back to another host.
    harness.transport.set_fail(A);

    harness.cluster.add_replica(&partition, D).await?;

    let attempts: Vec<String> = harness
        .transport
        .sent()
        .into_iter()
        .filter(|(_, task)| matches!(task.cmd, AdminCmd::AddRaftMember(_)))
        .map(|(addr, _)| addr)
        .collect();
    assert_eq!(attempts[0], A, "the leader must be tried first");
    assert!(attempts.len() >= 2 && attempts[1] == B, "expected fallback to the next host, got {:?}", attempts);
    Ok(())
}

#[tokio::test]
async fn test_journal_failure_leaves_memory_untouched() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;
    harness.raft.set_fail_submits(true);

    let hosts_before = partition.read().hosts.clone();
    let res = harness.cluster.add_replica(&partition, D).await;
    assert!(matches!(res, Err(ClusterError::JournalFailed(_))), "got {:?}", res);
    assert_eq!(partition.read().hosts, hosts_before, "in-memory state must match the last journaled state");
    Ok(())
}

#[tokio::test]
async fn test_heartbeat_registers_and_moves_zones() -> Result<()> {
    let harness = test_cluster().await?;
    let report = nimbus_core::types::HeartbeatReport {
        addr: A.to_string(),
        zone_name: "zone-a".into(),
        used: 1,
        total: 100,
        partition_reports: vec![],
    };
    harness.cluster.handle_heartbeat(NodeKind::Data, report.clone()).await?;
    let node = harness.cluster.topology.node(NodeKind::Data, A)?;
    assert_eq!(node.zone_name(), "zone-a");
    assert!(node.is_active());

    // The node comes back reporting a different zone.
    let mut moved = report;
    moved.zone_name = "zone-b".into();
    harness.cluster.handle_heartbeat(NodeKind::Data, moved).await?;
    let node = harness.cluster.topology.node(NodeKind::Data, A)?;
    assert_eq!(node.zone_name(), "zone-b");
    assert!(harness.cluster.topology.zone("zone-b").is_ok());
    Ok(())
}

#[tokio::test]
async fn test_heartbeat_updates_replica_reports() -> Result<()> {
    let harness = three_replica_cluster().await?;
    let partition = harness.add_partition(1001, 1, "v", PartitionKind::Data, &[A, B, C]).await?;

    let report = nimbus_core::types::HeartbeatReport {
        addr: B.to_string(),
        zone_name: "default".into(),
        used: 5,
        total: 100,
        partition_reports: vec![nimbus_core::types::PartitionReport {
            partition_id: 1001,
            vol_name: "v".into(),
            is_leader: true,
            used: 7,
            applied_id: 88,
            ..Default::default()
        }],
    };
    harness.cluster.handle_heartbeat(NodeKind::Data, report).await?;

    assert_eq!(partition.leader_addr().as_deref(), Some(B), "leadership follows the report");
    let state = partition.read();
    let replica = state.replicas.iter().find(|replica| replica.addr == B).expect("missing replica report");
    assert_eq!(replica.used, 7);
    assert_eq!(replica.applied_id, 88);
    Ok(())
}
