use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use nimbus_core::types::{NodeKind, Peer};

use crate::cluster::Cluster;
use crate::fixtures::{test_cluster, RecordingTransport};
use crate::journal::{
    key_node, key_partition, key_vol, NodeValue, PartitionValue, RaftCmd, OP_ADD_DATA_NODE, OP_ADD_DATA_PARTITION, OP_ADD_VOL, OP_BATCH_PUT,
    OP_DELETE_DATA_NODE, OP_UPDATE_DATA_PARTITION,
};
use crate::partitions::PartitionKind;
use crate::volumes::{Volume, VolumeStatus};

const ADDR_A: &str = "192.168.0.1:17310";
const ADDR_B: &str = "192.168.0.2:17310";

fn node_cmd(op: u32, id: u64, addr: &str) -> Result<RaftCmd> {
    let value = NodeValue {
        id,
        node_set_id: 1,
        addr: addr.to_string(),
        zone_name: "default".to_string(),
    };
    Ok(RaftCmd::new(op, key_node(NodeKind::Data, id, addr), serde_json::to_vec(&value)?))
}

fn vol_cmd() -> Result<RaftCmd> {
    let vol = Volume {
        id: 1,
        name: "v".into(),
        dp_replica_num: 3,
        mp_replica_num: 3,
        status: VolumeStatus::Normal,
        capacity: 0,
        owner: "tester".into(),
        zone_name: "default".into(),
        cross_zone: false,
        create_time: 0,
    };
    Ok(RaftCmd::new(OP_ADD_VOL, key_vol(1), serde_json::to_vec(&vol)?))
}

fn partition_cmd(op: u32, hosts: &[(u64, &str)]) -> Result<RaftCmd> {
    let value = PartitionValue {
        partition_id: 1,
        vol_id: 1,
        vol_name: "v".into(),
        replica_num: 3,
        status: Default::default(),
        hosts: hosts.iter().map(|(_, addr)| addr.to_string()).collect(),
        peers: hosts.iter().map(|(id, addr)| Peer::new(*id, *addr)).collect(),
        learners: vec![],
        offline_peer_id: 0,
        is_recovering: false,
        start: 0,
        end: 0,
        replicas: vec![],
    };
    Ok(RaftCmd::new(op, key_partition(PartitionKind::Data, 1, 1), serde_json::to_vec(&value)?))
}

#[test]
fn test_raft_cmd_json_shape() -> Result<()> {
    let cmd = RaftCmd::new(OP_ADD_DATA_NODE, "#dn#1,192.168.0.1:17310", vec![1, 2, 3]);
    let raw = cmd.marshal()?;
    let value: serde_json::Value = serde_json::from_slice(&raw)?;
    assert_eq!(value["op"], OP_ADD_DATA_NODE);
    assert_eq!(value["k"], "#dn#1,192.168.0.1:17310");
    assert!(value["v"].is_array(), "expected value bytes field");
    assert_eq!(RaftCmd::unmarshal(&raw)?, cmd);
    Ok(())
}

#[tokio::test]
async fn test_apply_is_idempotent() -> Result<()> {
    let harness = test_cluster().await?;
    let journal = &harness.cluster.journal;

    let cmd = node_cmd(OP_ADD_DATA_NODE, 1, ADDR_A)?;
    let raw = cmd.marshal()?;
    journal.apply(&raw)?;
    let first = journal.get(&cmd.k)?;
    journal.apply(&raw)?;
    assert_eq!(journal.get(&cmd.k)?, first, "re-applying a command must not change stored state");

    let del = node_cmd(OP_DELETE_DATA_NODE, 1, ADDR_A)?;
    journal.apply(&del.marshal()?)?;
    assert!(journal.get(&cmd.k)?.is_none(), "expected delete to remove the record");
    journal.apply(&del.marshal()?)?;
    assert!(journal.get(&cmd.k)?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_batch_put_applies_atomically() -> Result<()> {
    let harness = test_cluster().await?;
    let journal = &harness.cluster.journal;

    let add_a = node_cmd(OP_ADD_DATA_NODE, 1, ADDR_A)?;
    let add_b = node_cmd(OP_ADD_DATA_NODE, 2, ADDR_B)?;
    let mut cmds = HashMap::new();
    cmds.insert(add_a.k.clone(), add_a.clone());
    cmds.insert(add_b.k.clone(), add_b.clone());
    journal.sync_batch(cmds).await?;

    assert!(journal.get(&add_a.k)?.is_some());
    assert!(journal.get(&add_b.k)?.is_some());

    let committed = harness.committed_cmds();
    assert_eq!(committed.len(), 1, "expected a single batch_put commit");
    assert_eq!(committed[0].op, OP_BATCH_PUT);
    Ok(())
}

/// Seed the journal with node and partition records, replay, and verify the
/// rebuilt in-memory state; a second replay must produce identical state.
#[tokio::test]
async fn test_replay_rebuilds_state() -> Result<()> {
    let harness = test_cluster().await?;
    let journal = harness.cluster.journal.clone();

    journal.submit(node_cmd(OP_ADD_DATA_NODE, 1, ADDR_A)?).await?;
    journal.submit(vol_cmd()?).await?;
    journal.submit(partition_cmd(OP_ADD_DATA_PARTITION, &[(1, ADDR_A)])?).await?;
    journal.submit(node_cmd(OP_ADD_DATA_NODE, 2, ADDR_B)?).await?;
    journal.submit(partition_cmd(OP_UPDATE_DATA_PARTITION, &[(1, ADDR_A), (2, ADDR_B)])?).await?;

    let restored = Cluster::new("restored", harness.cluster.config.clone(), harness.raft.clone(), journal.clone(), RecordingTransport::new());
    restored.restore()?;

    let partition = restored.partitions.get(1)?;
    assert_eq!(partition.read().hosts, vec![ADDR_A.to_string(), ADDR_B.to_string()]);
    assert_eq!(restored.topology.node(NodeKind::Data, ADDR_A)?.id, 1);
    assert_eq!(restored.topology.node(NodeKind::Data, ADDR_B)?.id, 2);

    let snapshot = |cluster: &Arc<Cluster>| -> Result<(Vec<String>, Vec<Peer>, u64, u64)> {
        let partition = cluster.partitions.get(1)?;
        let state = partition.read();
        Ok((
            state.hosts.clone(),
            state.peers.clone(),
            cluster.topology.node(NodeKind::Data, ADDR_A)?.id,
            cluster.topology.node(NodeKind::Data, ADDR_B)?.id,
        ))
    };
    let first = snapshot(&restored)?;
    restored.restore()?;
    let second = snapshot(&restored)?;
    assert_eq!(first, second, "replaying the journal twice must produce identical state");
    Ok(())
}

/// Peer IDs recorded in partition records are rewritten when an address has
/// been reused by a newer node ID.
#[tokio::test]
async fn test_replay_rewrites_reused_peer_ids() -> Result<()> {
    let harness = test_cluster().await?;
    let journal = harness.cluster.journal.clone();

    journal.submit(node_cmd(OP_ADD_DATA_NODE, 1, ADDR_A)?).await?;
    journal.submit(vol_cmd()?).await?;
    journal.submit(partition_cmd(OP_ADD_DATA_PARTITION, &[(1, ADDR_A)])?).await?;
    // The address comes back under a new node ID.
    journal.submit(node_cmd(OP_ADD_DATA_NODE, 9, ADDR_A)?).await?;

    let restored = Cluster::new("restored", harness.cluster.config.clone(), harness.raft.clone(), journal, RecordingTransport::new());
    restored.restore()?;

    assert_eq!(restored.topology.node(NodeKind::Data, ADDR_A)?.id, 9, "expected the newest node id to win");
    let partition = restored.partitions.get(1)?;
    assert_eq!(partition.read().peers[0].id, 9, "expected the partition's peer id to be rewritten");
    Ok(())
}
