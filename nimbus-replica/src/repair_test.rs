use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::fixtures::{three_replica_partition, FakePeerClient, LOCAL, PEER_B};
use crate::meta::CreateType;
use crate::partition::ReplicaPartition;
use crate::repair::wait_repair_then_start;

const BACKOFF: Duration = Duration::from_millis(10);

/// Demote the fixture partition: PEER_B becomes the designated primary.
fn demote(partition: &Arc<ReplicaPartition>) {
    let mut config = partition.config();
    config.hosts.swap(0, 1);
    config.peers.swap(0, 1);
    partition.set_config(config);
}

#[tokio::test]
async fn test_repair_waits_for_local_store_to_catch_up() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let (partition, _, extents) = three_replica_partition(1, tmpdir.path(), CreateType::Repair);
    demote(&partition);

    // The primary reports 3000 bytes up to extent 2; the local store only
    // has half of it.
    let client = FakePeerClient::new();
    client.set_size(PEER_B, 2, 3000);
    extents.put_extent(1, 1500, 0xaaaa);

    let handle = tokio::spawn(wait_repair_then_start(partition.clone(), client.clone(), BACKOFF));
    tokio::time::sleep(BACKOFF * 4).await;
    assert!(!partition.is_raft_started(), "raft must not start while the store lags");

    // The repair completes.
    extents.put_extent(2, 1500, 0xbbbb);
    handle.await??;
    assert!(partition.is_raft_started());
    assert_eq!(partition.create_type(), CreateType::Normal, "create type flips to normal after repair");

    // The flipped create type was persisted.
    let manifest = crate::meta::load_manifest(tmpdir.path()).await?.expect("missing manifest");
    assert_eq!(manifest.create_type, CreateType::Normal);
    Ok(())
}

#[tokio::test]
async fn test_repair_designated_leader_starts_immediately() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    // The fixture places the local address first: it is the designated
    // primary and must not wait on itself.
    let (partition, _, _) = three_replica_partition(1, tmpdir.path(), CreateType::Repair);
    assert_eq!(partition.hosts()[0], LOCAL);

    let client = FakePeerClient::new();
    wait_repair_then_start(partition.clone(), client, BACKOFF).await?;
    assert!(partition.is_raft_started());
    Ok(())
}

#[tokio::test]
async fn test_repair_observes_stop_signal() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let (partition, _, _) = three_replica_partition(1, tmpdir.path(), CreateType::Repair);
    demote(&partition);
    // No canned sizes: the loop would poll forever.
    let client = FakePeerClient::new();

    let handle = tokio::spawn(wait_repair_then_start(partition.clone(), client, BACKOFF));
    tokio::time::sleep(BACKOFF * 2).await;
    partition.stop();
    handle.await??;
    assert!(!partition.is_raft_started(), "a stopped partition must not start raft");
    Ok(())
}

/// The leader size may shrink between probes (compaction); the smaller
/// value becomes the new target.
#[tokio::test]
async fn test_repair_tracks_shrinking_leader_size() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let (partition, _, extents) = three_replica_partition(1, tmpdir.path(), CreateType::Repair);
    demote(&partition);

    let client = FakePeerClient::new();
    client.set_size(PEER_B, 2, 3000);
    extents.put_extent(1, 2000, 0xaaaa);

    let handle = tokio::spawn(wait_repair_then_start(partition.clone(), client.clone(), BACKOFF));
    tokio::time::sleep(BACKOFF * 3).await;
    assert!(!partition.is_raft_started());

    // The leader compacts below what the local store already holds.
    client.set_size(PEER_B, 2, 1800);
    handle.await??;
    assert!(partition.is_raft_started());
    Ok(())
}
