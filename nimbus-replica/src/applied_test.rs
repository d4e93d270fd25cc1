use anyhow::Result;

use crate::applied::{collect_applied_ids, truncate_if_advanced};
use crate::fixtures::{three_replica_partition, FakePeerClient, LOCAL, PEER_B, PEER_C};
use crate::meta::CreateType;

/// Applied IDs {500, 510, 520} are reconciled to min=500/max=520; the
/// first truncation tick then cuts at 500. A later round at {600, 610,
/// 620} advances the cut to 600.
#[tokio::test]
async fn test_applied_id_reconciliation_and_truncation() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let (partition, raft, _) = three_replica_partition(1, tmpdir.path(), CreateType::Normal);
    partition.start_raft()?;
    partition.set_last_truncate_id(400);

    let client = FakePeerClient::new();
    partition.set_applied_id(500);
    client.set_applied(PEER_B, 510);
    client.set_applied(PEER_C, 520);

    // Five collection rounds at the same progress are idempotent.
    for _ in 0..5 {
        assert!(collect_applied_ids(&partition, client.as_ref()).await, "expected a full collection round");
    }
    assert_eq!(partition.min_applied_id(), 500);
    assert_eq!(partition.max_applied_id(), 520);
    let broadcasts = client.broadcasts();
    assert!(broadcasts.iter().all(|(_, min)| *min == 500));
    assert!(broadcasts.iter().any(|(addr, _)| addr == PEER_B));
    assert!(broadcasts.iter().any(|(addr, _)| addr == PEER_C));

    truncate_if_advanced(&partition).await?;
    assert_eq!(raft.truncated(), 500);
    assert_eq!(partition.last_truncate_id(), 500);

    // The group advances.
    partition.set_applied_id(600);
    client.set_applied(PEER_B, 610);
    client.set_applied(PEER_C, 620);
    assert!(collect_applied_ids(&partition, client.as_ref()).await);
    truncate_if_advanced(&partition).await?;
    assert_eq!(raft.truncated(), 600);
    assert_eq!(partition.last_truncate_id(), 600);
    Ok(())
}

/// No broadcast happens unless every replica responds.
#[tokio::test]
async fn test_collection_requires_all_replicas() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let (partition, _, _) = three_replica_partition(1, tmpdir.path(), CreateType::Normal);
    partition.start_raft()?;
    partition.set_applied_id(500);

    let client = FakePeerClient::new();
    client.set_applied(PEER_B, 510);
    client.set_fail(PEER_C);

    assert!(!collect_applied_ids(&partition, client.as_ref()).await, "a partial round must not complete");
    assert_eq!(partition.min_applied_id(), 0, "min must stay untouched");
    assert!(client.broadcasts().is_empty(), "no broadcast on a partial round");

    client.clear_fail(PEER_C);
    client.set_applied(PEER_C, 505);
    assert!(collect_applied_ids(&partition, client.as_ref()).await);
    assert_eq!(partition.min_applied_id(), 500);
    Ok(())
}

/// The broadcast minimum never regresses, even when a freshly added
/// replica reports far behind the previous floor.
#[tokio::test]
async fn test_broadcast_min_is_monotonic() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let (partition, _, _) = three_replica_partition(1, tmpdir.path(), CreateType::Normal);
    partition.start_raft()?;
    partition.set_applied_id(600);

    let client = FakePeerClient::new();
    client.set_applied(PEER_B, 600);
    client.set_applied(PEER_C, 600);
    assert!(collect_applied_ids(&partition, client.as_ref()).await);
    assert_eq!(partition.min_applied_id(), 600);

    // A replica reappears behind the already-broadcast floor.
    client.set_applied(PEER_C, 300);
    assert!(collect_applied_ids(&partition, client.as_ref()).await);
    assert_eq!(partition.min_applied_id(), 600, "the floor must not regress");
    assert!(client.broadcasts().iter().all(|(_, min)| *min == 600), "broadcast mins must be non-decreasing");
    Ok(())
}

/// Followers and idle replicas never collect.
#[tokio::test]
async fn test_collection_is_leader_only() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let (partition, raft, _) = three_replica_partition(1, tmpdir.path(), CreateType::Normal);
    partition.start_raft()?;
    partition.set_applied_id(500);
    let client = FakePeerClient::new();
    client.set_applied(PEER_B, 510);
    client.set_applied(PEER_C, 520);

    raft.set_leader(false);
    assert!(!collect_applied_ids(&partition, client.as_ref()).await);
    assert!(client.broadcasts().is_empty());

    raft.set_leader(true);
    assert!(collect_applied_ids(&partition, client.as_ref()).await);
    Ok(())
}

/// A leader with nothing applied skips collection entirely.
#[tokio::test]
async fn test_collection_skips_pristine_leader() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let (partition, _, _) = three_replica_partition(1, tmpdir.path(), CreateType::Normal);
    partition.start_raft()?;
    let client = FakePeerClient::new();
    assert!(!collect_applied_ids(&partition, client.as_ref()).await);
    Ok(())
}

/// Truncation is a no-op until the floor advances past the watermark, and
/// persists the metadata footer when it fires.
#[tokio::test]
async fn test_truncate_watermark() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let (partition, raft, _) = three_replica_partition(1, tmpdir.path(), CreateType::Normal);
    partition.start_raft()?;
    partition.set_applied_id(900);
    partition.set_min_applied_id(500);
    partition.set_last_truncate_id(500);

    truncate_if_advanced(&partition).await?;
    assert_eq!(raft.truncated(), 0, "no truncation while the floor equals the watermark");

    partition.set_min_applied_id(650);
    truncate_if_advanced(&partition).await?;
    assert_eq!(raft.truncated(), 650);

    let manifest = crate::meta::load_manifest(tmpdir.path()).await?.expect("missing manifest after truncation");
    assert_eq!(manifest.last_truncate_id, 650, "the footer must carry the new watermark");
    Ok(())
}

/// Local replica uses its own applied id rather than an RPC.
#[tokio::test]
async fn test_local_replica_is_not_called() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let (partition, _, _) = three_replica_partition(1, tmpdir.path(), CreateType::Normal);
    partition.start_raft()?;
    partition.set_applied_id(500);

    let client = FakePeerClient::new();
    // No canned value for LOCAL: an RPC against it would fail the round.
    client.set_applied(PEER_B, 502);
    client.set_applied(PEER_C, 504);
    assert!(collect_applied_ids(&partition, client.as_ref()).await);
    assert!(client.broadcasts().iter().all(|(addr, _)| addr != LOCAL), "the local replica must not receive a broadcast rpc");
    Ok(())
}
