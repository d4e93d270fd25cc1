use std::sync::Arc;

use anyhow::Result;

use nimbus_core::types::{Learner, Peer};
use nimbus_core::ClusterError;

use crate::partitions::{quorum_survives_removal, validate_membership, Partition, PartitionKind, PartitionRegistry, ReplicaMeta};

fn peers_of(hosts: &[&str]) -> Vec<Peer> {
    hosts.iter().enumerate().map(|(idx, host)| Peer::new(idx as u64 + 1, *host)).collect()
}

fn hosts_of(hosts: &[&str]) -> Vec<String> {
    hosts.iter().map(|host| host.to_string()).collect()
}

#[test]
fn test_validate_membership_positionwise() -> Result<()> {
    let hosts = hosts_of(&["a:17310", "b:17310", "c:17310"]);
    let peers = peers_of(&["a:17310", "b:17310", "c:17310"]);
    validate_membership(&hosts, &peers, &[])?;

    // Length mismatch.
    let res = validate_membership(&hosts[..2], &peers, &[]);
    assert!(matches!(res, Err(ClusterError::InvariantViolation(_))), "expected length mismatch to be rejected");

    // Position mismatch.
    let swapped = peers_of(&["b:17310", "a:17310", "c:17310"]);
    let res = validate_membership(&hosts, &swapped, &[]);
    assert!(matches!(res, Err(ClusterError::InvariantViolation(_))), "expected position mismatch to be rejected");

    // Learner not in hosts.
    let learner = Learner::new(9, "d:17310", true, 90);
    let res = validate_membership(&hosts, &peers, &[learner]);
    assert!(matches!(res, Err(ClusterError::InvariantViolation(_))), "expected foreign learner to be rejected");
    Ok(())
}

#[test]
fn test_quorum_survives_removal() {
    // N=3, all live: removing one leaves 2 of 3 voters, a strict majority.
    assert!(quorum_survives_removal(3, 0, 0, 3));
    // N=3, one other replica down: removal leaves 1 voter, quorum breaks.
    assert!(!quorum_survives_removal(3, 0, 1, 3));
    // N=5, one other down: 3 survivors of 5 is still a strict majority.
    assert!(quorum_survives_removal(5, 0, 1, 5));
    // N=5, two others down: 2 survivors of 5 breaks quorum.
    assert!(!quorum_survives_removal(5, 0, 2, 5));
    // Even N uses the non-strict comparison: 4 voters, remove 1, 1 down,
    // 2 survivors == floor(4/2) passes.
    assert!(quorum_survives_removal(4, 0, 1, 4));
    assert!(!quorum_survives_removal(4, 0, 2, 4));
    // Learners do not count as voters.
    assert!(!quorum_survives_removal(4, 1, 1, 3));
}

#[test]
fn test_apply_membership_prunes_replica_reports() -> Result<()> {
    let partition = Partition::new(1001, 1, "v", PartitionKind::Data, 3);
    partition.apply_membership(hosts_of(&["a:17310", "b:17310", "c:17310"]), peers_of(&["a:17310", "b:17310", "c:17310"]), vec![])?;
    for addr in ["a:17310", "b:17310", "c:17310"] {
        partition.update_replica(ReplicaMeta {
            addr: addr.into(),
            ..Default::default()
        });
    }
    assert_eq!(partition.read().replicas.len(), 3);

    partition.apply_membership(hosts_of(&["b:17310", "c:17310"]), peers_of(&["b:17310", "c:17310"]), vec![])?;
    let state = partition.read();
    assert_eq!(state.replicas.len(), 2, "expected the removed host's report to be pruned");
    assert!(state.replicas.iter().all(|replica| replica.addr != "a:17310"));
    Ok(())
}

#[test]
fn test_update_replica_single_leader() {
    let partition = Partition::new(1001, 1, "v", PartitionKind::Data, 3);
    partition.update_replica(ReplicaMeta {
        addr: "a:17310".into(),
        is_leader: true,
        ..Default::default()
    });
    partition.update_replica(ReplicaMeta {
        addr: "b:17310".into(),
        is_leader: true,
        ..Default::default()
    });
    let leaders = partition.read().replicas.iter().filter(|replica| replica.is_leader).count();
    assert_eq!(leaders, 1, "expected exactly one leader after a leadership change");
    assert_eq!(partition.leader_addr().as_deref(), Some("b:17310"));
}

#[test]
fn test_spread_measurements() {
    let partition = Partition::new(2001, 1, "v", PartitionKind::Data, 3);
    for (addr, used) in [("a", 10 * nimbus_core::GIB), ("b", 10 * nimbus_core::GIB), ("c", 10 * nimbus_core::GIB + nimbus_core::GIB / 2)] {
        partition.update_replica(ReplicaMeta {
            addr: addr.into(),
            used,
            ..Default::default()
        });
    }
    assert_eq!(partition.used_spread(), nimbus_core::GIB / 2);

    let meta = Partition::new_meta(2002, 1, "v", 3, 0, 1 << 24);
    for (addr, max_inode) in [("a", 100), ("b", 250), ("c", 400)] {
        meta.update_replica(ReplicaMeta {
            addr: addr.into(),
            max_inode_id: max_inode,
            ..Default::default()
        });
    }
    assert_eq!(meta.max_inode_spread(), 300);
    assert_eq!(meta.read().max_inode_id, 400, "expected observed max inode id to track the highest report");
}

#[test]
fn test_bad_partition_index_wholesale_replacement() {
    let registry = PartitionRegistry::default();
    registry.mark_bad("a:17310", 1001);
    registry.mark_bad("a:17310", 1002);
    registry.mark_bad("a:17310", 1002); // Idempotent.
    assert!(registry.is_bad("a:17310", 1001));

    let snapshot = registry.bad_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].1, vec![1001, 1002]);

    registry.replace_bad_list("a:17310", vec![1002]);
    assert!(!registry.is_bad("a:17310", 1001));
    assert!(registry.is_bad("a:17310", 1002));

    // Empty replacement drops the source key entirely.
    registry.replace_bad_list("a:17310", Vec::new());
    assert!(registry.bad_snapshot().is_empty(), "expected empty list to remove the source key");
}

#[test]
fn test_registry_lookup_scoped_to_volume() -> Result<()> {
    let registry = PartitionRegistry::default();
    registry.put(Arc::new(Partition::new(7, 3, "v3", PartitionKind::Meta, 3)));
    assert!(registry.get(7).is_ok());
    assert!(registry.get_in_vol(3, 7).is_ok());
    let res = registry.get_in_vol(4, 7);
    assert!(matches!(res, Err(ClusterError::NotFound { .. })), "expected cross-volume lookup to fail");
    Ok(())
}

#[test]
fn test_partitions_of_node() -> Result<()> {
    let registry = PartitionRegistry::default();
    for id in [1, 2, 3] {
        let partition = Partition::new(id, 1, "v", PartitionKind::Data, 3);
        let hosts = if id == 2 {
            hosts_of(&["x:17310", "y:17310", "z:17310"])
        } else {
            hosts_of(&["a:17310", "b:17310", "c:17310"])
        };
        let peers = hosts.iter().enumerate().map(|(idx, host)| Peer::new(idx as u64 + 1, host.clone())).collect();
        partition.apply_membership(hosts, peers, vec![])?;
        registry.put(Arc::new(partition));
    }
    let hosted = registry.partitions_of_node("a:17310");
    assert_eq!(hosted.len(), 2);
    assert!(hosted.iter().all(|partition| partition.id != 2));
    Ok(())
}
