use std::sync::Arc;

use anyhow::Result;

use nimbus_core::types::NodeKind;
use nimbus_core::ClusterError;

use crate::topology::{Node, NodeSet, Selection, Topology};

const NOW: i64 = 1_700_000_000;

fn seeded_topology() -> Arc<Topology> {
    // Two zones; zone-a carries sets 1 and 2, zone-b carries set 3.
    let topology = Topology::new("default", 3);
    for (zone_name, set_id) in [("zone-a", 1u64), ("zone-a", 2), ("zone-b", 3)] {
        let zone = topology.get_or_create_zone(zone_name);
        zone.put_node_set(NodeSet::new(set_id, 3, zone_name));
    }
    topology
}

fn add_node(topology: &Topology, id: u64, addr: &str, zone: &str, set: u64, avail: u64) -> Arc<Node> {
    let node = Node::new(id, addr, NodeKind::Data, zone, NOW);
    node.set_node_set_id(set);
    node.update_metrics(0, avail, NOW);
    topology.insert_node(node.clone()).expect("node insertion failed");
    node
}

#[test]
fn test_prefers_the_victims_node_set() -> Result<()> {
    let topology = seeded_topology();
    add_node(&topology, 1, "a1:17310", "zone-a", 1, 100);
    add_node(&topology, 2, "a2:17310", "zone-a", 1, 50);
    add_node(&topology, 3, "b1:17310", "zone-a", 2, 500);

    let (hosts, peers) = topology.get_avail_hosts(
        NodeKind::Data,
        Selection {
            count: 1,
            preferred: Some(("zone-a".into(), 1)),
            ..Default::default()
        },
    )?;
    assert_eq!(hosts, vec!["a1:17310".to_string()], "expected the same-set node despite more space elsewhere");
    assert_eq!(peers[0].id, 1);
    Ok(())
}

#[test]
fn test_falls_back_to_other_sets_in_zone() -> Result<()> {
    let topology = seeded_topology();
    // Set 1 has only excluded/unwritable nodes; set 2 can serve.
    let stale = add_node(&topology, 1, "a1:17310", "zone-a", 1, 100);
    stale.refresh_liveness(NOW + 3600, 60);
    add_node(&topology, 3, "b1:17310", "zone-a", 2, 500);

    let (hosts, _) = topology.get_avail_hosts(
        NodeKind::Data,
        Selection {
            count: 1,
            preferred: Some(("zone-a".into(), 1)),
            ..Default::default()
        },
    )?;
    assert_eq!(hosts, vec!["b1:17310".to_string()]);
    Ok(())
}

#[test]
fn test_cross_zone_excludes_live_zones() -> Result<()> {
    let topology = seeded_topology();
    add_node(&topology, 1, "a1:17310", "zone-a", 1, 100);
    add_node(&topology, 5, "c1:17310", "zone-b", 3, 50);

    let exclude_zones = vec!["zone-a".to_string()];
    let (hosts, _) = topology.get_avail_hosts(
        NodeKind::Data,
        Selection {
            count: 1,
            exclude_zones: &exclude_zones,
            ..Default::default()
        },
    )?;
    assert_eq!(hosts, vec!["c1:17310".to_string()], "expected zone-a to be skipped");
    Ok(())
}

#[test]
fn test_insufficient_capacity() {
    let topology = seeded_topology();
    add_node(&topology, 1, "a1:17310", "zone-a", 1, 100);

    let res = topology.get_avail_hosts(
        NodeKind::Data,
        Selection {
            count: 3,
            ..Default::default()
        },
    );
    match res {
        Err(ClusterError::InsufficientCapacity { want, found }) => {
            assert_eq!(want, 3);
            assert_eq!(found, 1);
        }
        other => panic!("expected InsufficientCapacity, got {:?}", other.map(|(hosts, _)| hosts)),
    }
}

#[test]
fn test_excluded_hosts_are_skipped() -> Result<()> {
    let topology = seeded_topology();
    add_node(&topology, 1, "a1:17310", "zone-a", 1, 100);
    add_node(&topology, 2, "a2:17310", "zone-a", 1, 50);

    let exclude = vec!["a1:17310".to_string()];
    let (hosts, _) = topology.get_avail_hosts(
        NodeKind::Data,
        Selection {
            count: 1,
            exclude_hosts: &exclude,
            preferred: Some(("zone-a".into(), 1)),
            ..Default::default()
        },
    )?;
    assert_eq!(hosts, vec!["a2:17310".to_string()]);
    Ok(())
}

#[test]
fn test_node_liveness_lapse() {
    let node = Node::new(9, "x:17310", NodeKind::Meta, "default", NOW);
    node.update_metrics(10, 100, NOW);
    assert!(node.is_active());
    assert!(node.is_writable());

    node.refresh_liveness(NOW + 30, 60);
    assert!(node.is_active(), "a fresh heartbeat must not lapse early");
    node.refresh_liveness(NOW + 61, 60);
    assert!(!node.is_active(), "expected liveness to lapse past the threshold");
    assert!(!node.is_writable());
}

#[test]
fn test_remove_node_clears_set_membership() -> Result<()> {
    let topology = seeded_topology();
    add_node(&topology, 1, "a1:17310", "zone-a", 1, 100);
    let set = topology.zone("zone-a")?.get_node_set(1)?;
    assert_eq!(set.len(NodeKind::Data), 1);

    topology.remove_node(NodeKind::Data, "a1:17310");
    assert_eq!(set.len(NodeKind::Data), 0);
    assert!(topology.node(NodeKind::Data, "a1:17310").is_err());
    Ok(())
}
