//! The topology registry.
//!
//! Maintains the live roster of data and meta nodes, grouped into zones and
//! capacity-bounded node-sets, and answers target-selection queries for the
//! replica-set controller. Reads go through concurrent maps; zone
//! reassignments triggered by heartbeats are serialized by a per-node-kind
//! mutex.

#[cfg(test)]
mod mod_test;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use nimbus_core::types::{NodeKind, Peer};
use nimbus_core::{ClusterError, NodeId};

/// A node of the cluster, data or meta.
///
/// Nodes carry only their own identity and metrics; the partitions hosted by
/// a node are a lookup against the partition registry.
pub struct Node {
    pub id: NodeId,
    pub addr: String,
    pub kind: NodeKind,
    pub active_since: i64,
    zone_name: RwLock<String>,
    node_set_id: AtomicU64,
    is_active: AtomicBool,
    last_heartbeat: AtomicI64,
    used: AtomicU64,
    total: AtomicU64,
    to_be_offline: AtomicBool,
}

impl Node {
    pub fn new(id: NodeId, addr: impl Into<String>, kind: NodeKind, zone_name: impl Into<String>, now: i64) -> Arc<Self> {
        Arc::new(Self {
            id,
            addr: addr.into(),
            kind,
            active_since: now,
            zone_name: RwLock::new(zone_name.into()),
            node_set_id: AtomicU64::new(0),
            is_active: AtomicBool::new(false),
            last_heartbeat: AtomicI64::new(now),
            used: AtomicU64::new(0),
            total: AtomicU64::new(0),
            to_be_offline: AtomicBool::new(false),
        })
    }

    pub fn zone_name(&self) -> String {
        self.zone_name.read().clone()
    }

    pub fn set_zone_name(&self, zone: impl Into<String>) {
        *self.zone_name.write() = zone.into();
    }

    pub fn node_set_id(&self) -> u64 {
        self.node_set_id.load(Ordering::SeqCst)
    }

    pub fn set_node_set_id(&self, id: u64) {
        self.node_set_id.store(id, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.is_active.store(active, Ordering::SeqCst);
    }

    pub fn last_heartbeat(&self) -> i64 {
        self.last_heartbeat.load(Ordering::SeqCst)
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> u64 {
        self.total().saturating_sub(self.used())
    }

    pub fn set_to_be_offline(&self, offline: bool) {
        self.to_be_offline.store(offline, Ordering::SeqCst);
    }

    pub fn to_be_offline(&self) -> bool {
        self.to_be_offline.load(Ordering::SeqCst)
    }

    /// Record a heartbeat's metrics and refresh liveness.
    pub fn update_metrics(&self, used: u64, total: u64, now: i64) {
        self.used.store(used, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
        self.last_heartbeat.store(now, Ordering::SeqCst);
        self.is_active.store(true, Ordering::SeqCst);
    }

    /// Mark this node inactive if its heartbeat has lapsed past `timeout`.
    pub fn refresh_liveness(&self, now: i64, timeout: i64) {
        if now.saturating_sub(self.last_heartbeat()) > timeout {
            self.is_active.store(false, Ordering::SeqCst);
        }
    }

    /// Whether this node is eligible to receive a new replica.
    pub fn is_writable(&self) -> bool {
        self.is_active() && !self.to_be_offline() && self.available() > 0
    }
}

/// A capacity-bounded bucket of nodes inside one zone.
pub struct NodeSet {
    pub id: u64,
    pub capacity: usize,
    pub zone_name: String,
    data_nodes: RwLock<HashSet<String>>,
    meta_nodes: RwLock<HashSet<String>>,
}

impl NodeSet {
    pub fn new(id: u64, capacity: usize, zone_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            capacity,
            zone_name: zone_name.into(),
            data_nodes: RwLock::new(HashSet::new()),
            meta_nodes: RwLock::new(HashSet::new()),
        })
    }

    fn members(&self, kind: NodeKind) -> &RwLock<HashSet<String>> {
        match kind {
            NodeKind::Data => &self.data_nodes,
            NodeKind::Meta => &self.meta_nodes,
        }
    }

    pub fn put_node(&self, kind: NodeKind, addr: impl Into<String>) {
        self.members(kind).write().insert(addr.into());
    }

    pub fn remove_node(&self, kind: NodeKind, addr: &str) {
        self.members(kind).write().remove(addr);
    }

    pub fn len(&self, kind: NodeKind) -> usize {
        self.members(kind).read().len()
    }

    pub fn has_room(&self, kind: NodeKind) -> bool {
        self.len(kind) < self.capacity
    }

    pub fn addrs(&self, kind: NodeKind) -> Vec<String> {
        self.members(kind).read().iter().cloned().collect()
    }
}

/// A zone grouping node-sets, typically one failure domain.
pub struct Zone {
    pub name: String,
    node_sets: RwLock<HashMap<u64, Arc<NodeSet>>>,
}

impl Zone {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            node_sets: RwLock::new(HashMap::new()),
        })
    }

    pub fn put_node_set(&self, set: Arc<NodeSet>) {
        self.node_sets.write().insert(set.id, set);
    }

    pub fn get_node_set(&self, id: u64) -> Result<Arc<NodeSet>, ClusterError> {
        self.node_sets.read().get(&id).cloned().ok_or_else(|| ClusterError::NotFound {
            kind: "node-set",
            key: id.to_string(),
        })
    }

    /// A node-set with room for one more node of the given kind.
    pub fn available_node_set(&self, kind: NodeKind) -> Option<Arc<NodeSet>> {
        self.node_sets.read().values().find(|set| set.has_room(kind)).cloned()
    }

    pub fn node_sets(&self) -> Vec<Arc<NodeSet>> {
        self.node_sets.read().values().cloned().collect()
    }
}

/// Target-selection parameters for [`Topology::get_avail_hosts`].
#[derive(Default)]
pub struct Selection<'a> {
    pub count: usize,
    pub exclude_hosts: &'a [String],
    pub exclude_sets: &'a [u64],
    pub exclude_zones: &'a [String],
    /// Preferred `(zone, node-set)` pair, normally the victim's placement.
    pub preferred: Option<(String, u64)>,
}

/// The live roster of nodes, zones and node-sets.
pub struct Topology {
    pub default_zone: String,
    pub node_set_capacity: usize,
    zones: DashMap<String, Arc<Zone>>,
    data_nodes: DashMap<String, Arc<Node>>,
    meta_nodes: DashMap<String, Arc<Node>>,
    /// Serialize zone/node-set adjustments per node kind.
    pub data_node_mutex: tokio::sync::Mutex<()>,
    pub meta_node_mutex: tokio::sync::Mutex<()>,
}

impl Topology {
    pub fn new(default_zone: impl Into<String>, node_set_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            default_zone: default_zone.into(),
            node_set_capacity,
            zones: DashMap::new(),
            data_nodes: DashMap::new(),
            meta_nodes: DashMap::new(),
            data_node_mutex: tokio::sync::Mutex::new(()),
            meta_node_mutex: tokio::sync::Mutex::new(()),
        })
    }

    fn nodes(&self, kind: NodeKind) -> &DashMap<String, Arc<Node>> {
        match kind {
            NodeKind::Data => &self.data_nodes,
            NodeKind::Meta => &self.meta_nodes,
        }
    }

    pub fn node(&self, kind: NodeKind, addr: &str) -> Result<Arc<Node>, ClusterError> {
        self.nodes(kind).get(addr).map(|node| node.value().clone()).ok_or_else(|| ClusterError::NotFound {
            kind: match kind {
                NodeKind::Data => "data-node",
                NodeKind::Meta => "meta-node",
            },
            key: addr.to_string(),
        })
    }

    pub fn all_nodes(&self, kind: NodeKind) -> Vec<Arc<Node>> {
        self.nodes(kind).iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn zone(&self, name: &str) -> Result<Arc<Zone>, ClusterError> {
        self.zones.get(name).map(|zone| zone.value().clone()).ok_or_else(|| ClusterError::NotFound {
            kind: "zone",
            key: name.to_string(),
        })
    }

    pub fn get_or_create_zone(&self, name: &str) -> Arc<Zone> {
        if let Some(zone) = self.zones.get(name) {
            return zone.clone();
        }
        self.zones.entry(name.to_string()).or_insert_with(|| Zone::new(name)).value().clone()
    }

    pub fn zones(&self) -> Vec<Arc<Zone>> {
        self.zones.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Place a node into its zone and node-set membership maps.
    ///
    /// Idempotent; the node's `zone_name` and `node_set_id` must already be
    /// final. Journaling of the node and of any freshly created node-set is
    /// the caller's concern.
    pub fn insert_node(&self, node: Arc<Node>) -> Result<(), ClusterError> {
        let zone = self.get_or_create_zone(&node.zone_name());
        let set = zone.get_node_set(node.node_set_id())?;
        set.put_node(node.kind, node.addr.clone());
        self.nodes(node.kind).insert(node.addr.clone(), node);
        Ok(())
    }

    /// Remove a node from the roster and from its zone's node-set.
    pub fn remove_node(&self, kind: NodeKind, addr: &str) {
        if let Some((_, node)) = self.nodes(kind).remove(addr) {
            if let Ok(zone) = self.zone(&node.zone_name()) {
                if let Ok(set) = zone.get_node_set(node.node_set_id()) {
                    set.remove_node(kind, addr);
                }
            }
        }
    }

    /// Zone of the given node address, any kind.
    pub fn zone_of(&self, addr: &str) -> Option<String> {
        self.data_nodes
            .get(addr)
            .map(|node| node.zone_name())
            .or_else(|| self.meta_nodes.get(addr).map(|node| node.zone_name()))
    }

    /// Writable candidates within one node-set, best-first.
    fn candidates_in_set(&self, kind: NodeKind, set: &NodeSet, exclude_hosts: &[String]) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = set
            .addrs(kind)
            .into_iter()
            .filter(|addr| !exclude_hosts.contains(addr))
            .filter_map(|addr| self.nodes(kind).get(&addr).map(|node| node.value().clone()))
            .filter(|node| node.is_writable())
            .collect();
        nodes.sort_by_key(|node| std::cmp::Reverse(node.available()));
        nodes
    }

    /// Select `count` writable nodes by the escalation policy:
    /// the preferred node-set, then other sets in the preferred zone, then
    /// cross-zone. Returns `InsufficientCapacity` when no rung can satisfy
    /// the request.
    pub fn get_avail_hosts(&self, kind: NodeKind, selection: Selection<'_>) -> Result<(Vec<String>, Vec<Peer>), ClusterError> {
        let mut best_found = 0;

        // Rung 1: the preferred node-set.
        if let Some((zone_name, set_id)) = &selection.preferred {
            if let Ok(zone) = self.zone(zone_name) {
                if let Ok(set) = zone.get_node_set(*set_id) {
                    let nodes = self.candidates_in_set(kind, &set, selection.exclude_hosts);
                    if nodes.len() >= selection.count {
                        return Ok(Self::into_hosts(nodes, selection.count));
                    }
                    best_found = best_found.max(nodes.len());
                }
            }
        }

        // Rung 2: other node-sets within the preferred zone.
        if let Some((zone_name, set_id)) = &selection.preferred {
            if let Ok(zone) = self.zone(zone_name) {
                let mut nodes = Vec::new();
                let mut seen = HashSet::new();
                for set in zone.node_sets() {
                    if set.id == *set_id || selection.exclude_sets.contains(&set.id) {
                        continue;
                    }
                    for node in self.candidates_in_set(kind, &set, selection.exclude_hosts) {
                        if seen.insert(node.addr.clone()) {
                            nodes.push(node);
                        }
                    }
                }
                nodes.sort_by_key(|node| std::cmp::Reverse(node.available()));
                if nodes.len() >= selection.count {
                    return Ok(Self::into_hosts(nodes, selection.count));
                }
                best_found = best_found.max(nodes.len());
            }
        }

        // Rung 3: cross-zone, excluding the zones already hosting replicas.
        let mut nodes = Vec::new();
        let mut seen = HashSet::new();
        for zone in self.zones() {
            if selection.exclude_zones.contains(&zone.name) {
                continue;
            }
            for set in zone.node_sets() {
                if selection.exclude_sets.contains(&set.id) {
                    continue;
                }
                for node in self.candidates_in_set(kind, &set, selection.exclude_hosts) {
                    if seen.insert(node.addr.clone()) {
                        nodes.push(node);
                    }
                }
            }
        }
        nodes.sort_by_key(|node| std::cmp::Reverse(node.available()));
        if nodes.len() >= selection.count {
            return Ok(Self::into_hosts(nodes, selection.count));
        }
        best_found = best_found.max(nodes.len());

        Err(ClusterError::InsufficientCapacity {
            want: selection.count,
            found: best_found,
        })
    }

    fn into_hosts(nodes: Vec<Arc<Node>>, count: usize) -> (Vec<String>, Vec<Peer>) {
        let mut hosts = Vec::with_capacity(count);
        let mut peers = Vec::with_capacity(count);
        for node in nodes.into_iter().take(count) {
            hosts.push(node.addr.clone());
            peers.push(Peer::new(node.id, node.addr.clone()));
        }
        (hosts, peers)
    }
}
