//! Recovery & reconciliation sweepers.
//!
//! Leader-only periodic tasks: the bad-partition sweeper backfills missing
//! replicas and retires partitions from the bad index once they have caught
//! up; the load-check sweeper compares replica snapshots for divergence;
//! the node monitor expires lapsed heartbeats. Every sweep body runs inside
//! a panic guard so one partition cannot stop the others, and every
//! iteration starts with a leadership check that makes demoted masters
//! no-op without side effects.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use nimbus_core::admin::{AdminCmd, AdminTask, LoadPartitionRequest};
use nimbus_core::types::{DataLoadResponse, MetaLoadResponse, NodeKind};
use nimbus_core::{ClusterError, PartitionId, GIB};

use crate::cluster::{Cluster, NODE_TIMEOUT_SECS};
use crate::partitions::{Partition, PartitionKind};

pub const METRIC_SWEEP_PANICS: &str = "nimbus_master_sweeper_panics";
pub const METRIC_PARTITIONS_RECOVERED: &str = "nimbus_master_partitions_recovered";

/// Run a sweep body on its own task, converting a panic into a warning and
/// a metric instead of tearing the process down.
async fn guarded<F>(name: &'static str, body: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(err) = tokio::spawn(body).await {
        if err.is_panic() {
            metrics::increment_counter!(METRIC_SWEEP_PANICS);
            tracing::warn!(sweeper = name, error = ?err, "sweeper panicked");
        }
    }
}

/// Spawn the bad-partition recovery sweeper.
pub fn spawn_recovery_sweeper(cluster: Arc<Cluster>, shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let period = Duration::from_secs(cluster.config.interval_check_partition_secs);
    tokio::spawn(run_sweeper("recovery", cluster.clone(), shutdown, period, move |cluster| async move {
        cluster.check_recovery_progress().await;
    }))
}

/// Spawn the load-check sweeper for one partition kind.
///
/// Meta partitions are checked at twice the base period.
pub fn spawn_load_sweeper(cluster: Arc<Cluster>, kind: PartitionKind, shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let base = cluster.config.interval_check_partition_secs;
    let period = match kind {
        PartitionKind::Meta => Duration::from_secs(base * 2),
        PartitionKind::Data => Duration::from_secs(base),
    };
    tokio::spawn(run_sweeper("load_check", cluster.clone(), shutdown, period, move |cluster| async move {
        cluster.check_load_partitions(kind).await;
    }))
}

/// Spawn the node heartbeat monitor.
pub fn spawn_node_monitor(cluster: Arc<Cluster>, shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let period = Duration::from_secs(cluster.config.interval_check_partition_secs.min(NODE_TIMEOUT_SECS as u64));
    tokio::spawn(run_sweeper("node_monitor", cluster.clone(), shutdown, period, move |cluster| async move {
        cluster.refresh_node_liveness();
    }))
}

async fn run_sweeper<F, Fut>(
    name: &'static str, cluster: Arc<Cluster>, shutdown: broadcast::Receiver<()>, period: Duration, body: F,
) -> Result<()>
where
    F: Fn(Arc<Cluster>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tracing::debug!(sweeper = name, ?period, "sweeper is online");
    let mut shutdown = BroadcastStream::new(shutdown);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if !cluster.is_leader() {
                    continue;
                }
                guarded(name, body(cluster.clone())).await;
            }
            _ = shutdown.next() => break,
        }
    }
    tracing::debug!(sweeper = name, "sweeper has shutdown");
    Ok(())
}

impl Cluster {
    /// One pass of the bad-partition sweeper.
    ///
    /// For each recovering partition: backfill a replica when the group is
    /// short of its configured count, then measure replication lag and
    /// clear the recovering flag once the group has caught up. Lists in the
    /// bad index are replaced wholesale, and a source whose list drains is
    /// removed entirely.
    pub async fn check_recovery_progress(&self) {
        if !self.is_leader() {
            return;
        }
        for (source, ids) in self.partitions.bad_snapshot() {
            let mut remaining: Vec<PartitionId> = Vec::with_capacity(ids.len());
            for id in ids {
                let Ok(partition) = self.partitions.get(id) else {
                    continue;
                };
                let Ok(vol) = self.volumes.get(&partition.vol_name) else {
                    continue;
                };
                let replica_num = match partition.kind {
                    PartitionKind::Data => vol.dp_replica_num,
                    PartitionKind::Meta => vol.mp_replica_num,
                };

                if let Err(err) = self.fill_missing_replica(&partition, &source, replica_num).await {
                    tracing::warn!(error = %err, partition = id, "error backfilling replica");
                }

                if partition.read().replicas.is_empty() {
                    remaining.push(id);
                    continue;
                }
                if self.has_recovered(&partition, replica_num) {
                    partition.write().is_recovering = false;
                    if let Err(err) = self.journal.sync_update_partition(&partition).await {
                        // Keep tracking; the flag will be re-journaled next tick.
                        partition.write().is_recovering = true;
                        tracing::error!(error = %err, partition = id, "error journaling recovered partition");
                        remaining.push(id);
                        continue;
                    }
                    metrics::increment_counter!(METRIC_PARTITIONS_RECOVERED);
                    tracing::warn!(vol = %partition.vol_name, partition = id, "partition has recovered");
                } else {
                    remaining.push(id);
                }
            }
            if remaining.is_empty() {
                tracing::warn!(source = %source, "all partitions of source have recovered");
            }
            self.partitions.replace_bad_list(&source, remaining);
        }
    }

    /// Whether a recovering partition's replicas have caught up.
    fn has_recovered(&self, partition: &Partition, replica_num: u8) -> bool {
        if partition.read().replicas.len() < replica_num as usize {
            return false;
        }
        match partition.kind {
            PartitionKind::Data => partition.used_spread() < GIB,
            PartitionKind::Meta => partition.max_inode_spread() < self.config.meta_partition_inode_lag,
        }
    }

    /// Backfill one replica when the group is short of its configured count.
    async fn fill_missing_replica(&self, partition: &Arc<Partition>, source: &str, replica_num: u8) -> Result<(), ClusterError> {
        if partition.read().hosts.len() >= replica_num as usize {
            return Ok(());
        }
        if partition.leader_addr().is_none() {
            tracing::warn!(partition = partition.id, "no leader, deferring replica backfill");
            return Ok(());
        }
        let (target, _) = self.choose_target_host(partition, source)?;
        self.add_replica(partition, &target).await
    }

    /// One pass of the load-check sweeper for the given partition kind.
    pub async fn check_load_partitions(&self, kind: PartitionKind) {
        if !self.is_leader() {
            return;
        }
        for partition in self.partitions.all(Some(kind)) {
            self.load_partition_and_check(&partition).await;
        }
    }

    /// Dispatch load tasks to every replica in parallel, then run the
    /// consistency checks over the collected responses.
    pub async fn load_partition_and_check(&self, partition: &Arc<Partition>) {
        let hosts = partition.read().hosts.clone();
        if hosts.is_empty() {
            return;
        }
        let deadline = Duration::from_secs(self.config.time_to_wait_for_response_secs);
        let mut join_set = tokio::task::JoinSet::new();
        for host in hosts {
            let transport = self.transport.clone();
            let task = AdminTask::new(
                host.clone(),
                partition.id,
                AdminCmd::LoadPartition(LoadPartitionRequest { partition_id: partition.id }),
            );
            join_set.spawn(async move { transport.send(&host, task).await });
        }

        let expected = join_set.len();
        let mut responses = Vec::with_capacity(expected);
        let collect = async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Ok(task)) => responses.push(task),
                    Ok(Err(err)) => tracing::warn!(error = ?err, partition = partition.id, "load task failed"),
                    Err(err) => tracing::warn!(error = ?err, partition = partition.id, "load task join failed"),
                }
            }
        };
        if tokio::time::timeout(deadline, collect).await.is_err() {
            tracing::warn!(partition = partition.id, "timed out waiting for load responses");
            return;
        }
        if responses.len() != expected {
            return;
        }
        match partition.kind {
            PartitionKind::Meta => self.check_meta_consistency(partition, &responses),
            PartitionKind::Data => self.check_data_consistency(partition, &responses),
        }
    }

    /// Compare meta replica snapshots: only when every replica opts into
    /// comparison and all report the same applied ID, warn on inode or
    /// dentry counts diverging past the allowed difference.
    fn check_meta_consistency(&self, partition: &Partition, tasks: &[AdminTask]) {
        let mut responses = Vec::with_capacity(tasks.len());
        for task in tasks {
            let body = task.response.as_deref().unwrap_or_default();
            match serde_json::from_slice::<MetaLoadResponse>(body) {
                Ok(response) => responses.push(response),
                Err(err) => {
                    tracing::warn!(error = ?err, partition = partition.id, "undecodable meta load response");
                    return;
                }
            }
        }
        let Some(first) = responses.first() else { return };
        if responses.iter().any(|response| !response.do_compare) {
            return;
        }
        if responses.iter().any(|response| response.applied_id != first.applied_id) {
            return;
        }
        let allowed = self.config.count_difference_allowed;
        if responses.iter().any(|response| response.max_inode_id.abs_diff(first.max_inode_id) > allowed) {
            tracing::warn!(
                vol = %partition.vol_name,
                partition = partition.id,
                responses = ?responses.iter().map(|r| (r.addr.clone(), r.applied_id, r.max_inode_id)).collect::<Vec<_>>(),
                "inode count is not equal across replicas",
            );
        }
        if responses.iter().any(|response| response.dentry_count.abs_diff(first.dentry_count) > allowed) {
            tracing::warn!(
                vol = %partition.vol_name,
                partition = partition.id,
                responses = ?responses.iter().map(|r| (r.addr.clone(), r.applied_id, r.dentry_count)).collect::<Vec<_>>(),
                "dentry count is not equal across replicas",
            );
        }
    }

    /// Compare data replica snapshots: extents whose CRCs diverge are
    /// recorded on the partition as files with a missing replica.
    fn check_data_consistency(&self, partition: &Partition, tasks: &[AdminTask]) {
        let mut responses = Vec::with_capacity(tasks.len());
        for task in tasks {
            let body = task.response.as_deref().unwrap_or_default();
            match serde_json::from_slice::<DataLoadResponse>(body) {
                Ok(response) => responses.push(response),
                Err(err) => {
                    tracing::warn!(error = ?err, partition = partition.id, "undecodable data load response");
                    return;
                }
            }
        }
        let Some(first) = responses.first() else { return };
        if responses.iter().any(|response| !response.do_compare) {
            return;
        }
        if responses.iter().any(|response| response.applied_id != first.applied_id) {
            return;
        }

        let min_used = responses.iter().map(|response| response.used).min().unwrap_or(0);
        let max_used = responses.iter().map(|response| response.used).max().unwrap_or(0);
        if max_used.saturating_sub(min_used) > self.config.diff_space_usage {
            tracing::warn!(
                partition = partition.id,
                min_used,
                max_used,
                "replica sizes diverge past the allowed spread",
            );
        }

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut divergent = Vec::new();
        for (extent_id, crc) in &first.extent_crcs {
            for response in &responses[1..] {
                match response.extent_crcs.get(extent_id) {
                    Some(other) if other == crc => {}
                    _ => {
                        divergent.push(*extent_id);
                        break;
                    }
                }
            }
        }
        if divergent.is_empty() {
            partition.write().files_with_missing_replica.clear();
            return;
        }
        tracing::warn!(partition = partition.id, extents = ?divergent, "extent crc mismatch across replicas");
        let mut state = partition.write();
        for extent_id in divergent {
            state.files_with_missing_replica.entry(extent_id).or_insert(now);
        }
    }

    /// Expire nodes whose heartbeats have lapsed, and prune stale replica
    /// reports from every partition.
    pub fn refresh_node_liveness(&self) {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        for kind in [NodeKind::Data, NodeKind::Meta] {
            for node in self.topology.all_nodes(kind) {
                node.refresh_liveness(now, NODE_TIMEOUT_SECS);
            }
        }
        for partition in self.partitions.all(None) {
            partition.prune_stale_replicas(now, self.config.data_partition_timeout_sec);
        }
    }

    /// Partitions whose replica set is smaller than their configured count.
    pub fn check_lack_replica_partitions(&self, kind: PartitionKind) -> Vec<Arc<Partition>> {
        self.partitions
            .all(Some(kind))
            .into_iter()
            .filter(|partition| (partition.read().hosts.len() as u8) < partition.replica_num)
            .collect()
    }

    /// Partitions with more than half of their replicas on inactive nodes
    /// (but not all of them down; those are candidates for reset instead).
    pub fn check_corrupt_partitions(&self, kind: PartitionKind) -> (Vec<String>, Vec<Arc<Partition>>) {
        let node_kind = Self::node_kind(kind);
        let inactive: Vec<String> = self
            .topology
            .all_nodes(node_kind)
            .into_iter()
            .filter(|node| !node.is_active())
            .map(|node| node.addr.clone())
            .collect();

        let mut corrupt = Vec::new();
        for partition in self.partitions.all(Some(kind)) {
            let down = partition.read().hosts.iter().filter(|host| inactive.contains(host)).count();
            let total = partition.read().hosts.len();
            if down > (partition.replica_num / 2) as usize && down != total {
                corrupt.push(partition);
            }
        }
        tracing::info!(cluster = %self.name, inactive = ?inactive, corrupt = corrupt.len(), "corruption scan finished");
        (inactive, corrupt)
    }
}
