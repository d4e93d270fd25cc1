//! Cluster-wide ID allocation.
//!
//! IDs are handed out from an in-memory counter whose high-water mark is
//! journaled before an allocation is returned, so no ID is ever reused
//! across a master failover.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ClusterResult;
use crate::journal::{Journal, KEY_MAX_COMMON_ID, KEY_MAX_DATA_PARTITION_ID, KEY_MAX_META_PARTITION_ID};

#[derive(Default)]
pub struct IdAllocator {
    common: AtomicU64,
    data_partition: AtomicU64,
    meta_partition: AtomicU64,
}

impl IdAllocator {
    /// Allocate the next cluster-wide common ID (nodes, node-sets).
    pub async fn next_common_id(&self, journal: &Journal) -> ClusterResult<u64> {
        let id = self.common.load(Ordering::SeqCst) + 1;
        journal.sync_alloc_id(KEY_MAX_COMMON_ID, id).await?;
        self.common.store(id, Ordering::SeqCst);
        Ok(id)
    }

    /// Allocate the next data-partition ID.
    pub async fn next_data_partition_id(&self, journal: &Journal) -> ClusterResult<u64> {
        let id = self.data_partition.load(Ordering::SeqCst) + 1;
        journal.sync_alloc_id(KEY_MAX_DATA_PARTITION_ID, id).await?;
        self.data_partition.store(id, Ordering::SeqCst);
        Ok(id)
    }

    /// Allocate the next meta-partition ID.
    pub async fn next_meta_partition_id(&self, journal: &Journal) -> ClusterResult<u64> {
        let id = self.meta_partition.load(Ordering::SeqCst) + 1;
        journal.sync_alloc_id(KEY_MAX_META_PARTITION_ID, id).await?;
        self.meta_partition.store(id, Ordering::SeqCst);
        Ok(id)
    }

    /// Restore high-water marks from journal replay.
    pub fn restore(&self, common: u64, data_partition: u64, meta_partition: u64) {
        self.common.fetch_max(common, Ordering::SeqCst);
        self.data_partition.fetch_max(data_partition, Ordering::SeqCst);
        self.meta_partition.fetch_max(meta_partition, Ordering::SeqCst);
    }
}
