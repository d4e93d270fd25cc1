//! The extent-store probe surface.
//!
//! The on-disk storage engine is outside the core; the replica daemons only
//! consume size and CRC probes from it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Probes the replica daemons issue against the storage engine.
pub trait ExtentStore: Send + Sync + 'static {
    /// Total stored bytes across extents up to and including the given
    /// extent ID.
    fn store_size_to_extent(&self, max_extent_id: u64) -> u64;

    /// The highest extent ID present in the store.
    fn max_extent_id(&self) -> u64;

    /// CRC32 per extent file.
    fn extent_crcs(&self) -> BTreeMap<u64, u32>;
}

/// An in-memory extent store used by tests and bootstrap.
#[derive(Default)]
pub struct MemoryExtentStore {
    extents: RwLock<BTreeMap<u64, (u64, u32)>>,
}

impl MemoryExtentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_extent(&self, extent_id: u64, size: u64, crc: u32) {
        self.extents.write().insert(extent_id, (size, crc));
    }
}

impl ExtentStore for MemoryExtentStore {
    fn store_size_to_extent(&self, max_extent_id: u64) -> u64 {
        self.extents
            .read()
            .iter()
            .filter(|(id, _)| **id <= max_extent_id)
            .map(|(_, (size, _))| size)
            .sum()
    }

    fn max_extent_id(&self) -> u64 {
        self.extents.read().keys().next_back().copied().unwrap_or(0)
    }

    fn extent_crcs(&self) -> BTreeMap<u64, u32> {
        self.extents.read().iter().map(|(id, (_, crc))| (*id, *crc)).collect()
    }
}
