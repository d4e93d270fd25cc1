//! The volume registry.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use nimbus_core::{ClusterError, VolumeId};

/// Volume lifecycle status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeStatus {
    #[default]
    Normal,
    MarkedDelete,
}

/// A volume of the file system.
///
/// The partition lifecycle core only consumes a volume's identity and its
/// configured replica counts; everything else about volumes (quotas, client
/// surface) lives outside the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    /// Replica count for this volume's data partitions.
    pub dp_replica_num: u8,
    /// Replica count for this volume's meta partitions.
    pub mp_replica_num: u8,
    pub status: VolumeStatus,
    pub capacity: u64,
    pub owner: String,
    pub zone_name: String,
    pub cross_zone: bool,
    pub create_time: i64,
}

/// In-memory index of all volumes.
#[derive(Default)]
pub struct VolumeRegistry {
    by_name: DashMap<String, Arc<Volume>>,
    by_id: DashMap<VolumeId, Arc<Volume>>,
}

impl VolumeRegistry {
    pub fn put(&self, vol: Volume) {
        let vol = Arc::new(vol);
        self.by_id.insert(vol.id, vol.clone());
        self.by_name.insert(vol.name.clone(), vol);
    }

    pub fn remove(&self, name: &str) {
        if let Some((_, vol)) = self.by_name.remove(name) {
            self.by_id.remove(&vol.id);
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Volume>, ClusterError> {
        self.by_name.get(name).map(|v| v.value().clone()).ok_or_else(|| ClusterError::NotFound {
            kind: "volume",
            key: name.to_string(),
        })
    }

    pub fn get_by_id(&self, id: VolumeId) -> Result<Arc<Volume>, ClusterError> {
        self.by_id.get(&id).map(|v| v.value().clone()).ok_or_else(|| ClusterError::NotFound {
            kind: "volume",
            key: id.to_string(),
        })
    }

    /// Snapshot of all volumes.
    pub fn all(&self) -> Vec<Arc<Volume>> {
        self.by_id.iter().map(|entry| entry.value().clone()).collect()
    }
}
