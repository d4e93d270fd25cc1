//! The partition metadata sidecar.
//!
//! Each replica keeps a small JSON manifest next to its data, an
//! `ApplyIndex` file holding the last applied ID as a single decimal
//! integer (written via temp-file-plus-rename), and a signed `snapshot/`
//! directory whose previous generation is rotated into `snapshot_backup/`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use nimbus_core::types::{Learner, Peer};
use nimbus_core::PartitionId;

pub const PARTITION_META_FILE: &str = "partition_meta.json";
const TEMP_PARTITION_META_FILE: &str = ".partition_meta.json.tmp";
pub const APPLY_INDEX_FILE: &str = "ApplyIndex";
pub const TEMP_APPLY_INDEX_FILE: &str = "TempApplyIndex";
pub const SNAPSHOT_DIR: &str = "snapshot";
pub const SNAPSHOT_BACKUP_DIR: &str = "snapshot_backup";
pub const SNAPSHOT_SIGN_FILE: &str = "SNAPSHOT_SIGN";
/// The files a snapshot generation carries, each signed with a CRC line.
pub const SNAPSHOT_FILES: [&str; 5] = ["inode", "dentry", "extend", "multipart", "apply"];

/// How this replica was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateType {
    #[default]
    Normal,
    /// Created to backfill an existing group; raft start is deferred until
    /// the local store has caught up with the leader.
    Repair,
}

/// The on-disk manifest of a replica.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub partition_id: PartitionId,
    pub vol_name: String,
    pub hosts: Vec<String>,
    pub peers: Vec<Peer>,
    pub learners: Vec<Learner>,
    pub create_type: CreateType,
    /// Inode range, meta partitions only.
    pub inode_range: Option<(u64, u64)>,
    pub last_truncate_id: u64,
}

/// Persist the manifest atomically.
pub async fn store_manifest(dir: &Path, manifest: &PartitionManifest) -> Result<()> {
    let data = serde_json::to_vec_pretty(manifest).context("error encoding partition manifest")?;
    write_atomic(dir, TEMP_PARTITION_META_FILE, PARTITION_META_FILE, &data).await
}

/// Load the manifest, if one exists.
pub async fn load_manifest(dir: &Path) -> Result<Option<PartitionManifest>> {
    let path = dir.join(PARTITION_META_FILE);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context("error reading partition manifest"),
    };
    let manifest = serde_json::from_slice(&data).context("error decoding partition manifest")?;
    Ok(Some(manifest))
}

/// Persist the applied ID: write the temp file, fsync, rename over the
/// live file.
pub async fn store_applied_id(dir: &Path, applied_id: u64) -> Result<()> {
    write_atomic(dir, TEMP_APPLY_INDEX_FILE, APPLY_INDEX_FILE, applied_id.to_string().as_bytes()).await
}

/// Load the applied ID, `None` when no index file exists yet.
pub async fn load_applied_id(dir: &Path) -> Result<Option<u64>> {
    let path = dir.join(APPLY_INDEX_FILE);
    let data = match tokio::fs::read_to_string(&path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context("error reading apply index"),
    };
    if data.trim().is_empty() {
        bail!("apply index file is empty");
    }
    let applied_id = data.trim().parse::<u64>().context("error parsing apply index")?;
    Ok(Some(applied_id))
}

async fn write_atomic(dir: &Path, temp_name: &str, live_name: &str, data: &[u8]) -> Result<()> {
    let temp = dir.join(temp_name);
    let live = dir.join(live_name);
    let mut file = tokio::fs::File::create(&temp).await.context("error creating temp file")?;
    file.write_all(data).await.context("error writing temp file")?;
    file.sync_all().await.context("error syncing temp file")?;
    drop(file);
    tokio::fs::rename(&temp, &live).await.context("error renaming temp file into place")?;
    Ok(())
}

/// Sign the snapshot files present in `dir`, writing one `<name> <crc>`
/// line per file into `SNAPSHOT_SIGN`.
pub async fn sign_snapshot(dir: &Path) -> Result<()> {
    let mut lines = String::new();
    for name in SNAPSHOT_FILES {
        let path = dir.join(name);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err).with_context(|| format!("error reading snapshot file {}", name)),
        };
        let crc = crc32fast::hash(&data);
        lines.push_str(&format!("{} {}\n", name, crc));
    }
    tokio::fs::write(dir.join(SNAPSHOT_SIGN_FILE), lines.as_bytes())
        .await
        .context("error writing snapshot signature")?;
    Ok(())
}

/// Verify every signed snapshot file against its recorded CRC.
pub async fn verify_snapshot(dir: &Path) -> Result<()> {
    let sign = tokio::fs::read_to_string(dir.join(SNAPSHOT_SIGN_FILE))
        .await
        .context("error reading snapshot signature")?;
    let mut recorded = BTreeMap::new();
    for line in sign.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(crc)) = (parts.next(), parts.next()) else {
            bail!("malformed snapshot signature line: {:?}", line);
        };
        recorded.insert(name.to_string(), crc.parse::<u32>().context("error parsing snapshot crc")?);
    }
    for (name, expected) in recorded {
        let data = tokio::fs::read(dir.join(&name))
            .await
            .with_context(|| format!("error reading snapshot file {}", name))?;
        let actual = crc32fast::hash(&data);
        if actual != expected {
            bail!("snapshot file {} crc mismatch: recorded {} actual {}", name, expected, actual);
        }
    }
    Ok(())
}

/// Rotate a freshly staged snapshot into place: the previous `snapshot/`
/// moves to `snapshot_backup/` (replacing any older backup) before the
/// staged directory is renamed in.
pub async fn rotate_snapshot(root: &Path, staged: &Path) -> Result<()> {
    let live = root.join(SNAPSHOT_DIR);
    let backup = root.join(SNAPSHOT_BACKUP_DIR);
    if tokio::fs::metadata(&live).await.is_ok() {
        if tokio::fs::metadata(&backup).await.is_ok() {
            tokio::fs::remove_dir_all(&backup).await.context("error removing old snapshot backup")?;
        }
        tokio::fs::rename(&live, &backup).await.context("error rotating snapshot to backup")?;
    }
    tokio::fs::rename(staged, &live).await.context("error renaming staged snapshot into place")?;
    Ok(())
}
