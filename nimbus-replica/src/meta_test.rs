use anyhow::Result;

use nimbus_core::types::Peer;

use crate::meta::{
    self, CreateType, PartitionManifest, APPLY_INDEX_FILE, SNAPSHOT_BACKUP_DIR, SNAPSHOT_DIR, SNAPSHOT_SIGN_FILE, TEMP_APPLY_INDEX_FILE,
};

#[tokio::test]
async fn test_applied_id_store_and_load() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    assert_eq!(meta::load_applied_id(tmpdir.path()).await?, None, "a fresh dir has no apply index");

    meta::store_applied_id(tmpdir.path(), 12345).await?;
    assert_eq!(meta::load_applied_id(tmpdir.path()).await?, Some(12345));

    // The live file holds a single decimal integer, and no temp file is
    // left behind.
    let raw = tokio::fs::read_to_string(tmpdir.path().join(APPLY_INDEX_FILE)).await?;
    assert_eq!(raw, "12345");
    assert!(!tmpdir.path().join(TEMP_APPLY_INDEX_FILE).exists());

    meta::store_applied_id(tmpdir.path(), 23456).await?;
    assert_eq!(meta::load_applied_id(tmpdir.path()).await?, Some(23456));
    Ok(())
}

#[tokio::test]
async fn test_manifest_roundtrip() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let manifest = PartitionManifest {
        partition_id: 77,
        vol_name: "v".into(),
        hosts: vec!["a:17310".into(), "b:17310".into()],
        peers: vec![Peer::new(1, "a:17310"), Peer::new(2, "b:17310")],
        learners: vec![],
        create_type: CreateType::Repair,
        inode_range: Some((0, 1 << 24)),
        last_truncate_id: 400,
    };
    meta::store_manifest(tmpdir.path(), &manifest).await?;
    let loaded = meta::load_manifest(tmpdir.path()).await?.expect("missing manifest");
    assert_eq!(loaded, manifest);
    Ok(())
}

#[tokio::test]
async fn test_snapshot_sign_and_verify() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let dir = tmpdir.path().join(SNAPSHOT_DIR);
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join("inode"), b"inode-data").await?;
    tokio::fs::write(dir.join("dentry"), b"dentry-data").await?;

    meta::sign_snapshot(&dir).await?;
    let sign = tokio::fs::read_to_string(dir.join(SNAPSHOT_SIGN_FILE)).await?;
    assert_eq!(sign.lines().count(), 2, "one crc line per present file");
    meta::verify_snapshot(&dir).await?;

    // Corruption is detected.
    tokio::fs::write(dir.join("inode"), b"tampered").await?;
    assert!(meta::verify_snapshot(&dir).await.is_err(), "expected a crc mismatch to be detected");
    Ok(())
}

#[tokio::test]
async fn test_snapshot_rotation() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let root = tmpdir.path();
    let live = root.join(SNAPSHOT_DIR);
    tokio::fs::create_dir_all(&live).await?;
    tokio::fs::write(live.join("inode"), b"generation-1").await?;

    let staged = root.join("snapshot_staged");
    tokio::fs::create_dir_all(&staged).await?;
    tokio::fs::write(staged.join("inode"), b"generation-2").await?;

    meta::rotate_snapshot(root, &staged).await?;
    assert_eq!(tokio::fs::read(root.join(SNAPSHOT_DIR).join("inode")).await?, b"generation-2");
    assert_eq!(tokio::fs::read(root.join(SNAPSHOT_BACKUP_DIR).join("inode")).await?, b"generation-1");
    assert!(!staged.exists());

    // A second rotation replaces the old backup.
    let staged = root.join("snapshot_staged");
    tokio::fs::create_dir_all(&staged).await?;
    tokio::fs::write(staged.join("inode"), b"generation-3").await?;
    meta::rotate_snapshot(root, &staged).await?;
    assert_eq!(tokio::fs::read(root.join(SNAPSHOT_DIR).join("inode")).await?, b"generation-3");
    assert_eq!(tokio::fs::read(root.join(SNAPSHOT_BACKUP_DIR).join("inode")).await?, b"generation-2");
    Ok(())
}
