use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;

use msgtree_engine::remote::memory::{MemoryRemote, RemoteOp};
use msgtree_engine::retry::RetryPolicy;
use msgtree_engine::secrets::MemoryKeychain;
use msgtree_engine::{Engine, EngineConfig, RestoreMode};
use msgtree_shared::crypto::{content_fingerprint, KdfParams};
use msgtree_shared::fsmeta::{encode_file, FileMeta};
use msgtree_shared::ChannelId;
use msgtree_store::RecordRef;

const STORAGE: ChannelId = ChannelId(1);

fn config(dir: &Path, page: usize) -> EngineConfig {
    let mut config = EngineConfig::with_data_dir(dir);
    config.history_page = page;
    config.retry = RetryPolicy::immediate(2);
    config.backup_interval = None;
    config.kdf = KdfParams {
        memory_kib: 8,
        iterations: 1,
        parallelism: 1,
    };
    config
}

async fn engine(dir: &Path, page: usize, remote: &Arc<MemoryRemote>) -> Result<Engine> {
    let engine = Engine::open(config(dir, page), Arc::new(MemoryKeychain::default())).await?;
    engine.attach_remote(remote.clone());
    Ok(engine)
}

#[tokio::test]
async fn create_and_upload_produce_the_documented_tags() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine(tmp.path(), 100, &remote).await?;

    let a = engine.create_directory(None, "A").await?;
    let payload = Bytes::from_static(b"some file content");
    let x = engine.upload_file(&a.id, "x.txt", payload.clone()).await?;

    let msgs = remote.messages(STORAGE);
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].text, format!("#ocltg #v1 #dir d={} p=ROOT name=A", a.id));
    assert_eq!(
        msgs[1].text,
        format!("#ocltg #v1 #file d={} f={} n=x.txt h={}", a.id, x.id, x.content_hash)
    );
    assert_eq!(x.content_hash, content_fingerprint(&payload));
    assert_eq!(x.size_bytes, payload.len() as u64);
    assert_eq!(engine.download_file(&x.id).await?, payload);
    Ok(())
}

#[tokio::test]
async fn deleting_a_non_empty_directory_changes_nothing() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine(tmp.path(), 100, &remote).await?;
    let a = engine.create_directory(None, "A").await?;
    engine.upload_file(&a.id, "x.txt", Bytes::from_static(b"x")).await?;

    let dirs_before = engine.list_directories()?;
    let files_before = engine.list_files(&a.id)?;
    let msgs_before = remote.messages(STORAGE);

    let err = engine.delete_directory(&a.id).await.unwrap_err();
    assert_eq!(err.code(), "PRECONDITION_FAILED");
    assert_eq!(engine.list_directories()?, dirs_before);
    assert_eq!(engine.list_files(&a.id)?, files_before);
    assert_eq!(remote.messages(STORAGE), msgs_before);
    Ok(())
}

#[tokio::test]
async fn incremental_and_full_sync_converge() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new());
    let writer_dir = tempfile::tempdir()?;
    let writer = engine(writer_dir.path(), 100, &remote).await?;

    let a = writer.create_directory(None, "A").await?;
    let b = writer.create_directory(Some(&a.id), "B").await?;
    let f = writer.upload_file(&b.id, "one.bin", Bytes::from_static(b"1")).await?;
    remote.inject(STORAGE, "unrelated chatter", None);
    writer.move_directory(&b.id, None).await?;
    writer.rename_file(&f.id, "uno.bin").await?;
    let c = writer.create_directory(None, "C").await?;
    writer.move_file(&f.id, &c.id).await?;
    writer.delete_directory(&a.id).await?;

    // Small pages so the pull spans several batches.
    let reader_dir = tempfile::tempdir()?;
    let reader = engine(reader_dir.path(), 2, &remote).await?;
    let first = reader.sync_now().await?;
    assert!(first.batches > 1);
    assert_eq!(first.tombstones, 1);
    assert_eq!(first.malformed, 0);

    let d = writer.create_directory(Some(&c.id), "D").await?;
    writer.upload_file(&d.id, "two.bin", Bytes::from_static(b"2")).await?;
    reader.sync_now().await?;

    // Applying everything again changes nothing.
    let dirs = reader.list_directories()?;
    let files = reader.search_files(&Default::default())?;
    let again = reader.full_resync().await?;
    assert_eq!(again.malformed, 0);
    assert_eq!(reader.list_directories()?, dirs);
    assert_eq!(reader.search_files(&Default::default())?, files);

    let full_dir = tempfile::tempdir()?;
    let full = engine(full_dir.path(), 1000, &remote).await?;
    full.full_resync().await?;

    assert_eq!(full.list_directories()?, dirs);
    assert_eq!(full.search_files(&Default::default())?, files);
    let names: Vec<_> = full.tree()?.into_iter().map(|n| n.name).collect();
    assert_eq!(names, vec!["B", "C"]);
    assert_eq!(full.list_files(&c.id)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn cancelled_upload_leaves_no_metadata_message() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine(tmp.path(), 100, &remote).await?;
    let a = engine.create_directory(None, "A").await?;
    remote.set_latency(RemoteOp::Upload, Duration::from_secs(5));

    let attempt = tokio::time::timeout(
        Duration::from_millis(50),
        engine.upload_file(&a.id, "big.bin", Bytes::from(vec![7u8; 4096])),
    )
    .await;
    assert!(attempt.is_err());

    let file_tags = remote
        .messages(STORAGE)
        .iter()
        .filter(|m| m.text.contains("#file"))
        .count();
    assert_eq!(file_tags, 0);
    assert!(engine.list_files(&a.id)?.is_empty());

    // The write gate was released by the cancellation.
    engine.create_directory(None, "B").await?;
    Ok(())
}

#[tokio::test]
async fn reconcile_needs_a_sync_unless_forced() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine(tmp.path(), 100, &remote).await?;

    let err = engine.reconcile_recent(Some(100), false).await.unwrap_err();
    assert_eq!(err.code(), "SYNC_REQUIRED_FIRST");
    assert_eq!(err.to_failure().kind, msgtree_engine::ErrorKind::Precondition);

    let report = engine.reconcile_recent(Some(100), true).await?;
    assert!(report.forced);
    Ok(())
}

#[tokio::test]
async fn hash_mismatch_is_flagged_then_repaired_from_cache() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine(tmp.path(), 100, &remote).await?;
    let a = engine.create_directory(None, "A").await?;
    let f = engine.upload_file(&a.id, "x.txt", Bytes::from_static(b"abc")).await?;
    engine.sync_now().await?;

    let old_msg = f.remote_message_id.unwrap();
    remote.overwrite(
        STORAGE,
        old_msg,
        &encode_file(&FileMeta {
            dir_id: a.id.clone(),
            file_id: f.id.clone(),
            name: "x.txt".into(),
            content_hash: "0000000000000000".into(),
        }),
    );

    let report = engine.reconcile_recent(None, false).await?;
    assert_eq!(report.marked_broken, vec![RecordRef::File(f.id.clone())]);
    assert_eq!(engine.list_broken()?.files.len(), 1);

    let outcome = engine.repair_file(&f.id, None).await?;
    assert!(outcome.message_id > old_msg);
    assert!(engine.list_broken()?.is_empty());

    // The index now agrees with the channel again.
    let report = engine.reconcile_recent(None, false).await?;
    assert!(report.marked_broken.is_empty());
    Ok(())
}

#[tokio::test]
async fn repair_without_cached_payload_asks_for_a_source() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new());
    let writer_dir = tempfile::tempdir()?;
    let writer = engine(writer_dir.path(), 100, &remote).await?;
    let a = writer.create_directory(None, "A").await?;
    let payload = Bytes::from_static(b"original bytes");
    let f = writer.upload_file(&a.id, "doc.pdf", payload.clone()).await?;
    writer.create_directory(None, "B").await?;

    // A second install never downloaded the payload.
    let reader_dir = tempfile::tempdir()?;
    let reader = engine(reader_dir.path(), 100, &remote).await?;
    reader.sync_now().await?;
    remote.delete_message(STORAGE, f.remote_message_id.unwrap());
    reader.reconcile_recent(None, false).await?;

    let err = reader.repair_file(&f.id, None).await.unwrap_err();
    assert_eq!(err.code(), "NEED_SOURCE_FILE");
    let err = reader
        .repair_file(&f.id, Some(Bytes::from_static(b"wrong")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "HASH_MISMATCH");
    assert_eq!(reader.list_broken()?.files.len(), 1);

    reader.repair_file(&f.id, Some(payload)).await?;
    assert!(reader.list_broken()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn stale_backup_restores_by_full_rebuild() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine(tmp.path(), 100, &remote).await?;
    engine.create_directory(None, "A").await?;
    engine.sync_now().await?;
    let backup = engine.create_backup().await?;
    assert_eq!(backup.seq, 1);

    // Newer primary-channel activity than the snapshot.
    remote.set_clock(Utc::now() + chrono::Duration::days(1));
    engine.create_directory(None, "B").await?;

    let outcome = engine.restore_from_backup().await?;
    assert_eq!(outcome.mode, RestoreMode::FullRebuild);
    assert!(outcome.restart_required);

    let err = engine.create_directory(None, "C").await.unwrap_err();
    assert_eq!(err.code(), "RESTART_REQUIRED");
    assert!(engine.sync_now().await.is_err());
    drop(engine);

    let reopened = engine_reopen(tmp.path(), &remote).await?;
    let names: Vec<_> = reopened.tree()?.into_iter().map(|n| n.name).collect();
    assert_eq!(names, vec!["A", "B"]);
    reopened.create_directory(None, "C").await?;
    Ok(())
}

#[tokio::test]
async fn fresh_backup_is_loaded_directly() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine(tmp.path(), 100, &remote).await?;
    engine.create_directory(None, "A").await?;
    engine.sync_now().await?;
    engine.create_backup().await?;

    let outcome = engine.restore_from_backup().await?;
    assert_eq!(outcome.mode, RestoreMode::Snapshot);
    assert_eq!(outcome.snapshot_seq, Some(1));
    Ok(())
}

async fn engine_reopen(dir: &Path, remote: &Arc<MemoryRemote>) -> Result<Engine> {
    engine(dir, 100, remote).await
}
