//! Index snapshots in the backup channel, and restore from them.
//!
//! A backup is one message in the backup channel: the caption
//! `#ocltg #backup #v1 seq=<n> ts=<unix> last=<id>` plus the JSON export of
//! the index as attachment.
//!
//! Restore never touches the live index. It builds `index.restore.db.part`
//! next to it, either from the latest snapshot plus an incremental pull or
//! from the full storage-channel history. Only a finished build is renamed
//! to `index.restore.db` and the engine flagged restart-pending; the staged
//! file replaces the live one on the next start.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use msgtree_shared::fsmeta::{self, BackupTag};
use msgtree_shared::{ChannelId, MessageId};
use msgtree_store::{ImportStats, IndexSnapshot};

use crate::config::DataPaths;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::index::{commit_staged, discard_staged, LocalIndex};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::remote::{RemoteClient, RemoteFileRef};
use crate::retry::{with_retry, RetryPolicy};
use crate::state::EngineState;
use crate::sync::{SyncEngine, SyncReport};

/// How many backup-channel messages are searched for the latest snapshot.
const BACKUP_SCAN_LIMIT: usize = 50;
const BACKUP_SEQ_KEY: &str = "backup_seq";
const LAST_BACKUP_KEY: &str = "last_backup_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Snapshot loaded, then caught up with an incremental pull.
    Snapshot,
    /// Rebuilt from the start of the storage-channel history.
    FullRebuild,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub seq: u64,
    pub taken_at: DateTime<Utc>,
    /// Backup-channel message carrying the snapshot.
    pub message_id: MessageId,
    /// Last storage-channel message the snapshot had ingested.
    pub last_message_id: MessageId,
    pub size_bytes: u64,
    pub file_ref: RemoteFileRef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreOutcome {
    pub mode: RestoreMode,
    pub snapshot_seq: Option<u64>,
    pub imported: Option<ImportStats>,
    pub sync: SyncReport,
    /// Scan of the newest messages after a snapshot load.
    pub reconciled: Option<ReconcileReport>,
    pub restart_required: bool,
}

struct StagedBuild {
    mode: RestoreMode,
    imported: Option<ImportStats>,
    sync: SyncReport,
    reconciled: Option<ReconcileReport>,
}

pub struct BackupManager {
    index: LocalIndex,
    state: Arc<EngineState>,
    paths: DataPaths,
    storage_channel: ChannelId,
    backup_channel: ChannelId,
    history_page: usize,
    retry: RetryPolicy,
}

impl BackupManager {
    pub fn new(
        index: LocalIndex,
        state: Arc<EngineState>,
        paths: DataPaths,
        storage_channel: ChannelId,
        backup_channel: ChannelId,
        history_page: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            index,
            state,
            paths,
            storage_channel,
            backup_channel,
            history_page,
            retry,
        }
    }

    /// Export the index and post it to the backup channel.
    pub async fn create_backup(&self, remote: &dyn RemoteClient) -> Result<BackupInfo> {
        self.state.ensure_live()?;
        let gate = self.index.lock_writes().await;
        let snapshot = self.index.write_self_managed(&gate, |db| db.export_snapshot())?;

        let local_seq = self
            .index
            .read(|db| db.get_state(BACKUP_SEQ_KEY))?
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let remote_seq = self.find_latest_backup(remote).await?.map(|b| b.seq).unwrap_or(0);
        let seq = local_seq.max(remote_seq) + 1;

        let last_message_id = snapshot
            .cursors
            .iter()
            .find(|c| c.channel_id == self.storage_channel)
            .map(|c| c.last_message_id)
            .unwrap_or(MessageId::START);
        let payload = bytes::Bytes::from(snapshot.to_json()?);
        let size_bytes = payload.len() as u64;

        let file_ref = with_retry(&self.retry, "upload_file", || remote.upload_file(payload.clone())).await?;
        let caption = fsmeta::encode_backup(&BackupTag {
            seq,
            taken_at: snapshot.exported_at.timestamp(),
            last_message_id,
        });
        let message_id = with_retry(&self.retry, "send_message", || {
            remote.send_message(self.backup_channel, &caption, Some(&file_ref))
        })
        .await?;

        self.index.write(&gate, |db| {
            db.set_state(BACKUP_SEQ_KEY, &seq.to_string())?;
            db.set_state(LAST_BACKUP_KEY, &snapshot.exported_at.to_rfc3339())
        })?;
        drop(gate);

        tracing::info!(
            seq,
            message_id = %message_id,
            directories = snapshot.directories.len(),
            files = snapshot.files.len(),
            size_bytes,
            "backup created"
        );
        self.state
            .events()
            .emit(EngineEvent::BackupCreated { seq, message_id });

        Ok(BackupInfo {
            seq,
            taken_at: snapshot.exported_at,
            message_id,
            last_message_id,
            size_bytes,
            file_ref,
        })
    }

    /// Newest snapshot (highest sequence number) in the backup channel.
    pub async fn find_latest_backup(&self, remote: &dyn RemoteClient) -> Result<Option<BackupInfo>> {
        let recent = with_retry(&self.retry, "get_recent", || {
            remote.get_recent(self.backup_channel, BACKUP_SCAN_LIMIT)
        })
        .await?;

        let latest = recent
            .into_iter()
            .filter_map(|m| {
                let tag = fsmeta::parse_backup(&m.text).ok()?;
                let attachment = m.attachment?;
                Some(BackupInfo {
                    seq: tag.seq,
                    taken_at: Utc.timestamp_opt(tag.taken_at, 0).single()?,
                    message_id: m.id,
                    last_message_id: tag.last_message_id,
                    size_bytes: attachment.size_bytes,
                    file_ref: attachment.file_ref,
                })
            })
            .max_by_key(|b| (b.seq, b.message_id));
        Ok(latest)
    }

    /// Build a replacement index from the latest backup or from history.
    ///
    /// Holds the write gate of the live index throughout, so no sync or
    /// mutation interleaves. Ends with the engine restart-pending.
    pub async fn restore_from_backup(&self, remote: &dyn RemoteClient) -> Result<RestoreOutcome> {
        self.state.ensure_live()?;
        let _gate = self.index.lock_writes().await;

        let latest = self.find_latest_backup(remote).await?;
        let newest_primary = with_retry(&self.retry, "get_recent", || {
            remote.get_recent(self.storage_channel, 1)
        })
        .await?
        .into_iter()
        .next();

        let mode = match (&latest, &newest_primary) {
            (None, _) => RestoreMode::FullRebuild,
            (Some(_), None) => RestoreMode::Snapshot,
            (Some(b), Some(m)) if b.taken_at >= m.date => RestoreMode::Snapshot,
            (Some(b), Some(m)) => {
                tracing::info!(
                    snapshot_at = %b.taken_at,
                    newest_message_at = %m.date,
                    "snapshot is older than the storage channel, rebuilding from history"
                );
                RestoreMode::FullRebuild
            }
        };

        discard_staged(&self.paths)?;
        let built = match self.build_staged(remote, mode, latest.as_ref()).await {
            Ok(built) => built,
            Err(e) => {
                if let Err(cleanup) = discard_staged(&self.paths) {
                    tracing::warn!(error = %cleanup, "could not remove unfinished restore");
                }
                tracing::error!(error = %e, "restore failed, live index kept");
                return Err(e);
            }
        };
        commit_staged(&self.paths)?;

        let mode = built.mode;
        self.state.mark_restart_pending();
        tracing::info!(?mode, applied = built.sync.applied, "restore staged, restart required");
        self.state.events().emit(EngineEvent::RestoreStaged { mode });

        Ok(RestoreOutcome {
            mode,
            snapshot_seq: match mode {
                RestoreMode::Snapshot => latest.map(|b| b.seq),
                RestoreMode::FullRebuild => None,
            },
            imported: built.imported,
            sync: built.sync,
            reconciled: built.reconciled,
            restart_required: true,
        })
    }

    /// Build the replacement index in the scratch file. Nothing there is
    /// promoted until [`commit_staged`] renames it.
    async fn build_staged(
        &self,
        remote: &dyn RemoteClient,
        mut mode: RestoreMode,
        latest: Option<&BackupInfo>,
    ) -> Result<StagedBuild> {
        let staged = LocalIndex::open_at(&self.paths.restore_scratch_db)?;

        let mut imported = None;
        if let (RestoreMode::Snapshot, Some(backup)) = (mode, latest) {
            match self.load_snapshot(remote, backup).await {
                Ok(snapshot) => {
                    let gate = staged.lock_writes().await;
                    imported = Some(staged.write_self_managed(&gate, |db| db.import_snapshot(&snapshot))?);
                }
                Err(EngineError::Backup(reason)) => {
                    tracing::warn!(seq = backup.seq, %reason, "snapshot unusable, rebuilding from history");
                    mode = RestoreMode::FullRebuild;
                }
                Err(e) => return Err(e),
            }
        }

        // Its own state: the live engine is still running on the old index.
        let staging_state = Arc::new(EngineState::new(self.state.events().clone()));
        let sync = SyncEngine::new(staged.clone(), staging_state.clone(), self.history_page, self.retry);
        let report = sync.pull(remote, self.storage_channel).await?;

        // The pull only sees messages after the snapshot's cursor. In-place
        // edits made since the backup (renames, tombstones) are caught by a
        // scan of the newest messages. Forced: an empty channel leaves no
        // cursor even though the pull just ran.
        let reconciled = match mode {
            RestoreMode::Snapshot => {
                let reconciler = Reconciler::new(staged.clone(), staging_state, self.storage_channel, self.retry);
                Some(reconciler.reconcile_recent(remote, self.history_page, true).await?)
            }
            RestoreMode::FullRebuild => None,
        };
        staged.checkpoint()?;
        Ok(StagedBuild {
            mode,
            imported,
            sync: report,
            reconciled,
        })
    }

    async fn load_snapshot(&self, remote: &dyn RemoteClient, backup: &BackupInfo) -> Result<IndexSnapshot> {
        let data = with_retry(&self.retry, "download_file", || remote.download_file(&backup.file_ref)).await?;
        IndexSnapshot::from_json(&data).map_err(|e| EngineError::Backup(e.to_string()))
    }
}

/// Convert the configured interval, treating zero as "disabled".
pub fn effective_interval(interval: Option<Duration>) -> Option<Duration> {
    interval.filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use msgtree_shared::fsmeta::{encode_dir, encode_tombstone, DirMeta, Tombstone};
    use msgtree_store::RecordRef;

    use super::*;
    use crate::error::RemoteError;
    use crate::remote::memory::{MemoryRemote, RemoteOp};

    const STORAGE: ChannelId = ChannelId(1);
    const BACKUPS: ChannelId = ChannelId(2);

    fn manager(dir: &std::path::Path) -> (BackupManager, SyncEngine, Arc<EngineState>) {
        let paths = DataPaths::new(dir);
        let index = LocalIndex::open(&paths).unwrap();
        let state = Arc::new(EngineState::default());
        let sync = SyncEngine::new(index.clone(), state.clone(), 10, RetryPolicy::immediate(1));
        let mgr = BackupManager::new(
            index,
            state.clone(),
            paths,
            STORAGE,
            BACKUPS,
            10,
            RetryPolicy::immediate(1),
        );
        (mgr, sync, state)
    }

    fn dir_tag(id: &str) -> String {
        encode_dir(&DirMeta {
            dir_id: id.into(),
            parent_id: None,
            name: id.to_uppercase(),
        })
    }

    #[tokio::test]
    async fn sequence_numbers_increase() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, sync, _) = manager(tmp.path());
        let remote = MemoryRemote::new();
        remote.inject(STORAGE, &dir_tag("d1"), None);
        sync.pull(&remote, STORAGE).await.unwrap();

        let first = mgr.create_backup(&remote).await.unwrap();
        let second = mgr.create_backup(&remote).await.unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(first.last_message_id, MessageId(1));

        let latest = mgr.find_latest_backup(&remote).await.unwrap().unwrap();
        assert_eq!(latest.seq, 2);
        assert!(remote.messages(BACKUPS)[0].text.starts_with("#ocltg #backup #v1 seq=1 "));
    }

    #[tokio::test]
    async fn fresh_snapshot_is_loaded_directly() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, sync, state) = manager(tmp.path());
        let remote = MemoryRemote::new();
        remote.inject(STORAGE, &dir_tag("d1"), None);
        sync.pull(&remote, STORAGE).await.unwrap();
        mgr.create_backup(&remote).await.unwrap();

        let out = mgr.restore_from_backup(&remote).await.unwrap();
        assert_eq!(out.mode, RestoreMode::Snapshot);
        assert_eq!(out.snapshot_seq, Some(1));
        assert_eq!(out.imported.unwrap().directories_imported, 1);
        assert_eq!(out.sync.fetched, 0);
        assert!(state.restart_pending());
        assert!(tmp.path().join("index.restore.db").exists());
    }

    #[tokio::test]
    async fn stale_snapshot_triggers_full_rebuild() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, sync, _) = manager(tmp.path());
        let remote = MemoryRemote::new();
        remote.inject(STORAGE, &dir_tag("d1"), None);
        sync.pull(&remote, STORAGE).await.unwrap();
        mgr.create_backup(&remote).await.unwrap();

        remote.set_clock(Utc::now() + chrono::Duration::days(1));
        remote.inject(STORAGE, &dir_tag("d2"), None);

        let out = mgr.restore_from_backup(&remote).await.unwrap();
        assert_eq!(out.mode, RestoreMode::FullRebuild);
        assert!(out.imported.is_none());
        assert_eq!(out.sync.applied, 2);
    }

    #[tokio::test]
    async fn no_backup_means_full_rebuild_and_blocks_further_work() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, _, _) = manager(tmp.path());
        let remote = MemoryRemote::new();
        remote.inject(STORAGE, &dir_tag("d1"), None);

        let out = mgr.restore_from_backup(&remote).await.unwrap();
        assert_eq!(out.mode, RestoreMode::FullRebuild);
        assert!(matches!(
            mgr.create_backup(&remote).await,
            Err(EngineError::RestartRequired)
        ));
    }

    #[tokio::test]
    async fn corrupt_snapshot_falls_back_to_history() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, _, _) = manager(tmp.path());
        let remote = MemoryRemote::new();
        remote.inject(STORAGE, &dir_tag("d1"), None);
        let junk = remote.put_file(bytes::Bytes::from_static(b"{not json"));
        remote.set_clock(Utc::now() + chrono::Duration::days(1));
        remote.inject(BACKUPS, "#ocltg #backup #v1 seq=4 ts=9999999999 last=1", Some(junk));

        let out = mgr.restore_from_backup(&remote).await.unwrap();
        assert_eq!(out.mode, RestoreMode::FullRebuild);
        assert_eq!(out.sync.applied, 1);
    }

    #[tokio::test]
    async fn failed_restore_keeps_the_live_index() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, sync, state) = manager(tmp.path());
        let remote = MemoryRemote::new();
        remote.inject(STORAGE, &dir_tag("d1"), None);
        sync.pull(&remote, STORAGE).await.unwrap();

        remote.fail_next(RemoteOp::History, 1, RemoteError::Unavailable("down".into()));
        let err = mgr.restore_from_backup(&remote).await.unwrap_err();
        assert_eq!(err.code(), "REMOTE_UNAVAILABLE");
        assert!(!state.restart_pending());
        assert!(!tmp.path().join("index.restore.db").exists());
        assert!(!tmp.path().join("index.restore.db.part").exists());

        let reopened = LocalIndex::open(&DataPaths::new(tmp.path())).unwrap();
        let dirs = reopened.read(|db| db.list_directories()).unwrap();
        assert_eq!(dirs.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_restore_flags_records_deleted_after_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, sync, _) = manager(tmp.path());
        let remote = MemoryRemote::new();
        let d1 = remote.inject(STORAGE, &dir_tag("d1"), None);
        remote.inject(STORAGE, &dir_tag("d2"), None);
        sync.pull(&remote, STORAGE).await.unwrap();
        mgr.create_backup(&remote).await.unwrap();

        // Edited in place, so no newer message date and no id past the cursor.
        remote.overwrite(STORAGE, d1, &encode_tombstone(&Tombstone::Dir("d1".into())));

        let out = mgr.restore_from_backup(&remote).await.unwrap();
        assert_eq!(out.mode, RestoreMode::Snapshot);
        assert_eq!(out.sync.fetched, 0);
        let reconciled = out.reconciled.unwrap();
        assert_eq!(reconciled.marked_broken, vec![RecordRef::Dir("d1".into())]);

        let staged = LocalIndex::open_at(&tmp.path().join("index.restore.db")).unwrap();
        assert!(staged.read(|db| db.get_directory("d1")).unwrap().is_broken);
        assert!(!staged.read(|db| db.get_directory("d2")).unwrap().is_broken);
    }
}
