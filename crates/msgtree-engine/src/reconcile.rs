//! Bounded re-verification of the newest storage-channel messages against
//! the Local Index.
//!
//! Divergence is only ever flagged, never resolved here: reconciliation
//! does not move the sync cursor and does not clear broken flags.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use msgtree_shared::fsmeta::{self, DirMeta, FileMeta, TagRecord, Tombstone};
use msgtree_shared::{ChannelId, MessageId};
use msgtree_store::{
    ApplyOutcome, Database, DirUpsert, FileUpsert, RecordRef, RemoteLocation,
};

use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::index::LocalIndex;
use crate::remote::{RemoteClient, RemoteMessage};
use crate::retry::{with_retry, RetryPolicy};
use crate::state::EngineState;

/// State key holding the time of the last finished reconciliation.
pub const LAST_RECONCILE_KEY: &str = "last_reconcile_at";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Messages fetched from the remote.
    pub scanned: usize,
    /// Lowest and highest message id of the scan.
    pub window: Option<(MessageId, MessageId)>,
    /// Tags whose record was missing locally.
    pub inserted: usize,
    /// Tags newer than the record the index held.
    pub updated: usize,
    pub consistent: usize,
    pub marked_broken: Vec<RecordRef>,
    /// Index records at or after the oldest scanned message whose message
    /// was not returned.
    pub missing_remote: usize,
    pub unrecognized: usize,
    pub malformed: usize,
    /// The scan ran without a sync cursor.
    pub forced: bool,
}

impl ReconcileReport {
    fn flag(&mut self, db: &Database, record: RecordRef, reason: &str) -> msgtree_store::Result<()> {
        if self.marked_broken.contains(&record) {
            return Ok(());
        }
        let existed = match &record {
            RecordRef::Dir(id) => db.set_directory_broken(id, true)?,
            RecordRef::File(id) => db.set_file_broken(id, true)?,
        };
        if existed {
            tracing::warn!(record = ?record, reason, "record marked broken");
            self.marked_broken.push(record);
        }
        Ok(())
    }
}

pub struct Reconciler {
    index: LocalIndex,
    state: Arc<EngineState>,
    channel: ChannelId,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(index: LocalIndex, state: Arc<EngineState>, channel: ChannelId, retry: RetryPolicy) -> Self {
        Self {
            index,
            state,
            channel,
            retry,
        }
    }

    /// Compare the `limit` most recent storage-channel messages with the
    /// index. Refuses to run before the first sync unless `force` is set.
    pub async fn reconcile_recent(
        &self,
        remote: &dyn RemoteClient,
        limit: usize,
        force: bool,
    ) -> Result<ReconcileReport> {
        self.state.ensure_live()?;
        let cursor = self.index.read(|db| db.get_cursor(self.channel))?;
        if cursor.is_none() && !force {
            return Err(EngineError::SyncRequiredFirst);
        }

        // Held across the fetch so no mutation lands a message above the
        // scanned range before the comparison.
        let gate = self.index.lock_writes().await;
        let limit = limit.max(1);
        let mut recent = with_retry(&self.retry, "get_recent", || {
            remote.get_recent(self.channel, limit)
        })
        .await?;
        recent.sort_by_key(|m| m.id);

        let report = self.index.write(&gate, |db| {
            let mut report = ReconcileReport {
                forced: cursor.is_none(),
                ..ReconcileReport::default()
            };
            self.check(db, &recent, &mut report)?;
            db.set_state(LAST_RECONCILE_KEY, &Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))?;
            Ok(report)
        })?;
        drop(gate);

        tracing::info!(
            channel = %self.channel,
            scanned = report.scanned,
            inserted = report.inserted,
            updated = report.updated,
            broken = report.marked_broken.len(),
            missing_remote = report.missing_remote,
            forced = report.forced,
            "reconciliation finished"
        );
        self.state.events().emit(EngineEvent::ReconcileFinished {
            report: report.clone(),
        });
        Ok(report)
    }

    /// Time of the last reconciliation, if any ran on this index.
    pub fn last_reconciled_at(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = self.index.read(|db| db.get_state(LAST_RECONCILE_KEY))?;
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    fn check(
        &self,
        db: &Database,
        messages: &[RemoteMessage],
        report: &mut ReconcileReport,
    ) -> msgtree_store::Result<()> {
        report.scanned = messages.len();
        let (Some(first), Some(last)) = (messages.first(), messages.last()) else {
            return Ok(());
        };
        report.window = Some((first.id, last.id));

        // Open-ended: the scan is the newest messages, so anything stored
        // above the oldest one should have come back. Taken before any
        // upsert moves a location around.
        let window = db.records_from(self.channel, first.id)?;
        let by_id: HashMap<MessageId, &RemoteMessage> = messages.iter().map(|m| (m.id, m)).collect();

        for msg in messages {
            let loc = RemoteLocation {
                channel: self.channel,
                message: msg.id,
            };
            match fsmeta::parse(&msg.text) {
                Err(e) if e.is_unrecognized() => report.unrecognized += 1,
                Err(e) => {
                    tracing::debug!(message_id = %msg.id, error = %e, "malformed tag during reconciliation");
                    report.malformed += 1;
                }
                Ok(TagRecord::Dir(meta)) => self.check_dir(db, msg, loc, meta, report)?,
                Ok(TagRecord::File(meta)) => self.check_file(db, msg, loc, meta, report)?,
                Ok(TagRecord::Removed(t)) => self.check_tombstone(db, loc, t, report)?,
            }
        }

        let mut seen = HashSet::new();
        for (record, message) in window {
            if !seen.insert(record.clone()) {
                continue;
            }
            match by_id.get(&message) {
                None => {
                    report.missing_remote += 1;
                    report.flag(db, record, "message missing on the remote")?;
                }
                Some(msg) => {
                    if !describes(&msg.text, &record) {
                        report.flag(db, record, "message now describes something else")?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_dir(
        &self,
        db: &Database,
        msg: &RemoteMessage,
        loc: RemoteLocation,
        meta: DirMeta,
        report: &mut ReconcileReport,
    ) -> msgtree_store::Result<()> {
        let local = db.find_directory(&meta.dir_id)?;
        let stored = local.as_ref().and_then(|d| d.remote_message_id);
        match (&local, stored) {
            (Some(_), Some(stored)) if stored > msg.id => report.consistent += 1,
            (Some(d), Some(stored)) if stored == msg.id && d.remote_channel_id == Some(self.channel) => {
                if d.parent_id == meta.parent_id && d.name == meta.name {
                    report.consistent += 1;
                } else {
                    report.flag(db, RecordRef::Dir(meta.dir_id), "directory differs from its message")?;
                }
            }
            _ => {
                let upsert = DirUpsert {
                    id: meta.dir_id,
                    parent_id: meta.parent_id,
                    name: meta.name,
                    location: loc,
                    observed_at: msg.date,
                };
                self.count_upsert(db.upsert_directory_from_remote(&upsert)?, local.is_none(), report);
            }
        }
        Ok(())
    }

    fn check_file(
        &self,
        db: &Database,
        msg: &RemoteMessage,
        loc: RemoteLocation,
        meta: FileMeta,
        report: &mut ReconcileReport,
    ) -> msgtree_store::Result<()> {
        let local = db.find_file(&meta.file_id)?;
        let stored = local.as_ref().and_then(|f| f.remote_message_id);
        match (&local, stored) {
            (Some(_), Some(stored)) if stored > msg.id => report.consistent += 1,
            (Some(f), Some(stored)) if stored == msg.id && f.remote_channel_id == Some(self.channel) => {
                if f.content_hash != meta.content_hash {
                    tracing::debug!(
                        file_id = %f.id,
                        stored = %f.content_hash,
                        remote = %meta.content_hash,
                        "content fingerprint mismatch"
                    );
                    report.flag(db, RecordRef::File(meta.file_id), "content fingerprint mismatch")?;
                } else if f.dir_id != meta.dir_id || f.name != meta.name {
                    report.flag(db, RecordRef::File(meta.file_id), "file placement differs from its message")?;
                } else {
                    report.consistent += 1;
                }
            }
            _ => {
                let (size_bytes, remote_file_ref) = match &msg.attachment {
                    Some(a) => (a.size_bytes, Some(a.file_ref.0.clone())),
                    None => (0, None),
                };
                let upsert = FileUpsert {
                    id: meta.file_id,
                    dir_id: meta.dir_id,
                    name: meta.name,
                    size_bytes,
                    content_hash: meta.content_hash,
                    location: loc,
                    remote_file_ref,
                    observed_at: msg.date,
                };
                self.count_upsert(db.upsert_file_from_remote(&upsert)?, local.is_none(), report);
            }
        }
        Ok(())
    }

    fn check_tombstone(
        &self,
        db: &Database,
        loc: RemoteLocation,
        tombstone: Tombstone,
        report: &mut ReconcileReport,
    ) -> msgtree_store::Result<()> {
        let (record, stored) = match tombstone {
            Tombstone::Dir(id) => {
                let stored = db.find_directory(&id)?.map(|d| d.remote_message_id);
                (RecordRef::Dir(id), stored)
            }
            Tombstone::File(id) => {
                let stored = db.find_file(&id)?.map(|f| f.remote_message_id);
                (RecordRef::File(id), stored)
            }
        };
        match stored {
            None => report.consistent += 1,
            Some(Some(stored)) if stored > loc.message => report.consistent += 1,
            Some(_) => report.flag(db, record, "record deleted on the remote")?,
        }
        Ok(())
    }

    fn count_upsert(&self, outcome: ApplyOutcome, was_missing: bool, report: &mut ReconcileReport) {
        match outcome {
            ApplyOutcome::Applied if was_missing => report.inserted += 1,
            ApplyOutcome::Applied => report.updated += 1,
            ApplyOutcome::Stale | ApplyOutcome::Absent => report.consistent += 1,
            ApplyOutcome::Rejected(reason) => {
                tracing::debug!(%reason, "tag rejected during reconciliation");
                report.malformed += 1;
            }
        }
    }
}

/// Whether `text` still carries the metadata (or tombstone) of `record`.
fn describes(text: &str, record: &RecordRef) -> bool {
    match (fsmeta::decode(text), record) {
        (Some(TagRecord::Dir(m)), RecordRef::Dir(id)) => &m.dir_id == id,
        (Some(TagRecord::File(m)), RecordRef::File(id)) => &m.file_id == id,
        (Some(TagRecord::Removed(Tombstone::Dir(t))), RecordRef::Dir(id)) => &t == id,
        (Some(TagRecord::Removed(Tombstone::File(t))), RecordRef::File(id)) => &t == id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use msgtree_shared::fsmeta::{encode_dir, encode_file, encode_tombstone};

    use super::*;
    use crate::remote::memory::MemoryRemote;
    use crate::sync::SyncEngine;

    const CH: ChannelId = ChannelId(4);

    fn dir_tag(id: &str, name: &str) -> String {
        encode_dir(&DirMeta {
            dir_id: id.into(),
            parent_id: None,
            name: name.into(),
        })
    }

    fn file_tag(id: &str, hash: &str) -> String {
        encode_file(&FileMeta {
            dir_id: "d1".into(),
            file_id: id.into(),
            name: format!("{id}.bin"),
            content_hash: hash.into(),
        })
    }

    fn parts() -> (LocalIndex, Arc<EngineState>, SyncEngine, Reconciler) {
        let index = LocalIndex::in_memory().unwrap();
        let state = Arc::new(EngineState::default());
        let sync = SyncEngine::new(index.clone(), state.clone(), 50, RetryPolicy::immediate(1));
        let rec = Reconciler::new(index.clone(), state.clone(), CH, RetryPolicy::immediate(1));
        (index, state, sync, rec)
    }

    #[tokio::test]
    async fn requires_prior_sync_unless_forced() {
        let remote = MemoryRemote::new();
        remote.inject(CH, &dir_tag("d1", "A"), None);
        let (index, _, _, rec) = parts();

        let err = rec.reconcile_recent(&remote, 100, false).await.unwrap_err();
        assert_eq!(err.code(), "SYNC_REQUIRED_FIRST");

        let report = rec.reconcile_recent(&remote, 100, true).await.unwrap();
        assert!(report.forced);
        assert_eq!(report.inserted, 1);
        // Never advances the cursor.
        assert!(index.read(|db| db.get_cursor(CH)).unwrap().is_none());
        assert!(rec.last_reconciled_at().unwrap().is_some());
    }

    #[tokio::test]
    async fn consistent_index_is_left_alone() {
        let remote = MemoryRemote::new();
        remote.inject(CH, &dir_tag("d1", "A"), None);
        remote.inject(CH, &file_tag("f1", "abc123"), None);
        remote.inject(CH, "hello", None);
        let (_, _, sync, rec) = parts();
        sync.pull(&remote, CH).await.unwrap();

        let report = rec.reconcile_recent(&remote, 100, false).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.consistent, 2);
        assert_eq!(report.unrecognized, 1);
        assert!(report.marked_broken.is_empty());
        assert_eq!(report.window, Some((MessageId(1), MessageId(3))));
    }

    #[tokio::test]
    async fn hash_mismatch_and_missing_messages_are_flagged() {
        let remote = MemoryRemote::new();
        remote.inject(CH, &dir_tag("d1", "A"), None);
        let f1 = remote.inject(CH, &file_tag("f1", "abc123"), None);
        let f2 = remote.inject(CH, &file_tag("f2", "def456"), None);
        remote.inject(CH, &dir_tag("d2", "B"), None);
        let (index, _, sync, rec) = parts();
        sync.pull(&remote, CH).await.unwrap();

        remote.overwrite(CH, f1, &file_tag("f1", "ffff0000"));
        remote.delete_message(CH, f2);

        let report = rec.reconcile_recent(&remote, 100, false).await.unwrap();
        assert_eq!(report.missing_remote, 1);
        assert!(report.marked_broken.contains(&RecordRef::File("f1".into())));
        assert!(report.marked_broken.contains(&RecordRef::File("f2".into())));
        assert!(index.read(|db| db.get_file("f1")).unwrap().is_broken);
        // Stored hash is untouched; only Repair changes it.
        assert_eq!(index.read(|db| db.get_file("f1")).unwrap().content_hash, "abc123");
    }

    #[tokio::test]
    async fn remote_tombstone_with_local_record_is_flagged() {
        let remote = MemoryRemote::new();
        let d = remote.inject(CH, &dir_tag("d1", "A"), None);
        let (index, _, sync, rec) = parts();
        sync.pull(&remote, CH).await.unwrap();

        remote.overwrite(CH, d, &encode_tombstone(&Tombstone::Dir("d1".into())));
        let report = rec.reconcile_recent(&remote, 10, false).await.unwrap();
        assert_eq!(report.marked_broken, vec![RecordRef::Dir("d1".into())]);
        assert!(index.read(|db| db.get_directory("d1")).unwrap().is_broken);
    }

    #[tokio::test]
    async fn window_is_bounded_by_limit() {
        let remote = MemoryRemote::new();
        for i in 0..5 {
            remote.inject(CH, &dir_tag(&format!("d{i}"), "x"), None);
        }
        let (_, _, sync, rec) = parts();
        sync.pull(&remote, CH).await.unwrap();
        // An old message vanishing is outside a 2-message window.
        remote.delete_message(CH, MessageId(1));

        let report = rec.reconcile_recent(&remote, 2, false).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.window, Some((MessageId(4), MessageId(5))));
        assert!(report.marked_broken.is_empty());
    }

    #[tokio::test]
    async fn deleted_newest_message_is_flagged() {
        let remote = MemoryRemote::new();
        for (id, name) in [("d1", "A"), ("d2", "B"), ("d3", "C")] {
            remote.inject(CH, &dir_tag(id, name), None);
        }
        let (index, _, sync, rec) = parts();
        sync.pull(&remote, CH).await.unwrap();
        remote.delete_message(CH, MessageId(3));

        let report = rec.reconcile_recent(&remote, 100, false).await.unwrap();
        assert_eq!(report.window, Some((MessageId(1), MessageId(2))));
        assert_eq!(report.missing_remote, 1);
        assert_eq!(report.marked_broken, vec![RecordRef::Dir("d3".into())]);
        assert!(index.read(|db| db.get_directory("d3")).unwrap().is_broken);
    }
}
