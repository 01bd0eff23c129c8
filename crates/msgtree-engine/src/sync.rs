//! Sync Engine: pulls channel history after the cursor and applies it to the
//! Local Index, one page per transaction.
//!
//! ```text
//! Idle -> Pulling -> Applying -> Pulling ... -> Idle
//!            \-> Error -> Idle   (transport failure, cursor untouched)
//! ```
//!
//! A crash mid-batch leaves the cursor where it was, so the next pull
//! re-applies the whole page. Every apply is idempotent and ordered by
//! message id, which makes incremental and full syncs converge.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use msgtree_shared::fsmeta::{self, TagRecord, Tombstone};
use msgtree_shared::{ChannelId, MessageId};
use msgtree_store::{ApplyOutcome, Database, DirUpsert, FileUpsert, RemoteLocation};

use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::index::LocalIndex;
use crate::remote::{RemoteClient, RemoteMessage};
use crate::retry::{with_retry, RetryPolicy};
use crate::state::{EngineState, SyncPhase};

/// Counters of one pull (or one batch).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub batches: usize,
    pub fetched: usize,
    pub applied: usize,
    pub tombstones: usize,
    /// Older than what the index already holds for the same record.
    pub stale: usize,
    /// Foreign text or a newer schema version.
    pub unrecognized: usize,
    /// Tagged but unusable (missing fields, cycles, ...).
    pub malformed: usize,
    pub cursor: Option<MessageId>,
}

impl SyncReport {
    fn absorb(&mut self, batch: &SyncReport) {
        self.batches += batch.batches;
        self.fetched += batch.fetched;
        self.applied += batch.applied;
        self.tombstones += batch.tombstones;
        self.stale += batch.stale;
        self.unrecognized += batch.unrecognized;
        self.malformed += batch.malformed;
        if batch.cursor.is_some() {
            self.cursor = batch.cursor;
        }
    }
}

/// What applying one message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Applied,
    Tombstone,
    Stale,
    Unrecognized,
    Malformed(String),
}

/// Decode `msg` and apply it. Must run inside a write transaction.
pub fn apply_message(db: &Database, channel: ChannelId, msg: &RemoteMessage) -> msgtree_store::Result<MessageOutcome> {
    let record = match fsmeta::parse(&msg.text) {
        Ok(record) => record,
        Err(e) if e.is_unrecognized() => return Ok(MessageOutcome::Unrecognized),
        Err(e) => return Ok(MessageOutcome::Malformed(e.to_string())),
    };

    let location = RemoteLocation {
        channel,
        message: msg.id,
    };
    let (outcome, is_tombstone) = match record {
        TagRecord::Dir(m) => (
            db.upsert_directory_from_remote(&DirUpsert {
                id: m.dir_id,
                parent_id: m.parent_id,
                name: m.name,
                location,
                observed_at: msg.date,
            })?,
            false,
        ),
        TagRecord::File(m) => {
            let (size_bytes, remote_file_ref) = match &msg.attachment {
                Some(a) => (a.size_bytes, Some(a.file_ref.0.clone())),
                None => (0, None),
            };
            (
                db.upsert_file_from_remote(&FileUpsert {
                    id: m.file_id,
                    dir_id: m.dir_id,
                    name: m.name,
                    size_bytes,
                    content_hash: m.content_hash,
                    location,
                    remote_file_ref,
                    observed_at: msg.date,
                })?,
                false,
            )
        }
        TagRecord::Removed(Tombstone::Dir(id)) => (db.apply_directory_tombstone(&id, location)?, true),
        TagRecord::Removed(Tombstone::File(id)) => (db.apply_file_tombstone(&id, location)?, true),
    };

    Ok(match outcome {
        ApplyOutcome::Applied | ApplyOutcome::Absent if is_tombstone => MessageOutcome::Tombstone,
        ApplyOutcome::Applied | ApplyOutcome::Absent => MessageOutcome::Applied,
        ApplyOutcome::Stale => MessageOutcome::Stale,
        ApplyOutcome::Rejected(reason) => MessageOutcome::Malformed(reason),
    })
}

/// Apply a page of messages in ascending id order and count the results.
pub fn apply_batch(db: &Database, channel: ChannelId, messages: &[RemoteMessage]) -> msgtree_store::Result<SyncReport> {
    let mut sorted: Vec<&RemoteMessage> = messages.iter().collect();
    sorted.sort_by_key(|m| m.id);

    let mut report = SyncReport {
        batches: 1,
        fetched: messages.len(),
        ..SyncReport::default()
    };
    for msg in sorted {
        match apply_message(db, channel, msg)? {
            MessageOutcome::Applied => report.applied += 1,
            MessageOutcome::Tombstone => report.tombstones += 1,
            MessageOutcome::Stale => report.stale += 1,
            MessageOutcome::Unrecognized => {
                tracing::debug!(channel = %channel, message_id = %msg.id, "skipped untagged message");
                report.unrecognized += 1;
            }
            MessageOutcome::Malformed(reason) => {
                tracing::warn!(channel = %channel, message_id = %msg.id, %reason, "skipped malformed tag");
                report.malformed += 1;
            }
        }
    }
    report.cursor = messages.iter().map(|m| m.id).max();
    Ok(report)
}

pub struct SyncEngine {
    index: LocalIndex,
    state: Arc<EngineState>,
    page_size: usize,
    retry: RetryPolicy,
    pull_lock: AsyncMutex<()>,
}

impl SyncEngine {
    pub fn new(index: LocalIndex, state: Arc<EngineState>, page_size: usize, retry: RetryPolicy) -> Self {
        Self {
            index,
            state,
            page_size: page_size.max(1),
            retry,
            pull_lock: AsyncMutex::new(()),
        }
    }

    pub fn index(&self) -> &LocalIndex {
        &self.index
    }

    /// Incremental pull of everything after the stored cursor.
    pub async fn pull(&self, remote: &dyn RemoteClient, channel: ChannelId) -> Result<SyncReport> {
        self.state.ensure_live()?;
        let _pulling = self.pull_lock.lock().await;

        self.state.set_phase(channel, SyncPhase::Pulling);
        let result = self.pull_pages(remote, channel).await;
        match &result {
            Ok(report) => {
                self.state.record_report(channel, report.clone());
                tracing::info!(
                    channel = %channel,
                    batches = report.batches,
                    applied = report.applied,
                    tombstones = report.tombstones,
                    unrecognized = report.unrecognized,
                    malformed = report.malformed,
                    "sync finished"
                );
            }
            Err(e) => {
                self.state.set_phase(channel, SyncPhase::Error);
                self.state.record_error(channel, e);
                tracing::error!(channel = %channel, error = %e, "sync failed");
            }
        }
        self.state.set_phase(channel, SyncPhase::Idle);
        result
    }

    /// Forget the index and the cursor, then pull from the start of history.
    pub async fn full_resync(&self, remote: &dyn RemoteClient, channel: ChannelId) -> Result<SyncReport> {
        self.state.ensure_live()?;
        {
            let _pulling = self.pull_lock.lock().await;
            let gate = self.index.lock_writes().await;
            self.index.write(&gate, |db| {
                db.conn().execute_batch(
                    "DELETE FROM files;
                     DELETE FROM directories;",
                )?;
                db.reset_cursor(channel)
            })?;
            tracing::info!(channel = %channel, "index reset for full resync");
        }
        self.pull(remote, channel).await
    }

    async fn pull_pages(&self, remote: &dyn RemoteClient, channel: ChannelId) -> Result<SyncReport> {
        let mut total = SyncReport::default();
        loop {
            let after = self
                .index
                .read(|db| db.get_cursor(channel))?
                .map(|c| c.last_message_id)
                .unwrap_or(MessageId::START);

            let page = with_retry(&self.retry, "get_history", || {
                remote.get_history(channel, after, self.page_size)
            })
            .await?;
            if page.is_empty() {
                break;
            }
            if let Some(bad) = page.iter().find(|m| m.id <= after) {
                return Err(EngineError::Divergence(format!(
                    "history returned message {} at or before cursor {after}",
                    bad.id
                )));
            }

            self.state.set_phase(channel, SyncPhase::Applying);
            let batch = {
                let gate = self.index.lock_writes().await;
                self.index.write(&gate, |db| {
                    let batch = apply_batch(db, channel, &page)?;
                    if let Some(last) = batch.cursor {
                        db.advance_cursor(channel, last, Utc::now())?;
                    }
                    Ok(batch)
                })?
            };
            tracing::debug!(
                channel = %channel,
                fetched = batch.fetched,
                cursor = ?batch.cursor,
                "batch applied"
            );
            if let Some(cursor) = batch.cursor {
                self.state.events().emit(EngineEvent::SyncBatchApplied {
                    channel,
                    cursor,
                    report: batch.clone(),
                });
            }
            total.absorb(&batch);
            self.state.set_phase(channel, SyncPhase::Pulling);

            if page.len() < self.page_size {
                break;
            }
        }
        if total.cursor.is_none() {
            total.cursor = self
                .index
                .read(|db| db.get_cursor(channel))?
                .map(|c| c.last_message_id);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use msgtree_shared::fsmeta::{encode_dir, encode_file, encode_tombstone, DirMeta, FileMeta};

    use super::*;
    use crate::error::RemoteError;
    use crate::remote::memory::{MemoryRemote, RemoteOp};

    const CH: ChannelId = ChannelId(-10);

    fn dir_tag(id: &str, parent: Option<&str>, name: &str) -> String {
        encode_dir(&DirMeta {
            dir_id: id.into(),
            parent_id: parent.map(String::from),
            name: name.into(),
        })
    }

    fn file_tag(dir: &str, id: &str, name: &str, hash: &str) -> String {
        encode_file(&FileMeta {
            dir_id: dir.into(),
            file_id: id.into(),
            name: name.into(),
            content_hash: hash.into(),
        })
    }

    fn engine(page: usize) -> SyncEngine {
        SyncEngine::new(
            LocalIndex::in_memory().unwrap(),
            Arc::new(EngineState::default()),
            page,
            RetryPolicy::immediate(2),
        )
    }

    fn seed(remote: &MemoryRemote) {
        remote.inject(CH, &dir_tag("d1", None, "A"), None);
        remote.inject(CH, "just chatting", None);
        let att = remote.put_file(bytes::Bytes::from_static(b"abc"));
        remote.inject(CH, &file_tag("d1", "f1", "x.txt", "abc123"), Some(att));
        remote.inject(CH, &dir_tag("d2", Some("d1"), "B"), None);
        remote.inject(CH, "#ocltg #v9 #dir d=z p=ROOT name=future", None);
        remote.inject(CH, "#ocltg #v1 #file d=d1 n=broken", None);
        remote.inject(CH, &dir_tag("d3", None, "Gone"), None);
        remote.inject(CH, &encode_tombstone(&Tombstone::Dir("d3".into())), None);
    }

    fn snapshot(engine: &SyncEngine) -> (Vec<msgtree_store::DirectoryRecord>, Vec<msgtree_store::FileRecord>) {
        engine
            .index()
            .read(|db| Ok((db.list_directories()?, db.list_files()?)))
            .unwrap()
    }

    #[tokio::test]
    async fn pull_applies_and_counts() {
        let remote = MemoryRemote::new();
        seed(&remote);
        let engine = engine(3);

        let report = engine.pull(&remote, CH).await.unwrap();
        assert_eq!(report.fetched, 8);
        assert_eq!(report.batches, 3);
        assert_eq!(report.unrecognized, 2);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.tombstones, 1);
        assert_eq!(report.cursor, Some(MessageId(8)));

        let (dirs, files) = snapshot(&engine);
        assert_eq!(dirs.len(), 2);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size_bytes, 3);
        assert_eq!(engine.state.status(CH).phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn incremental_and_full_resync_converge() {
        let remote = MemoryRemote::new();
        seed(&remote);

        let incremental = engine(2);
        incremental.pull(&remote, CH).await.unwrap();
        remote.inject(CH, &dir_tag("d2", None, "B moved"), None);
        remote.inject(CH, &file_tag("d2", "f1", "x.txt", "abc123"), None);
        incremental.pull(&remote, CH).await.unwrap();

        let full = engine(100);
        full.full_resync(&remote, CH).await.unwrap();

        assert_eq!(snapshot(&incremental), snapshot(&full));
    }

    #[tokio::test]
    async fn reapplying_a_batch_is_idempotent() {
        let remote = MemoryRemote::new();
        seed(&remote);
        let engine = engine(100);
        engine.pull(&remote, CH).await.unwrap();
        let before = snapshot(&engine);

        // Simulate a crash before the cursor moved: apply the same page again.
        let page = remote.get_history(CH, MessageId::START, 100).await.unwrap();
        let gate = engine.index().lock_writes().await;
        engine
            .index()
            .write(&gate, |db| apply_batch(db, CH, &page))
            .unwrap();
        drop(gate);

        assert_eq!(snapshot(&engine), before);
    }

    #[tokio::test]
    async fn transport_failure_keeps_cursor() {
        let remote = MemoryRemote::new();
        seed(&remote);
        let engine = engine(4);
        remote.fail_next(RemoteOp::History, 1, RemoteError::Timeout("x".into()));
        // One failure is absorbed by the retry policy.
        engine.pull(&remote, CH).await.unwrap();

        let remote = MemoryRemote::new();
        seed(&remote);
        let engine2 = self::engine(4);
        remote.fail_next(RemoteOp::History, 5, RemoteError::Unavailable("down".into()));
        let err = engine2.pull(&remote, CH).await.unwrap_err();
        assert!(matches!(err, EngineError::RemoteUnavailable { .. }));
        assert!(engine2.index().read(|db| db.get_cursor(CH)).unwrap().is_none());
        assert!(engine2.state.status(CH).last_error.is_some());
        assert_eq!(engine2.state.status(CH).phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn restart_pending_blocks_pulls() {
        let remote = MemoryRemote::new();
        let engine = engine(10);
        engine.state.mark_restart_pending();
        assert!(matches!(
            engine.pull(&remote, CH).await,
            Err(EngineError::RestartRequired)
        ));
    }
}
