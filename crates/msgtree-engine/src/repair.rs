//! Repair of records flagged broken.
//!
//! A repair always writes a fresh message and only then touches the index,
//! so a failed attempt leaves the broken record exactly as it was.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use msgtree_shared::crypto::content_fingerprint;
use msgtree_shared::fsmeta::{self, DirMeta, FileMeta};
use msgtree_shared::{ChannelId, MessageId};
use msgtree_store::{RecordRef, RemoteLocation};

use crate::content_vault::ContentVault;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::index::LocalIndex;
use crate::remote::RemoteClient;
use crate::retry::{with_retry, RetryPolicy};
use crate::state::EngineState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairOutcome {
    pub record: RecordRef,
    pub message_id: MessageId,
}

pub struct Repairer {
    index: LocalIndex,
    state: Arc<EngineState>,
    vault: Arc<ContentVault>,
    channel: ChannelId,
    retry: RetryPolicy,
}

impl Repairer {
    pub fn new(
        index: LocalIndex,
        state: Arc<EngineState>,
        vault: Arc<ContentVault>,
        channel: ChannelId,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            index,
            state,
            vault,
            channel,
            retry,
        }
    }

    /// Re-send a broken directory's metadata from the index.
    pub async fn repair_directory(&self, remote: &dyn RemoteClient, id: &str) -> Result<RepairOutcome> {
        self.state.ensure_live()?;
        let gate = self.index.lock_writes().await;
        let dir = self
            .index
            .read(|db| db.find_directory(id))?
            .ok_or_else(|| EngineError::not_found("directory", id))?;
        if !dir.is_broken {
            return Err(EngineError::Precondition(format!("directory {id} is not flagged broken")));
        }

        let tag = fsmeta::encode_dir(&DirMeta {
            dir_id: dir.id.clone(),
            parent_id: dir.parent_id.clone(),
            name: dir.name.clone(),
        });
        let message = with_retry(&self.retry, "send_message", || {
            remote.send_message(self.channel, &tag, None)
        })
        .await?;

        let loc = RemoteLocation {
            channel: self.channel,
            message,
        };
        self.index.write(&gate, |db| {
            db.set_directory_location(id, loc)?;
            db.set_directory_broken(id, false)?;
            Ok(())
        })?;
        Ok(self.finish(RecordRef::Dir(dir.id), message))
    }

    /// Re-upload a broken file's payload and link it with a new message.
    ///
    /// The cached payload is used when it still matches the stored
    /// fingerprint. Otherwise `replacement` must be supplied; it has to
    /// match the stored fingerprint when one is known.
    pub async fn repair_file(
        &self,
        remote: &dyn RemoteClient,
        id: &str,
        replacement: Option<Bytes>,
    ) -> Result<RepairOutcome> {
        self.state.ensure_live()?;
        let gate = self.index.lock_writes().await;
        let file = self
            .index
            .read(|db| db.find_file(id))?
            .ok_or_else(|| EngineError::not_found("file", id))?;
        if !file.is_broken {
            return Err(EngineError::Precondition(format!("file {id} is not flagged broken")));
        }

        let (payload, from_cache) = match self.cached_payload(&file.content_hash).await {
            Some(data) => (data, true),
            None => {
                let Some(data) = replacement else {
                    return Err(EngineError::NeedSourceFile {
                        file_id: id.to_string(),
                    });
                };
                let actual = content_fingerprint(&data);
                if !file.content_hash.is_empty() && actual != file.content_hash {
                    return Err(EngineError::HashMismatch {
                        expected: file.content_hash.clone(),
                        actual,
                    });
                }
                (data, false)
            }
        };
        let hash = content_fingerprint(&payload);
        let size_bytes = payload.len() as u64;

        let file_ref = with_retry(&self.retry, "upload_file", || remote.upload_file(payload.clone())).await?;
        let tag = fsmeta::encode_file(&FileMeta {
            dir_id: file.dir_id.clone(),
            file_id: file.id.clone(),
            name: file.name.clone(),
            content_hash: hash.clone(),
        });
        let message = with_retry(&self.retry, "send_message", || {
            remote.send_message(self.channel, &tag, Some(&file_ref))
        })
        .await?;

        let loc = RemoteLocation {
            channel: self.channel,
            message,
        };
        self.index.write(&gate, |db| {
            db.set_file_content(id, size_bytes, &hash)?;
            db.set_file_location(id, loc, Some(file_ref.as_str()))?;
            db.set_file_broken(id, false)?;
            Ok(())
        })?;
        drop(gate);

        if !from_cache {
            if let Err(e) = self.vault.put(&hash, &payload).await {
                tracing::warn!(file_id = %id, error = %e, "could not cache replacement payload");
            }
        }
        Ok(self.finish(RecordRef::File(file.id), message))
    }

    /// Cached bytes for `hash`, only if they still hash to it.
    async fn cached_payload(&self, hash: &str) -> Option<Bytes> {
        if hash.is_empty() {
            return None;
        }
        match self.vault.get(hash).await {
            Ok(Some(data)) if content_fingerprint(&data) == hash => Some(data),
            Ok(Some(_)) => {
                tracing::warn!(hash, "cached payload no longer matches its key, dropping it");
                if let Err(e) = self.vault.remove(hash).await {
                    tracing::warn!(hash, error = %e, "could not drop corrupt cache entry");
                }
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(hash, error = %e, "cache lookup failed");
                None
            }
        }
    }

    fn finish(&self, record: RecordRef, message_id: MessageId) -> RepairOutcome {
        tracing::info!(record = ?record, message_id = %message_id, "record repaired");
        self.state.events().emit(EngineEvent::RepairFinished {
            record: record.clone(),
            message_id,
        });
        RepairOutcome { record, message_id }
    }
}
