//! Mutation Pipeline: local tree operations become remote messages first and
//! index rows second.
//!
//! Every operation holds the index write gate for its whole
//! validate -> remote -> commit span. Nothing is written locally unless the
//! remote call succeeded, so a failed or cancelled call never needs a
//! rollback.

mod dirs;
mod files;

use std::sync::Arc;

use msgtree_shared::fsmeta;
use msgtree_shared::ChannelId;
use msgtree_store::{DirectoryRecord, FileRecord, RemoteLocation};

use crate::content_vault::ContentVault;
use crate::error::{EngineError, RemoteError, Result};
use crate::index::LocalIndex;
use crate::remote::{RemoteClient, RemoteFileRef};
use crate::retry::{with_retry, RetryPolicy};

pub struct MutationPipeline {
    index: LocalIndex,
    vault: Arc<ContentVault>,
    channel: ChannelId,
    retry: RetryPolicy,
}

impl MutationPipeline {
    pub fn new(index: LocalIndex, vault: Arc<ContentVault>, channel: ChannelId, retry: RetryPolicy) -> Self {
        Self {
            index,
            vault,
            channel,
            retry,
        }
    }

    /// Append `text` as a new message on the storage channel.
    async fn send(
        &self,
        remote: &dyn RemoteClient,
        text: &str,
        attachment: Option<&RemoteFileRef>,
    ) -> Result<RemoteLocation> {
        let message = with_retry(&self.retry, "send_message", || {
            remote.send_message(self.channel, text, attachment)
        })
        .await?;
        Ok(RemoteLocation {
            channel: self.channel,
            message,
        })
    }

    /// Rewrite the message at `current` with `text`. Pending records, records
    /// living on another channel and messages the remote no longer has are
    /// sent as a fresh message instead; the returned location is where the
    /// metadata lives now.
    async fn edit_or_resend(
        &self,
        remote: &dyn RemoteClient,
        current: Option<RemoteLocation>,
        text: &str,
        attachment: Option<&RemoteFileRef>,
    ) -> Result<RemoteLocation> {
        if let Some(loc) = current.filter(|l| l.channel == self.channel) {
            let edited = with_retry(&self.retry, "edit_message", || {
                remote.edit_message(loc.channel, loc.message, text)
            })
            .await;
            match edited {
                Ok(()) => return Ok(loc),
                Err(EngineError::Remote(RemoteError::MessageNotFound { .. })) => {
                    tracing::warn!(
                        channel = %loc.channel,
                        message_id = %loc.message,
                        "message to edit is gone, re-sending metadata"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        self.send(remote, text, attachment).await
    }

    /// Edit the message at `current` into a tombstone. A message that is
    /// already gone counts as removed.
    async fn write_tombstone(
        &self,
        remote: &dyn RemoteClient,
        current: Option<RemoteLocation>,
        text: &str,
    ) -> Result<()> {
        let Some(loc) = current else {
            return Ok(());
        };
        let edited = with_retry(&self.retry, "edit_message", || {
            remote.edit_message(loc.channel, loc.message, text)
        })
        .await;
        match edited {
            Err(EngineError::Remote(RemoteError::MessageNotFound { .. })) => {
                tracing::warn!(
                    channel = %loc.channel,
                    message_id = %loc.message,
                    "message to tombstone is already gone"
                );
                Ok(())
            }
            other => other,
        }
    }

    fn require_dir(&self, id: &str) -> Result<DirectoryRecord> {
        self.index
            .read(|db| db.find_directory(id))?
            .ok_or_else(|| EngineError::not_found("directory", id))
    }

    fn require_file(&self, id: &str) -> Result<FileRecord> {
        self.index
            .read(|db| db.find_file(id))?
            .ok_or_else(|| EngineError::not_found("file", id))
    }
}

fn check_name(name: &str) -> Result<()> {
    fsmeta::validate_name(name).map_err(|e| {
        tracing::debug!(error = %e, "rejected record name");
        EngineError::InvalidName(name.to_string())
    })
}

pub(crate) fn dir_location(dir: &DirectoryRecord) -> Option<RemoteLocation> {
    Some(RemoteLocation {
        channel: dir.remote_channel_id?,
        message: dir.remote_message_id?,
    })
}

pub(crate) fn file_location(file: &FileRecord) -> Option<RemoteLocation> {
    Some(RemoteLocation {
        channel: file.remote_channel_id?,
        message: file.remote_message_id?,
    })
}
