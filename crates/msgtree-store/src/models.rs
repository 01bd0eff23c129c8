//! Domain models persisted in the Local Index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use msgtree_shared::{ChannelId, MessageId};

/// A directory in the mirrored tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub id: String,
    /// `None` means the directory sits directly under the root.
    pub parent_id: Option<String>,
    pub name: String,
    pub remote_channel_id: Option<ChannelId>,
    /// `None` while the record is pending or a placeholder.
    pub remote_message_id: Option<MessageId>,
    pub is_broken: bool,
    pub updated_at: DateTime<Utc>,
}

impl DirectoryRecord {
    pub fn is_pending(&self) -> bool {
        self.remote_message_id.is_none()
    }
}

/// A file whose payload lives on the remote as an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub dir_id: String,
    pub name: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub remote_channel_id: Option<ChannelId>,
    pub remote_message_id: Option<MessageId>,
    /// Opaque payload reference handed back by the remote on upload.
    pub remote_file_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_broken: bool,
}

impl FileRecord {
    pub fn is_pending(&self) -> bool {
        self.remote_message_id.is_none()
    }

    /// Lower-cased extension of the file name, if any.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_lowercase())
    }
}

/// Last fully-ingested message of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub channel_id: ChannelId,
    pub last_message_id: MessageId,
    pub updated_at: DateTime<Utc>,
}

/// The remote coordinates a record was last written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLocation {
    pub channel: ChannelId,
    pub message: MessageId,
}

/// A record kind plus id, as found by a message lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RecordRef {
    Dir(String),
    File(String),
}

impl RecordRef {
    pub fn id(&self) -> &str {
        match self {
            RecordRef::Dir(id) | RecordRef::File(id) => id,
        }
    }
}

/// Input of a file upsert coming from a synced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpsert {
    pub id: String,
    pub dir_id: String,
    pub name: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub location: RemoteLocation,
    pub remote_file_ref: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Input of a directory upsert coming from a synced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirUpsert {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub location: RemoteLocation,
    pub observed_at: DateTime<Utc>,
}

/// What an upsert or tombstone did to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The record was inserted, updated or removed.
    Applied,
    /// The index already holds a newer message for this record.
    Stale,
    /// A tombstone for a record the index does not know.
    Absent,
    /// The message would break a tree invariant and was not applied.
    Rejected(String),
}

/// Nested view of the directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirNode {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub is_broken: bool,
    pub children: Vec<DirNode>,
}

/// Filters for [`Database::search_files`](crate::Database::search_files).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileQuery {
    pub dir_id: Option<String>,
    pub name_contains: Option<String>,
    pub extension: Option<String>,
    pub limit: usize,
}

impl Default for FileQuery {
    fn default() -> Self {
        Self {
            dir_id: None,
            name_contains: None,
            extension: None,
            limit: 500,
        }
    }
}

/// Everything marked broken, for the repair view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenRecords {
    pub directories: Vec<DirectoryRecord>,
    pub files: Vec<FileRecord>,
}

impl BrokenRecords {
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.files.is_empty()
    }
}
