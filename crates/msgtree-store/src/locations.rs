//! Lookups by remote message, shared by both record tables.

use rusqlite::{params, OptionalExtension};

use msgtree_shared::{ChannelId, MessageId};

use crate::database::Database;
use crate::directories::row_to_directory;
use crate::error::Result;
use crate::files::row_to_file;
use crate::models::{BrokenRecords, RecordRef, RemoteLocation};

impl Database {
    /// The record (if any) currently encoded by the message at `loc`.
    pub fn find_by_location(&self, loc: RemoteLocation) -> Result<Option<RecordRef>> {
        let dir: Option<String> = self
            .conn()
            .query_row(
                "SELECT id FROM directories
                 WHERE remote_channel_id = ?1 AND remote_message_id = ?2",
                params![loc.channel.0, loc.message.0],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = dir {
            return Ok(Some(RecordRef::Dir(id)));
        }

        let file: Option<String> = self
            .conn()
            .query_row(
                "SELECT id FROM files
                 WHERE remote_channel_id = ?1 AND remote_message_id = ?2",
                params![loc.channel.0, loc.message.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(file.map(RecordRef::File))
    }

    /// Detach every record other than `keep` from the message at `loc`, so a
    /// message identifies at most one record.
    pub fn release_location(&self, loc: RemoteLocation, keep: &RecordRef) -> Result<()> {
        let (keep_dir, keep_file) = match keep {
            RecordRef::Dir(id) => (Some(id.as_str()), None),
            RecordRef::File(id) => (None, Some(id.as_str())),
        };

        let dirs = self.conn().execute(
            "UPDATE directories SET remote_channel_id = NULL, remote_message_id = NULL
             WHERE remote_channel_id = ?1 AND remote_message_id = ?2
               AND (?3 IS NULL OR id != ?3)",
            params![loc.channel.0, loc.message.0, keep_dir],
        )?;
        let files = self.conn().execute(
            "UPDATE files SET remote_channel_id = NULL, remote_message_id = NULL
             WHERE remote_channel_id = ?1 AND remote_message_id = ?2
               AND (?3 IS NULL OR id != ?3)",
            params![loc.channel.0, loc.message.0, keep_file],
        )?;
        if dirs + files > 0 {
            tracing::debug!(
                channel = %loc.channel,
                message_id = %loc.message,
                released = dirs + files,
                "message re-assigned to another record"
            );
        }
        Ok(())
    }

    /// Records whose message id is `from` or later on `channel`, ascending.
    pub fn records_from(&self, channel: ChannelId, from: MessageId) -> Result<Vec<(RecordRef, MessageId)>> {
        let mut stmt = self.conn().prepare(
            "SELECT 'dir', id, remote_message_id FROM directories
             WHERE remote_channel_id = ?1 AND remote_message_id >= ?2
             UNION ALL
             SELECT 'file', id, remote_message_id FROM files
             WHERE remote_channel_id = ?1 AND remote_message_id >= ?2
             ORDER BY 3",
        )?;
        let rows = stmt.query_map(params![channel.0, from.0], |row| {
            let kind: String = row.get(0)?;
            let id: String = row.get(1)?;
            let msg: i64 = row.get(2)?;
            let r = if kind == "dir" {
                RecordRef::Dir(id)
            } else {
                RecordRef::File(id)
            };
            Ok((r, MessageId(msg)))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Every record currently flagged broken.
    pub fn list_broken(&self) -> Result<BrokenRecords> {
        let mut stmt = self.conn().prepare(
            "SELECT id, parent_id, name, remote_channel_id, remote_message_id, is_broken, updated_at
             FROM directories WHERE is_broken = 1 ORDER BY name COLLATE NOCASE, id",
        )?;
        let directories = stmt
            .query_map([], row_to_directory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = self.conn().prepare(
            "SELECT id, dir_id, name, size_bytes, content_hash, remote_channel_id,
                    remote_message_id, remote_file_ref, is_broken, created_at
             FROM files WHERE is_broken = 1 ORDER BY name COLLATE NOCASE, id",
        )?;
        let files = stmt
            .query_map([], row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(BrokenRecords { directories, files })
    }
}
