//! CRUD and sync-apply operations for [`FileRecord`]s.

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension};

use msgtree_shared::{ChannelId, MessageId};

use crate::database::{ts_from_sql, ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::models::{ApplyOutcome, FileQuery, FileRecord, FileUpsert, RecordRef, RemoteLocation};

const FILE_COLUMNS: &str = "id, dir_id, name, size_bytes, content_hash, remote_channel_id, \
                            remote_message_id, remote_file_ref, is_broken, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_file(&self, id: &str) -> Result<FileRecord> {
        self.find_file(id)?.ok_or(StoreError::NotFound)
    }

    pub fn find_file(&self, id: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                params![id],
                row_to_file,
            )
            .optional()?)
    }

    /// Files directly inside `dir_id`, ordered by name.
    pub fn list_files_in_dir(&self, dir_id: &str) -> Result<Vec<FileRecord>> {
        self.search_files(&FileQuery {
            dir_id: Some(dir_id.to_string()),
            limit: usize::MAX,
            ..FileQuery::default()
        })
    }

    /// Every file in the index.
    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        self.search_files(&FileQuery {
            limit: usize::MAX,
            ..FileQuery::default()
        })
    }

    /// Case-insensitive search over file names.
    pub fn search_files(&self, query: &FileQuery) -> Result<Vec<FileRecord>> {
        let mut sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE 1 = 1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(dir_id) = &query.dir_id {
            args.push(Box::new(dir_id.clone()));
            sql.push_str(&format!(" AND dir_id = ?{}", args.len()));
        }
        if let Some(needle) = query.name_contains.as_deref().filter(|s| !s.is_empty()) {
            args.push(Box::new(format!("%{}%", escape_like(needle))));
            sql.push_str(&format!(" AND name LIKE ?{} ESCAPE '\\'", args.len()));
        }
        if let Some(ext) = query.extension.as_deref() {
            let ext = ext.trim_start_matches('.');
            if !ext.is_empty() {
                args.push(Box::new(format!("%_.{}", escape_like(ext))));
                sql.push_str(&format!(" AND name LIKE ?{} ESCAPE '\\'", args.len()));
            }
        }
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        args.push(Box::new(limit));
        sql.push_str(&format!(" ORDER BY name COLLATE NOCASE, id LIMIT ?{}", args.len()));

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_file,
        )?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    // ------------------------------------------------------------------
    // Local writes (mutation commits, repair)
    // ------------------------------------------------------------------

    pub fn insert_file(&self, file: &FileRecord) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO files ({FILE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                file.id,
                file.dir_id,
                file.name,
                file.size_bytes as i64,
                file.content_hash,
                file.remote_channel_id.map(|c| c.0),
                file.remote_message_id.map(|m| m.0),
                file.remote_file_ref,
                file.is_broken,
                ts_to_sql(&file.created_at),
            ],
        )?;
        Ok(())
    }

    /// Move and/or rename a file.
    pub fn update_file_placement(&self, id: &str, dir_id: &str, name: &str) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE files SET dir_id = ?2, name = ?3 WHERE id = ?1",
            params![id, dir_id, name],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Point a file at a (new) remote message and payload.
    pub fn set_file_location(
        &self,
        id: &str,
        loc: RemoteLocation,
        remote_file_ref: Option<&str>,
    ) -> Result<()> {
        self.release_location(loc, &RecordRef::File(id.to_string()))?;
        let affected = self.conn().execute(
            "UPDATE files
             SET remote_channel_id = ?2, remote_message_id = ?3,
                 remote_file_ref = COALESCE(?4, remote_file_ref)
             WHERE id = ?1",
            params![id, loc.channel.0, loc.message.0, remote_file_ref],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Replace content fields after a repair with a new payload.
    pub fn set_file_content(&self, id: &str, size_bytes: u64, content_hash: &str) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE files SET size_bytes = ?2, content_hash = ?3 WHERE id = ?1",
            params![id, size_bytes as i64, content_hash],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_file_broken(&self, id: &str, broken: bool) -> Result<bool> {
        let affected = self
            .conn()
            .execute("UPDATE files SET is_broken = ?2 WHERE id = ?1", params![id, broken])?;
        Ok(affected > 0)
    }

    pub fn delete_file(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM files WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Remote applies (sync, reconciliation)
    // ------------------------------------------------------------------

    /// Apply a file tag seen on the remote. Newest message wins; the owning
    /// directory is created as a placeholder when unknown.
    pub fn upsert_file_from_remote(&self, u: &FileUpsert) -> Result<ApplyOutcome> {
        let existing = self.find_file(&u.id)?;
        if let Some(stored) = existing.as_ref().and_then(|f| f.remote_message_id) {
            if stored > u.location.message {
                return Ok(ApplyOutcome::Stale);
            }
        }

        self.ensure_directory(&u.dir_id, u.observed_at)?;
        self.release_location(u.location, &RecordRef::File(u.id.clone()))?;

        match existing {
            Some(_) => {
                self.conn().execute(
                    "UPDATE files
                     SET dir_id = ?2, name = ?3, size_bytes = ?4, content_hash = ?5,
                         remote_channel_id = ?6, remote_message_id = ?7,
                         remote_file_ref = COALESCE(?8, remote_file_ref)
                     WHERE id = ?1",
                    params![
                        u.id,
                        u.dir_id,
                        u.name,
                        u.size_bytes as i64,
                        u.content_hash,
                        u.location.channel.0,
                        u.location.message.0,
                        u.remote_file_ref,
                    ],
                )?;
            }
            None => self.insert_file(&FileRecord {
                id: u.id.clone(),
                dir_id: u.dir_id.clone(),
                name: u.name.clone(),
                size_bytes: u.size_bytes,
                content_hash: u.content_hash.clone(),
                remote_channel_id: Some(u.location.channel),
                remote_message_id: Some(u.location.message),
                remote_file_ref: u.remote_file_ref.clone(),
                created_at: u.observed_at,
                is_broken: false,
            })?,
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Apply a file tombstone seen at `loc`.
    pub fn apply_file_tombstone(&self, id: &str, loc: RemoteLocation) -> Result<ApplyOutcome> {
        let Some(existing) = self.find_file(id)? else {
            return Ok(ApplyOutcome::Absent);
        };
        if let Some(stored) = existing.remote_message_id {
            if stored > loc.message {
                return Ok(ApplyOutcome::Stale);
            }
        }
        self.delete_file(id)?;
        Ok(ApplyOutcome::Applied)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Map a `rusqlite::Row` to a [`FileRecord`].
pub(crate) fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let size: i64 = row.get(3)?;
    let created_str: String = row.get(9)?;
    let created_at: DateTime<Utc> = ts_from_sql(9, &created_str)?;
    Ok(FileRecord {
        id: row.get(0)?,
        dir_id: row.get(1)?,
        name: row.get(2)?,
        size_bytes: size.max(0) as u64,
        content_hash: row.get(4)?,
        remote_channel_id: row.get::<_, Option<i64>>(5)?.map(ChannelId),
        remote_message_id: row.get::<_, Option<i64>>(6)?.map(MessageId),
        remote_file_ref: row.get(7)?,
        is_broken: row.get(8)?,
        created_at,
    })
}
