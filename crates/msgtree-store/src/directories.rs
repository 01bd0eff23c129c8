//! CRUD and sync-apply operations for [`DirectoryRecord`]s.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use msgtree_shared::constants::PLACEHOLDER_DIR_NAME;
use msgtree_shared::{ChannelId, MessageId};

use crate::database::{ts_from_sql, ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::models::{ApplyOutcome, DirNode, DirUpsert, DirectoryRecord, RecordRef, RemoteLocation};

const DIR_COLUMNS: &str =
    "id, parent_id, name, remote_channel_id, remote_message_id, is_broken, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single directory by id.
    pub fn get_directory(&self, id: &str) -> Result<DirectoryRecord> {
        self.find_directory(id)?.ok_or(StoreError::NotFound)
    }

    pub fn find_directory(&self, id: &str) -> Result<Option<DirectoryRecord>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {DIR_COLUMNS} FROM directories WHERE id = ?1"),
                params![id],
                row_to_directory,
            )
            .optional()?)
    }

    /// All directories ordered by name.
    pub fn list_directories(&self) -> Result<Vec<DirectoryRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {DIR_COLUMNS} FROM directories ORDER BY name COLLATE NOCASE, id"
        ))?;
        let rows = stmt.query_map([], row_to_directory)?;

        let mut dirs = Vec::new();
        for row in rows {
            dirs.push(row?);
        }
        Ok(dirs)
    }

    /// Number of `(subdirectories, files)` directly inside `id`.
    pub fn child_counts(&self, id: &str) -> Result<(u64, u64)> {
        let dirs: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM directories WHERE parent_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let files: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM files WHERE dir_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok((dirs as u64, files as u64))
    }

    /// Whether `ancestor` is `dir` itself or appears on its parent chain.
    pub fn is_self_or_ancestor(&self, ancestor: &str, dir: &str) -> Result<bool> {
        let hit: Option<i64> = self
            .conn()
            .query_row(
                "WITH RECURSIVE chain(id, depth) AS (
                     SELECT ?2, 0
                     UNION
                     SELECT d.parent_id, chain.depth + 1
                     FROM directories d JOIN chain ON d.id = chain.id
                     WHERE d.parent_id IS NOT NULL AND chain.depth < 10000
                 )
                 SELECT 1 FROM chain WHERE id = ?1 LIMIT 1",
                params![ancestor, dir],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// Nested tree of every directory. Directories whose parent is missing
    /// are attached to the root so nothing disappears from view.
    pub fn directory_tree(&self) -> Result<Vec<DirNode>> {
        let dirs = self.list_directories()?;
        let known: std::collections::HashSet<&str> = dirs.iter().map(|d| d.id.as_str()).collect();

        let mut by_parent: HashMap<Option<String>, Vec<&DirectoryRecord>> = HashMap::new();
        for d in &dirs {
            let parent = d
                .parent_id
                .clone()
                .filter(|p| known.contains(p.as_str()) && p != &d.id);
            by_parent.entry(parent).or_default().push(d);
        }

        fn build(
            parent: Option<String>,
            by_parent: &mut HashMap<Option<String>, Vec<&DirectoryRecord>>,
            depth: usize,
        ) -> Vec<DirNode> {
            let Some(children) = by_parent.remove(&parent) else {
                return Vec::new();
            };
            children
                .into_iter()
                .map(|d| DirNode {
                    id: d.id.clone(),
                    name: d.name.clone(),
                    parent_id: d.parent_id.clone(),
                    is_broken: d.is_broken,
                    children: if depth < 512 {
                        build(Some(d.id.clone()), by_parent, depth + 1)
                    } else {
                        Vec::new()
                    },
                })
                .collect()
        }

        Ok(build(None, &mut by_parent, 0))
    }

    // ------------------------------------------------------------------
    // Local writes (mutation commits, repair)
    // ------------------------------------------------------------------

    /// Insert a fully-formed record.
    pub fn insert_directory(&self, dir: &DirectoryRecord) -> Result<()> {
        self.conn().execute(
            &format!("INSERT INTO directories ({DIR_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                dir.id,
                dir.parent_id,
                dir.name,
                dir.remote_channel_id.map(|c| c.0),
                dir.remote_message_id.map(|m| m.0),
                dir.is_broken,
                ts_to_sql(&dir.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Rewrite name and parent of an existing directory.
    pub fn update_directory_placement(
        &self,
        id: &str,
        parent_id: Option<&str>,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE directories SET parent_id = ?2, name = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, parent_id, name, ts_to_sql(&at)],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Point a directory at a (new) remote message.
    pub fn set_directory_location(&self, id: &str, loc: RemoteLocation) -> Result<()> {
        self.release_location(loc, &RecordRef::Dir(id.to_string()))?;
        let affected = self.conn().execute(
            "UPDATE directories SET remote_channel_id = ?2, remote_message_id = ?3 WHERE id = ?1",
            params![id, loc.channel.0, loc.message.0],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Set or clear the broken flag. Returns `true` if the record exists.
    pub fn set_directory_broken(&self, id: &str, broken: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE directories SET is_broken = ?2 WHERE id = ?1",
            params![id, broken],
        )?;
        Ok(affected > 0)
    }

    /// Delete a directory. Returns `true` if a row was deleted.
    pub fn delete_directory(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM directories WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Make sure `id` exists, inserting an "Unknown folder" placeholder at the
    /// root if it does not. Returns `true` when a placeholder was created.
    pub fn ensure_directory(&self, id: &str, observed_at: DateTime<Utc>) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO directories (id, parent_id, name, is_broken, updated_at)
             VALUES (?1, NULL, ?2, 0, ?3)",
            params![id, PLACEHOLDER_DIR_NAME, ts_to_sql(&observed_at)],
        )?;
        if inserted > 0 {
            tracing::debug!(dir_id = id, "created placeholder directory");
        }
        Ok(inserted > 0)
    }

    // ------------------------------------------------------------------
    // Remote applies (sync, reconciliation)
    // ------------------------------------------------------------------

    /// Apply a directory tag seen on the remote. Newest message wins.
    pub fn upsert_directory_from_remote(&self, u: &DirUpsert) -> Result<ApplyOutcome> {
        if u.parent_id.as_deref() == Some(u.id.as_str()) {
            return Ok(ApplyOutcome::Rejected("directory is its own parent".into()));
        }

        let existing = self.find_directory(&u.id)?;
        if let Some(stored) = existing.as_ref().and_then(|d| d.remote_message_id) {
            if stored > u.location.message {
                return Ok(ApplyOutcome::Stale);
            }
        }

        if let Some(parent) = u.parent_id.as_deref() {
            if existing.is_some() && self.find_directory(parent)?.is_some() {
                if self.is_self_or_ancestor(&u.id, parent)? {
                    return Ok(ApplyOutcome::Rejected("move would create a cycle".into()));
                }
            } else {
                self.ensure_directory(parent, u.observed_at)?;
            }
        }

        self.release_location(u.location, &RecordRef::Dir(u.id.clone()))?;

        if existing.is_some() {
            self.conn().execute(
                "UPDATE directories
                 SET parent_id = ?2, name = ?3, remote_channel_id = ?4,
                     remote_message_id = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    u.id,
                    u.parent_id,
                    u.name,
                    u.location.channel.0,
                    u.location.message.0,
                    ts_to_sql(&u.observed_at),
                ],
            )?;
        } else {
            self.insert_directory(&DirectoryRecord {
                id: u.id.clone(),
                parent_id: u.parent_id.clone(),
                name: u.name.clone(),
                remote_channel_id: Some(u.location.channel),
                remote_message_id: Some(u.location.message),
                is_broken: false,
                updated_at: u.observed_at,
            })?;
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Apply a directory tombstone seen at `loc`.
    pub fn apply_directory_tombstone(&self, id: &str, loc: RemoteLocation) -> Result<ApplyOutcome> {
        let Some(existing) = self.find_directory(id)? else {
            return Ok(ApplyOutcome::Absent);
        };
        if let Some(stored) = existing.remote_message_id {
            if stored > loc.message {
                return Ok(ApplyOutcome::Stale);
            }
        }
        let (dirs, files) = self.child_counts(id)?;
        if dirs + files > 0 {
            return Ok(ApplyOutcome::Rejected(format!(
                "tombstone for non-empty directory ({dirs} dirs, {files} files)"
            )));
        }
        self.delete_directory(id)?;
        Ok(ApplyOutcome::Applied)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`DirectoryRecord`].
pub(crate) fn row_to_directory(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectoryRecord> {
    let updated_str: String = row.get(6)?;
    Ok(DirectoryRecord {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        name: row.get(2)?,
        remote_channel_id: row.get::<_, Option<i64>>(3)?.map(ChannelId),
        remote_message_id: row.get::<_, Option<i64>>(4)?.map(MessageId),
        is_broken: row.get(5)?,
        updated_at: ts_from_sql(6, &updated_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(msg: i64) -> RemoteLocation {
        RemoteLocation {
            channel: ChannelId(-100),
            message: MessageId(msg),
        }
    }

    fn dir_upsert(id: &str, parent: Option<&str>, name: &str, msg: i64) -> DirUpsert {
        DirUpsert {
            id: id.into(),
            parent_id: parent.map(String::from),
            name: name.into(),
            location: loc(msg),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let u = dir_upsert("d1", None, "A", 1);

        assert_eq!(db.upsert_directory_from_remote(&u).unwrap(), ApplyOutcome::Applied);
        let first = db.get_directory("d1").unwrap();
        assert_eq!(db.upsert_directory_from_remote(&u).unwrap(), ApplyOutcome::Applied);
        assert_eq!(db.get_directory("d1").unwrap(), first);
        assert_eq!(db.list_directories().unwrap().len(), 1);
    }

    #[test]
    fn older_message_does_not_overwrite() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_directory_from_remote(&dir_upsert("d1", None, "New", 5)).unwrap();
        let outcome = db
            .upsert_directory_from_remote(&dir_upsert("d1", None, "Old", 3))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(db.get_directory("d1").unwrap().name, "New");
    }

    #[test]
    fn unknown_parent_becomes_placeholder_until_seen() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_directory_from_remote(&dir_upsert("child", Some("p"), "Child", 2))
            .unwrap();

        let placeholder = db.get_directory("p").unwrap();
        assert_eq!(placeholder.name, PLACEHOLDER_DIR_NAME);
        assert!(placeholder.is_pending());

        db.upsert_directory_from_remote(&dir_upsert("p", None, "Parent", 7))
            .unwrap();
        assert_eq!(db.get_directory("p").unwrap().name, "Parent");
    }

    #[test]
    fn cycles_are_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_directory_from_remote(&dir_upsert("a", None, "A", 1)).unwrap();
        db.upsert_directory_from_remote(&dir_upsert("b", Some("a"), "B", 2)).unwrap();

        let outcome = db
            .upsert_directory_from_remote(&dir_upsert("a", Some("b"), "A", 3))
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Rejected(_)));
        assert_eq!(db.get_directory("a").unwrap().parent_id, None);
        assert!(db.is_self_or_ancestor("a", "b").unwrap());
        assert!(!db.is_self_or_ancestor("b", "a").unwrap());
    }

    #[test]
    fn tombstone_respects_children_and_age() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_directory_from_remote(&dir_upsert("a", None, "A", 1)).unwrap();
        db.upsert_directory_from_remote(&dir_upsert("b", Some("a"), "B", 2)).unwrap();

        assert!(matches!(
            db.apply_directory_tombstone("a", loc(1)).unwrap(),
            ApplyOutcome::Rejected(_)
        ));
        assert_eq!(db.apply_directory_tombstone("b", loc(1)).unwrap(), ApplyOutcome::Stale);
        assert_eq!(db.apply_directory_tombstone("b", loc(2)).unwrap(), ApplyOutcome::Applied);
        assert_eq!(db.apply_directory_tombstone("b", loc(2)).unwrap(), ApplyOutcome::Absent);
        assert_eq!(db.apply_directory_tombstone("a", loc(1)).unwrap(), ApplyOutcome::Applied);
    }

    #[test]
    fn tree_nests_children() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_directory_from_remote(&dir_upsert("a", None, "A", 1)).unwrap();
        db.upsert_directory_from_remote(&dir_upsert("b", Some("a"), "B", 2)).unwrap();
        db.upsert_directory_from_remote(&dir_upsert("c", None, "C", 3)).unwrap();

        let tree = db.directory_tree().unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].id, "a");
        assert_eq!(tree[0].children[0].id, "b");
        assert!(tree[1].children.is_empty());
    }
}
