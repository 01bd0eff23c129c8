//! Point-in-time snapshots of the whole index, used by backup/restore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::migrations::CURRENT_VERSION;
use crate::models::{DirectoryRecord, FileRecord, SyncCursor};

/// Full index export. Serialized to JSON and shipped to the backup channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Schema version of the index that produced the snapshot.
    pub schema_version: u32,
    /// App version that produced the snapshot.
    pub app_version: String,
    pub exported_at: DateTime<Utc>,
    pub directories: Vec<DirectoryRecord>,
    pub files: Vec<FileRecord>,
    pub cursors: Vec<SyncCursor>,
}

impl IndexSnapshot {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let snapshot: IndexSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.schema_version > CURRENT_VERSION {
            return Err(StoreError::Migration(format!(
                "snapshot schema v{} is newer than supported v{CURRENT_VERSION}",
                snapshot.schema_version
            )));
        }
        Ok(snapshot)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    pub directories_imported: usize,
    pub files_imported: usize,
    pub cursors_imported: usize,
}

impl Database {
    /// Export directories, files and cursors as one consistent snapshot.
    pub fn export_snapshot(&self) -> Result<IndexSnapshot> {
        self.in_transaction(|db| {
            Ok(IndexSnapshot {
                schema_version: CURRENT_VERSION,
                app_version: env!("CARGO_PKG_VERSION").to_string(),
                exported_at: Utc::now(),
                directories: db.list_directories()?,
                files: db.list_files()?,
                cursors: db.list_cursors()?,
            })
        })
    }

    /// Replace the whole index content with `snapshot`.
    pub fn import_snapshot(&self, snapshot: &IndexSnapshot) -> Result<ImportStats> {
        let stats = self.in_transaction(|db| {
            // Parents may follow their children in the export order.
            db.conn().pragma_update(None, "defer_foreign_keys", "ON")?;
            db.conn().execute_batch(
                "DELETE FROM files;
                 DELETE FROM directories;
                 DELETE FROM sync_cursors;",
            )?;

            let mut stats = ImportStats::default();
            for dir in &snapshot.directories {
                db.insert_directory(dir)?;
                stats.directories_imported += 1;
            }
            for file in &snapshot.files {
                db.insert_file(file)?;
                stats.files_imported += 1;
            }
            for cursor in &snapshot.cursors {
                db.advance_cursor(cursor.channel_id, cursor.last_message_id, cursor.updated_at)?;
                stats.cursors_imported += 1;
            }
            Ok(stats)
        })?;

        tracing::info!(
            directories = stats.directories_imported,
            files = stats.files_imported,
            cursors = stats.cursors_imported,
            "snapshot imported"
        );
        Ok(stats)
    }
}
