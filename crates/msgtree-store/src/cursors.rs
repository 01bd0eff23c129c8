//! Per-channel sync cursors.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use msgtree_shared::{ChannelId, MessageId};

use crate::database::{ts_from_sql, ts_to_sql, Database};
use crate::error::Result;
use crate::models::SyncCursor;

impl Database {
    pub fn get_cursor(&self, channel: ChannelId) -> Result<Option<SyncCursor>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT channel_id, last_message_id, updated_at
                 FROM sync_cursors WHERE channel_id = ?1",
                params![channel.0],
                row_to_cursor,
            )
            .optional()?)
    }

    pub fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        let mut stmt = self.conn().prepare(
            "SELECT channel_id, last_message_id, updated_at
             FROM sync_cursors ORDER BY channel_id",
        )?;
        let cursors = stmt
            .query_map([], row_to_cursor)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cursors)
    }

    /// Move the cursor of `channel` forward to `to`. A cursor never moves
    /// backwards; the stored position is returned.
    pub fn advance_cursor(
        &self,
        channel: ChannelId,
        to: MessageId,
        at: DateTime<Utc>,
    ) -> Result<MessageId> {
        self.conn().execute(
            "INSERT INTO sync_cursors (channel_id, last_message_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(channel_id) DO UPDATE SET
                 last_message_id = MAX(last_message_id, excluded.last_message_id),
                 updated_at = excluded.updated_at",
            params![channel.0, to.0, ts_to_sql(&at)],
        )?;
        let stored: i64 = self.conn().query_row(
            "SELECT last_message_id FROM sync_cursors WHERE channel_id = ?1",
            params![channel.0],
            |row| row.get(0),
        )?;
        Ok(MessageId(stored))
    }

    /// Forget the cursor of `channel`. Only a full rebuild does this.
    pub fn reset_cursor(&self, channel: ChannelId) -> Result<()> {
        self.conn()
            .execute("DELETE FROM sync_cursors WHERE channel_id = ?1", params![channel.0])?;
        Ok(())
    }
}

fn row_to_cursor(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncCursor> {
    let updated: String = row.get(2)?;
    Ok(SyncCursor {
        channel_id: ChannelId(row.get(0)?),
        last_message_id: MessageId(row.get(1)?),
        updated_at: ts_from_sql(2, &updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_monotonic() {
        let db = Database::open_in_memory().unwrap();
        let ch = ChannelId(-42);
        assert!(db.get_cursor(ch).unwrap().is_none());

        assert_eq!(db.advance_cursor(ch, MessageId(10), Utc::now()).unwrap(), MessageId(10));
        assert_eq!(db.advance_cursor(ch, MessageId(4), Utc::now()).unwrap(), MessageId(10));
        assert_eq!(db.get_cursor(ch).unwrap().unwrap().last_message_id, MessageId(10));

        db.reset_cursor(ch).unwrap();
        assert!(db.get_cursor(ch).unwrap().is_none());
    }
}
