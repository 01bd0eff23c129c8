//! v001 -- Initial schema creation.
//!
//! Creates `directories`, `files`, `sync_cursors` and the `sync_state`
//! key/value table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Directories
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS directories (
    id                 TEXT PRIMARY KEY NOT NULL,
    parent_id          TEXT,                      -- NULL = root level
    name               TEXT NOT NULL,
    remote_channel_id  INTEGER,
    remote_message_id  INTEGER,                   -- NULL = pending / placeholder
    is_broken          INTEGER NOT NULL DEFAULT 0,
    updated_at         TEXT NOT NULL,             -- RFC-3339

    FOREIGN KEY (parent_id) REFERENCES directories(id)
);

CREATE INDEX IF NOT EXISTS idx_directories_parent
    ON directories(parent_id);

CREATE UNIQUE INDEX IF NOT EXISTS idx_directories_remote
    ON directories(remote_channel_id, remote_message_id)
    WHERE remote_message_id IS NOT NULL;

-- ----------------------------------------------------------------
-- Files
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    id                 TEXT PRIMARY KEY NOT NULL,
    dir_id             TEXT NOT NULL,
    name               TEXT NOT NULL,
    size_bytes         INTEGER NOT NULL DEFAULT 0,
    content_hash       TEXT NOT NULL,
    remote_channel_id  INTEGER,
    remote_message_id  INTEGER,
    remote_file_ref    TEXT,                      -- opaque payload reference
    is_broken          INTEGER NOT NULL DEFAULT 0,
    created_at         TEXT NOT NULL,

    FOREIGN KEY (dir_id) REFERENCES directories(id)
);

CREATE INDEX IF NOT EXISTS idx_files_dir
    ON files(dir_id, name);

CREATE INDEX IF NOT EXISTS idx_files_hash
    ON files(content_hash);

CREATE UNIQUE INDEX IF NOT EXISTS idx_files_remote
    ON files(remote_channel_id, remote_message_id)
    WHERE remote_message_id IS NOT NULL;

-- ----------------------------------------------------------------
-- Sync cursors (one row per remote channel)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_cursors (
    channel_id       INTEGER PRIMARY KEY NOT NULL,
    last_message_id  INTEGER NOT NULL,
    updated_at       TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Misc engine state (backup sequence, last reconcile, ...)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_state (
    key    TEXT PRIMARY KEY NOT NULL,
    value  TEXT NOT NULL
);
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
