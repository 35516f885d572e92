//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `records`, `authors`, `blocked_authors`,
//! and `notifications`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Records ingested from upstream
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS records (
    external_id  TEXT PRIMARY KEY NOT NULL,   -- canonical decimal string, any length
    author_id    TEXT NOT NULL,
    display_name TEXT NOT NULL,
    avatar       TEXT,
    color        TEXT,
    timestamp    INTEGER NOT NULL,            -- epoch seconds
    body         TEXT NOT NULL,
    kind         TEXT NOT NULL,
    reply_to     TEXT,                        -- external id of the reply target
    ingested_at  TEXT NOT NULL                -- RFC-3339
);

CREATE INDEX IF NOT EXISTS idx_records_ts
    ON records(timestamp DESC);

-- ----------------------------------------------------------------
-- Author profiles (latest name/avatar seen upstream)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS authors (
    author_id    TEXT PRIMARY KEY NOT NULL,
    display_name TEXT NOT NULL,
    avatar       TEXT,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_authors_name
    ON authors(display_name COLLATE NOCASE);

-- ----------------------------------------------------------------
-- Block list
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocked_authors (
    author_id  TEXT PRIMARY KEY NOT NULL,
    reason     TEXT,
    created_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Direct notifications (reply / mention alerts)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS notifications (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    target_uid  TEXT NOT NULL,
    kind        TEXT NOT NULL,                -- 'reply' | 'mention'
    record_id   TEXT NOT NULL,                -- FK -> records(external_id)
    from_uid    TEXT NOT NULL,
    from_name   TEXT NOT NULL,
    created_at  TEXT NOT NULL,

    FOREIGN KEY (record_id) REFERENCES records(external_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_notifications_target
    ON notifications(target_uid, id DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
