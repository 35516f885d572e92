//! v002 -- Flag records stored with a substituted timestamp.
//!
//! Clamped records keep the time they were received rather than the time
//! upstream claimed, so they must not be used to resume ingestion.

use rusqlite::Connection;

/// SQL executed when upgrading from version 1 to version 2.
const UP_SQL: &str = r#"
ALTER TABLE records ADD COLUMN clamped INTEGER NOT NULL DEFAULT 0;
"#;

/// Apply the migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
