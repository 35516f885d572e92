use chrono::{DateTime, Utc};
use ferry_shared::NormalizedRecord;
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::AuthorProfile;

impl Database {
    pub fn get_author(&self, author_id: &str) -> Result<AuthorProfile> {
        self.conn()
            .query_row(
                "SELECT author_id, display_name, avatar, updated_at
                 FROM authors WHERE author_id = ?1",
                params![author_id],
                |row| {
                    let ts_str: String = row.get(3)?;
                    let updated_at = DateTime::parse_from_rfc3339(&ts_str)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                3,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?;
                    Ok(AuthorProfile {
                        author_id: row.get(0)?,
                        display_name: row.get(1)?,
                        avatar: row.get(2)?,
                        updated_at,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}

/// Record the latest name and avatar an author was seen with.
pub(crate) fn upsert_author(
    conn: &Connection,
    record: &NormalizedRecord,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO authors (author_id, display_name, avatar, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(author_id) DO UPDATE SET
            display_name = excluded.display_name,
            avatar = COALESCE(excluded.avatar, authors.avatar),
            updated_at = excluded.updated_at",
        params![
            record.author_id,
            record.display_name,
            record.avatar,
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Case-insensitive display name lookup. When several authors share a name
/// the most recently active one wins.
pub(crate) fn find_author_by_name(conn: &Connection, name: &str) -> Result<Option<String>> {
    let author = conn
        .query_row(
            "SELECT author_id FROM authors
             WHERE display_name = ?1 COLLATE NOCASE
             ORDER BY updated_at DESC LIMIT 1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(author)
}
