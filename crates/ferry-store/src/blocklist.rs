use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::BlockedAuthor;

impl Database {
    /// Block an upstream author. Re-blocking updates the reason.
    pub fn block_author(&self, author_id: &str, reason: Option<&str>) -> Result<BlockedAuthor> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO blocked_authors (author_id, reason, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(author_id) DO UPDATE SET reason = excluded.reason",
            params![author_id, reason, now.to_rfc3339()],
        )?;

        tracing::info!(author = %author_id, "author blocked");

        Ok(BlockedAuthor {
            author_id: author_id.to_string(),
            reason: reason.map(str::to_string),
            created_at: now,
        })
    }

    pub fn unblock_author(&self, author_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM blocked_authors WHERE author_id = ?1",
            params![author_id],
        )?;
        Ok(affected > 0)
    }

    pub fn is_blocked(&self, author_id: &str) -> Result<bool> {
        let hit: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM blocked_authors WHERE author_id = ?1",
                params![author_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    pub fn blocked_authors(&self) -> Result<Vec<BlockedAuthor>> {
        let mut stmt = self.conn().prepare(
            "SELECT author_id, reason, created_at FROM blocked_authors ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            let ts_str: String = row.get(2)?;
            let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
            Ok(BlockedAuthor {
                author_id: row.get(0)?,
                reason: row.get(1)?,
                created_at,
            })
        })?;

        let mut blocked = Vec::new();
        for row in rows {
            blocked.push(row?);
        }
        Ok(blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_and_unblock() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();

        assert!(!db.is_blocked("spammer").unwrap());

        db.block_author("spammer", Some("links")).unwrap();
        db.block_author("spammer", Some("more links")).unwrap();
        assert!(db.is_blocked("spammer").unwrap());

        let listed = db.blocked_authors().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reason.as_deref(), Some("more links"));

        assert!(db.unblock_author("spammer").unwrap());
        assert!(!db.unblock_author("spammer").unwrap());
        assert!(!db.is_blocked("spammer").unwrap());
    }
}
