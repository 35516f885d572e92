use chrono::{DateTime, Utc};
use ferry_shared::{ExternalId, Notice, NoticeKind};
use rusqlite::{params, Connection};

use crate::database::Database;
use crate::error::Result;
use crate::models::StoredNotice;

impl Database {
    /// Most recent notifications for one user, newest first.
    pub fn notifications_for(&self, target_uid: &str, limit: u32) -> Result<Vec<StoredNotice>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, target_uid, kind, record_id, from_uid, from_name, created_at
             FROM notifications
             WHERE target_uid = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![target_uid, limit], row_to_notice)?;

        let mut notices = Vec::new();
        for row in rows {
            notices.push(row?);
        }
        Ok(notices)
    }
}

pub(crate) fn insert_notice(conn: &Connection, notice: &Notice, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO notifications (target_uid, kind, record_id, from_uid, from_name, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            notice.target_uid,
            notice.kind.as_str(),
            notice.record_id.as_str(),
            notice.from_uid,
            notice.from_name,
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_notice(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredNotice> {
    let kind_str: String = row.get(2)?;
    let record_str: String = row.get(3)?;
    let ts_str: String = row.get(6)?;

    let kind = NoticeKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown notice kind {kind_str:?}").into(),
        )
    })?;
    let record_id = ExternalId::parse(&record_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(StoredNotice {
        id: row.get(0)?,
        notice: Notice {
            target_uid: row.get(1)?,
            kind,
            record_id,
            from_uid: row.get(4)?,
            from_name: row.get(5)?,
        },
        created_at,
    })
}
