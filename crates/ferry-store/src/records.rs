use std::collections::HashSet;

use chrono::{DateTime, Utc};
use ferry_shared::constants::REPLY_PREVIEW_CHARS;
use ferry_shared::{EnrichedRecord, ExternalId, Notice, NoticeKind, NormalizedRecord, ReplyPreview};
use rusqlite::{params, Connection, OptionalExtension};

use crate::authors::{find_author_by_name, upsert_author};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{CommittedBatch, StoredRecord};
use crate::notifications::insert_notice;

impl Database {
    /// Persist a batch of records in one transaction.
    ///
    /// Records whose external id is already stored are skipped. Every newly
    /// inserted record is enriched (reply preview) and raises its reply and
    /// mention notices inside the same transaction; if anything fails, the
    /// whole batch is rolled back and nothing from it is visible.
    ///
    /// Ids in `clamped` are stored with a substituted timestamp and are
    /// skipped by [`Database::latest_cursor`].
    pub fn commit_batch(
        &mut self,
        records: &[NormalizedRecord],
        clamped: &HashSet<ExternalId>,
    ) -> Result<CommittedBatch> {
        let tx = self.conn_mut().transaction()?;
        let now = Utc::now();
        let mut batch = CommittedBatch::default();

        for record in records {
            if !insert_record(&tx, record, clamped.contains(&record.id), now)? {
                continue;
            }
            upsert_author(&tx, record, now)?;

            let reply_to = match &record.reply_to_id {
                Some(target) => reply_preview(&tx, target)?,
                None => None,
            };

            let notices = collect_notices(&tx, record, reply_to.as_ref())?;
            for notice in &notices {
                insert_notice(&tx, notice, now)?;
            }

            batch.notices.extend(notices);
            batch.inserted.push(EnrichedRecord {
                record: record.clone(),
                reply_to,
                temp_id: None,
            });
        }

        tx.commit()?;

        tracing::debug!(
            offered = records.len(),
            inserted = batch.inserted.len(),
            notices = batch.notices.len(),
            "committed ingestion batch"
        );

        Ok(batch)
    }

    pub fn get_record(&self, id: &ExternalId) -> Result<StoredRecord> {
        self.conn()
            .query_row(
                "SELECT external_id, author_id, display_name, avatar, color, timestamp,
                        body, kind, reply_to, ingested_at
                 FROM records WHERE external_id = ?1",
                params![id.as_str()],
                row_to_record,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn count_records(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Newest stored timestamp not after `not_after`, together with every
    /// external id recorded at that timestamp. Used to resume the ingestion
    /// cursor after a restart. Clamped records never count.
    pub fn latest_cursor(&self, not_after: i64) -> Result<Option<(i64, Vec<ExternalId>)>> {
        let newest: Option<i64> = self.conn().query_row(
            "SELECT MAX(timestamp) FROM records WHERE timestamp <= ?1 AND clamped = 0",
            params![not_after],
            |row| row.get(0),
        )?;

        let Some(timestamp) = newest else {
            return Ok(None);
        };

        let mut stmt = self
            .conn()
            .prepare("SELECT external_id FROM records WHERE timestamp = ?1 AND clamped = 0")?;
        let rows = stmt.query_map(params![timestamp], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            let raw = row?;
            let id = ExternalId::parse(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            ids.push(id);
        }
        ids.sort();

        Ok(Some((timestamp, ids)))
    }
}

/// Returns `false` when the external id was already stored.
fn insert_record(
    conn: &Connection,
    record: &NormalizedRecord,
    clamped: bool,
    now: DateTime<Utc>,
) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO records
            (external_id, author_id, display_name, avatar, color, timestamp, body, kind, reply_to,
             ingested_at, clamped)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.id.as_str(),
            record.author_id,
            record.display_name,
            record.avatar,
            record.color,
            record.timestamp,
            record.body,
            record.kind,
            record.reply_to_id.as_ref().map(ExternalId::as_str),
            now.to_rfc3339(),
            clamped,
        ],
    )?;
    Ok(affected == 1)
}

fn reply_preview(conn: &Connection, target: &ExternalId) -> Result<Option<ReplyPreview>> {
    let row = conn
        .query_row(
            "SELECT author_id, display_name, body FROM records WHERE external_id = ?1",
            params![target.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    Ok(row.map(|(author_id, display_name, body)| ReplyPreview {
        id: target.clone(),
        author_id,
        display_name,
        body: body.chars().take(REPLY_PREVIEW_CHARS).collect(),
    }))
}

/// Reply and mention alerts for one record. Authors are never alerted
/// about their own records, and each target is alerted at most once.
fn collect_notices(
    conn: &Connection,
    record: &NormalizedRecord,
    reply_to: Option<&ReplyPreview>,
) -> Result<Vec<Notice>> {
    let mut notices: Vec<Notice> = Vec::new();
    let mut push = |target_uid: String, kind: NoticeKind| {
        if target_uid == record.author_id || notices.iter().any(|n| n.target_uid == target_uid) {
            return;
        }
        notices.push(Notice {
            target_uid,
            kind,
            record_id: record.id.clone(),
            from_uid: record.author_id.clone(),
            from_name: record.display_name.clone(),
        });
    };

    if let Some(preview) = reply_to {
        push(preview.author_id.clone(), NoticeKind::Reply);
    }

    for name in mentioned_names(&record.body) {
        if let Some(author_id) = find_author_by_name(conn, name)? {
            push(author_id, NoticeKind::Mention);
        }
    }

    Ok(notices)
}

/// `@name` tokens in a body, without the `@`.
fn mentioned_names(body: &str) -> impl Iterator<Item = &str> {
    body.split(|c: char| c.is_whitespace())
        .filter_map(|word| word.strip_prefix('@'))
        .map(|name| name.trim_end_matches(|c: char| !(c.is_alphanumeric() || c == '_')))
        .filter(|name| !name.is_empty())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
    let id_str: String = row.get(0)?;
    let reply_str: Option<String> = row.get(8)?;
    let ts_str: String = row.get(9)?;

    let id = ExternalId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let reply_to_id = reply_str
        .map(|s| ExternalId::parse(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let ingested_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(StoredRecord {
        record: NormalizedRecord {
            id,
            author_id: row.get(1)?,
            display_name: row.get(2)?,
            avatar: row.get(3)?,
            color: row.get(4)?,
            timestamp: row.get(5)?,
            body: row.get(6)?,
            kind: row.get(7)?,
            reply_to_id,
        },
        ingested_at,
    })
}
