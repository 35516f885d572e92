//! Rows persisted in the relay database.

use chrono::{DateTime, Utc};
use ferry_shared::{EnrichedRecord, Notice, NormalizedRecord};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A record as stored, with the time it was first ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub record: NormalizedRecord,
    pub ingested_at: DateTime<Utc>,
}

/// Outcome of committing one ingestion batch.
///
/// Only records that were newly inserted appear in `inserted`; ids the store
/// had already seen are silently skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommittedBatch {
    pub inserted: Vec<EnrichedRecord>,
    pub notices: Vec<Notice>,
}

// ---------------------------------------------------------------------------
// Authors
// ---------------------------------------------------------------------------

/// Latest profile seen for an upstream author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorProfile {
    pub author_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Block list
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedAuthor {
    pub author_id: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredNotice {
    pub id: i64,
    pub notice: Notice,
    pub created_at: DateTime<Utc>,
}
