//! What the poller needs from persistence.

use std::collections::HashSet;
use std::future::Future;

use ferry_shared::{ExternalId, NormalizedRecord};
use ferry_store::CommittedBatch;

use crate::db::SharedDatabase;
use crate::error::IngestError;

pub trait IngestStore: Send + Sync {
    /// The subset of `authors` currently on the block list.
    fn blocked_among(
        &self,
        authors: Vec<String>,
    ) -> impl Future<Output = Result<HashSet<String>, IngestError>> + Send;

    /// Persist a sorted batch atomically. Already-stored ids are skipped.
    /// Ids in `clamped` carry a substituted timestamp and are never used to
    /// restore the cursor.
    fn commit(
        &self,
        records: Vec<NormalizedRecord>,
        clamped: HashSet<ExternalId>,
    ) -> impl Future<Output = Result<CommittedBatch, IngestError>> + Send;

    /// Newest stored `(timestamp, ids)` not after `not_after`, ignoring
    /// clamped records.
    fn latest_cursor(
        &self,
        not_after: i64,
    ) -> impl Future<Output = Result<Option<(i64, Vec<ExternalId>)>, IngestError>> + Send;
}

impl IngestStore for SharedDatabase {
    async fn blocked_among(&self, authors: Vec<String>) -> Result<HashSet<String>, IngestError> {
        let blocked = self
            .call(move |db| {
                let mut blocked = HashSet::new();
                for author in authors {
                    if db.is_blocked(&author)? {
                        blocked.insert(author);
                    }
                }
                Ok(blocked)
            })
            .await?;
        Ok(blocked)
    }

    async fn commit(
        &self,
        records: Vec<NormalizedRecord>,
        clamped: HashSet<ExternalId>,
    ) -> Result<CommittedBatch, IngestError> {
        Ok(self.call(move |db| db.commit_batch(&records, &clamped)).await?)
    }

    async fn latest_cursor(
        &self,
        not_after: i64,
    ) -> Result<Option<(i64, Vec<ExternalId>)>, IngestError> {
        Ok(self.call(move |db| db.latest_cursor(not_after)).await?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use ferry_shared::EnrichedRecord;

    use super::*;

    /// In-memory store with the same dedup contract as the real one.
    #[derive(Default)]
    pub struct MemoryStore {
        pub stored: Mutex<Vec<NormalizedRecord>>,
        pub clamped: Mutex<HashSet<ExternalId>>,
        pub blocked: Mutex<HashSet<String>>,
        pub fail_commits: Mutex<bool>,
    }

    impl IngestStore for MemoryStore {
        async fn blocked_among(&self, authors: Vec<String>) -> Result<HashSet<String>, IngestError> {
            let blocked = self.blocked.lock().unwrap();
            Ok(authors.into_iter().filter(|a| blocked.contains(a)).collect())
        }

        async fn commit(
            &self,
            records: Vec<NormalizedRecord>,
            clamped: HashSet<ExternalId>,
        ) -> Result<CommittedBatch, IngestError> {
            if *self.fail_commits.lock().unwrap() {
                return Err(IngestError::Store(ferry_store::StoreError::Migration(
                    "simulated failure".into(),
                )));
            }
            let mut stored = self.stored.lock().unwrap();
            let mut batch = CommittedBatch::default();
            for record in records {
                if stored.iter().any(|s| s.id == record.id) {
                    continue;
                }
                if clamped.contains(&record.id) {
                    self.clamped.lock().unwrap().insert(record.id.clone());
                }
                stored.push(record.clone());
                batch.inserted.push(EnrichedRecord::from(record));
            }
            Ok(batch)
        }

        async fn latest_cursor(
            &self,
            not_after: i64,
        ) -> Result<Option<(i64, Vec<ExternalId>)>, IngestError> {
            let stored = self.stored.lock().unwrap();
            let clamped = self.clamped.lock().unwrap();
            let eligible: Vec<&NormalizedRecord> =
                stored.iter().filter(|r| !clamped.contains(&r.id)).collect();
            let Some(newest) = eligible
                .iter()
                .map(|r| r.timestamp)
                .filter(|ts| *ts <= not_after)
                .max()
            else {
                return Ok(None);
            };
            let ids = eligible
                .iter()
                .filter(|r| r.timestamp == newest)
                .map(|r| r.id.clone())
                .collect();
            Ok(Some((newest, ids)))
        }
    }
}
