//! The resumption point of normal-mode ingestion.

use ferry_shared::{ExternalId, NormalizedRecord};

/// Last accepted timestamp plus every external id accepted at exactly that
/// timestamp, used as the tie-break for records sharing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    timestamp: i64,
    ids: Vec<ExternalId>,
    /// Completed normal cycles; drives the sweep cadence.
    ticks: u64,
}

impl Cursor {
    pub fn new(timestamp: i64, mut ids: Vec<ExternalId>) -> Self {
        ids.sort();
        ids.dedup();
        Self {
            timestamp,
            ids,
            ticks: 0,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn ids(&self) -> &[ExternalId] {
        &self.ids
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    /// Strictly after the cursor in `(timestamp, id)` order.
    pub fn is_newer(&self, record: &NormalizedRecord) -> bool {
        if record.timestamp != self.timestamp {
            return record.timestamp > self.timestamp;
        }
        match self.ids.last() {
            Some(max) => record.id > *max,
            None => true,
        }
    }

    /// Move forward to the newest of `records`. Never moves backward; a
    /// batch ending at the current timestamp only adds tie-break ids.
    /// Returns whether the cursor changed.
    pub fn advance<'a, I>(&mut self, records: I) -> bool
    where
        I: IntoIterator<Item = &'a NormalizedRecord>,
    {
        let records: Vec<&NormalizedRecord> = records.into_iter().collect();
        let Some(newest) = records.iter().map(|r| r.timestamp).max() else {
            return false;
        };
        if newest < self.timestamp {
            return false;
        }

        let at_newest = records
            .iter()
            .filter(|r| r.timestamp == newest)
            .map(|r| r.id.clone());

        let moved = newest > self.timestamp;
        if moved {
            self.timestamp = newest;
            self.ids.clear();
        }
        let before = self.ids.len();
        self.ids.extend(at_newest);
        self.ids.sort();
        self.ids.dedup();

        moved || self.ids.len() != before
    }
}
