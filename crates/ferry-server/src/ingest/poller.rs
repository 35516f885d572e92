//! The ingestion loop: fetch, normalize, filter, commit, fan out, advance.

use std::collections::HashSet;

use ferry_shared::{ExternalId, NormalizedRecord};
use tracing::{debug, info, warn};

use super::cursor::Cursor;
use super::source::RecordSource;
use super::store::IngestStore;
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::hub::HubHandle;

/// Normal cycles resume from the cursor and only accept records strictly
/// after it. Sweeps re-read a wider window, rely on store dedup alone and
/// never move the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Sweep,
}

/// What one cycle did, for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub accepted: usize,
    pub inserted: usize,
    pub cursor_moved: bool,
}

/// A record that survived normalization. `anomalous` records never advance
/// the cursor; `clamped` ones carry the receive time instead of their own.
struct Candidate {
    record: NormalizedRecord,
    anomalous: bool,
    clamped: bool,
}

pub struct Poller<S, D> {
    source: S,
    store: D,
    hub: HubHandle,
    config: IngestConfig,
    cursor: Cursor,
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl<S: RecordSource, D: IngestStore> Poller<S, D> {
    pub fn new(source: S, store: D, hub: HubHandle, config: IngestConfig, cursor: Cursor) -> Self {
        Self {
            source,
            store,
            hub,
            config,
            cursor,
        }
    }

    /// Resume from the newest stored record, or start one sweep window back
    /// on an empty store.
    pub async fn bootstrap(
        source: S,
        store: D,
        hub: HubHandle,
        config: IngestConfig,
        now: i64,
    ) -> Result<Self, IngestError> {
        let cursor = match store.latest_cursor(now).await? {
            Some((timestamp, ids)) => Cursor::new(timestamp, ids),
            None => Cursor::new(now - config.sweep_window_secs, Vec::new()),
        };
        info!(
            cursor = cursor.timestamp(),
            tie_break_ids = cursor.ids().len(),
            "Ingestion cursor restored"
        );
        Ok(Self::new(source, store, hub, config, cursor))
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Cycle forever. Cycles never overlap: the next one starts a full poll
    /// interval after the previous one finished.
    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            sweep_every = self.config.sweep_every,
            "Ingestion poller started"
        );
        loop {
            self.run_once(now_secs()).await;
            if self.hub.is_closed() {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        info!("Ingestion poller stopped");
    }

    /// One normal cycle, followed by a sweep on every Nth tick.
    pub async fn run_once(&mut self, now: i64) {
        self.log_cycle(Mode::Normal, now).await;

        let tick = self.cursor.tick();
        if self.config.sweep_every > 0 && tick % self.config.sweep_every == 0 {
            self.log_cycle(Mode::Sweep, now).await;
        }
    }

    async fn log_cycle(&mut self, mode: Mode, now: i64) {
        match self.run_cycle(mode, now).await {
            Ok(report) if report.inserted > 0 => info!(
                ?mode,
                fetched = report.fetched,
                inserted = report.inserted,
                cursor = self.cursor.timestamp(),
                "Ingested records"
            ),
            Ok(report) => debug!(
                ?mode,
                fetched = report.fetched,
                tick = self.cursor.ticks(),
                "Nothing new upstream"
            ),
            Err(e) => warn!(?mode, error = %e, "Ingestion cycle abandoned"),
        }
    }

    /// Run a single cycle. Any failure before the commit leaves the store,
    /// the hub and the cursor untouched.
    pub async fn run_cycle(&mut self, mode: Mode, now: i64) -> Result<CycleReport, IngestError> {
        let since = match mode {
            Mode::Normal => self.cursor.timestamp() - self.config.cursor_overlap_secs,
            Mode::Sweep => self.cursor.timestamp() - self.config.sweep_window_secs,
        };

        let raw = self.source.fetch(since).await?;
        let mut report = CycleReport {
            fetched: raw.len(),
            ..Default::default()
        };

        let mut candidates: Vec<Candidate> = Vec::with_capacity(raw.len());
        for value in &raw {
            match NormalizedRecord::from_value(value) {
                Ok(record) => candidates.push(self.screen(record, now)),
                Err(e) => debug!(error = %e, "Skipping unusable upstream record"),
            }
        }

        let authors: HashSet<String> = candidates
            .iter()
            .map(|c| c.record.author_id.clone())
            .collect();
        if !authors.is_empty() {
            let blocked = self.store.blocked_among(authors.into_iter().collect()).await?;
            if !blocked.is_empty() {
                candidates.retain(|c| !blocked.contains(&c.record.author_id));
            }
        }

        candidates.sort_by(|a, b| a.record.order_key().cmp(&b.record.order_key()));
        if mode == Mode::Normal {
            candidates.retain(|c| self.cursor.is_newer(&c.record));
        }
        report.accepted = candidates.len();
        if candidates.is_empty() {
            return Ok(report);
        }

        let records: Vec<NormalizedRecord> = candidates.iter().map(|c| c.record.clone()).collect();
        let clamped: HashSet<ExternalId> = candidates
            .iter()
            .filter(|c| c.clamped)
            .map(|c| c.record.id.clone())
            .collect();
        let batch = self.store.commit(records, clamped).await?;
        report.inserted = batch.inserted.len();

        if !batch.inserted.is_empty() || !batch.notices.is_empty() {
            self.hub.publish_records(batch.inserted, batch.notices).await?;
        }

        if mode == Mode::Normal {
            report.cursor_moved = self
                .cursor
                .advance(candidates.iter().filter(|c| !c.anomalous).map(|c| &c.record));
        }

        Ok(report)
    }

    /// Clamp future timestamps from system authors to the receive time and
    /// flag anything else too far ahead of the local clock.
    fn screen(&self, record: NormalizedRecord, now: i64) -> Candidate {
        if record.timestamp > now && self.config.system_authors.contains(&record.author_id) {
            debug!(
                id = record.id.as_str(),
                author = %record.author_id,
                skew = record.timestamp - now,
                "Clamping future timestamp"
            );
            return Candidate {
                record: record.with_timestamp(now),
                anomalous: true,
                clamped: true,
            };
        }

        let anomalous = record.timestamp > now + self.config.future_tolerance_secs;
        if anomalous {
            warn!(
                id = record.id.as_str(),
                skew = record.timestamp - now,
                "Upstream record dated in the future"
            );
        }
        Candidate {
            record,
            anomalous,
            clamped: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::super::store::testing::MemoryStore;
    use super::*;
    use crate::hub::HubCommand;

    const NOW: i64 = 1_700_000_000;

    /// Replays scripted responses; an `Err` is an HTTP status.
    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Vec<Value>, u16>>>,
        calls: Mutex<Vec<i64>>,
    }

    impl ScriptedSource {
        fn with(responses: Vec<Result<Vec<Value>, u16>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<i64> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RecordSource for &ScriptedSource {
        async fn fetch(&self, since: i64) -> Result<Vec<Value>, IngestError> {
            let next = {
                self.calls.lock().unwrap().push(since);
                self.responses.lock().unwrap().pop_front()
            };
            match next {
                Some(Ok(values)) => Ok(values),
                Some(Err(status)) => Err(IngestError::Status {
                    status,
                    preview: String::new(),
                }),
                None => Ok(Vec::new()),
            }
        }
    }

    impl IngestStore for &MemoryStore {
        async fn blocked_among(
            &self,
            authors: Vec<String>,
        ) -> Result<HashSet<String>, IngestError> {
            (**self).blocked_among(authors).await
        }

        async fn commit(
            &self,
            records: Vec<NormalizedRecord>,
            clamped: HashSet<ExternalId>,
        ) -> Result<ferry_store::CommittedBatch, IngestError> {
            (**self).commit(records, clamped).await
        }

        async fn latest_cursor(
            &self,
            not_after: i64,
        ) -> Result<Option<(i64, Vec<ExternalId>)>, IngestError> {
            (**self).latest_cursor(not_after).await
        }
    }

    fn config() -> IngestConfig {
        IngestConfig {
            cursor_overlap_secs: 2,
            sweep_every: 2,
            sweep_window_secs: 300,
            future_tolerance_secs: 5,
            ..Default::default()
        }
    }

    fn raw(id: u64, author: &str, ts: i64) -> Value {
        json!({ "id": id, "user_id": author, "nickname": author, "timestamp": ts, "message": "hi" })
    }

    fn poller<'a>(
        source: &'a ScriptedSource,
        store: &'a MemoryStore,
        start: i64,
    ) -> (Poller<&'a ScriptedSource, &'a MemoryStore>, mpsc::Receiver<HubCommand>) {
        let (tx, rx) = mpsc::channel(16);
        let poller = Poller::new(
            source,
            store,
            HubHandle::new(tx),
            config(),
            Cursor::new(start, Vec::new()),
        );
        (poller, rx)
    }

    /// `(timestamp, id)` of every record published to the hub.
    fn published(rx: &mut mpsc::Receiver<HubCommand>) -> Vec<(i64, String)> {
        let mut out = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let HubCommand::Records { records, .. } = command {
                out.extend(
                    records
                        .iter()
                        .map(|r| (r.record.timestamp, r.record.id.as_str().to_string())),
                );
            }
        }
        out
    }

    #[tokio::test]
    async fn test_batch_is_published_in_timestamp_then_id_order() {
        let source = ScriptedSource::with(vec![Ok(vec![
            raw(10, "a", 5),
            raw(11, "a", 5),
            raw(9, "b", 7),
            raw(99, "c", 3),
        ])]);
        let store = MemoryStore::default();
        let (mut poller, mut rx) = poller(&source, &store, 0);

        let report = poller.run_cycle(Mode::Normal, NOW).await.unwrap();
        assert_eq!(report.inserted, 4);
        assert!(report.cursor_moved);
        assert_eq!(
            published(&mut rx),
            [
                (3, "99".to_string()),
                (5, "10".to_string()),
                (5, "11".to_string()),
                (7, "9".to_string()),
            ]
        );
        assert_eq!(poller.cursor().timestamp(), 7);
        assert_eq!(source.calls(), [-2]);
    }

    #[tokio::test]
    async fn test_overlapping_fetch_publishes_nothing_twice() {
        let batch = vec![raw(1, "a", 100), raw(2, "a", 101)];
        let source = ScriptedSource::with(vec![Ok(batch.clone()), Ok(batch)]);
        let store = MemoryStore::default();
        let (mut poller, mut rx) = poller(&source, &store, 90);

        poller.run_cycle(Mode::Normal, NOW).await.unwrap();
        assert_eq!(published(&mut rx).len(), 2);

        let report = poller.run_cycle(Mode::Normal, NOW).await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.accepted, 0);
        assert!(published(&mut rx).is_empty());
        assert_eq!(source.calls(), [88, 99]);
    }

    #[tokio::test]
    async fn test_late_arrival_is_recovered_by_sweep_only() {
        let source = ScriptedSource::with(vec![
            Ok(vec![raw(5, "a", 100)]),
            Ok(vec![raw(4, "a", 95)]),
            Ok(vec![raw(4, "a", 95), raw(5, "a", 100)]),
        ]);
        let store = MemoryStore::default();
        let (mut poller, mut rx) = poller(&source, &store, 50);

        poller.run_cycle(Mode::Normal, NOW).await.unwrap();
        published(&mut rx);

        // Behind the cursor, so a normal cycle ignores it.
        let report = poller.run_cycle(Mode::Normal, NOW).await.unwrap();
        assert_eq!(report.accepted, 0);

        let report = poller.run_cycle(Mode::Sweep, NOW).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert!(!report.cursor_moved);
        assert_eq!(published(&mut rx), [(95, "4".to_string())]);
        assert_eq!(poller.cursor().timestamp(), 100);
        assert_eq!(source.calls()[2], 100 - 300);
    }

    #[tokio::test]
    async fn test_system_author_future_timestamp_is_clamped() {
        let source = ScriptedSource::with(vec![Ok(vec![raw(7, "system", NOW + 3_600)])]);
        let store = MemoryStore::default();
        let (mut poller, mut rx) = poller(&source, &store, NOW - 10);

        let report = poller.run_cycle(Mode::Normal, NOW).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert!(!report.cursor_moved);
        assert_eq!(published(&mut rx), [(NOW, "7".to_string())]);
        assert_eq!(store.stored.lock().unwrap()[0].timestamp, NOW);
        assert_eq!(poller.cursor().timestamp(), NOW - 10);
    }

    #[tokio::test]
    async fn test_far_future_record_does_not_advance_cursor() {
        let source = ScriptedSource::with(vec![Ok(vec![
            raw(1, "a", NOW - 1),
            raw(2, "a", NOW + 3_600),
        ])]);
        let store = MemoryStore::default();
        let (mut poller, _rx) = poller(&source, &store, NOW - 10);

        let report = poller.run_cycle(Mode::Normal, NOW).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(poller.cursor().timestamp(), NOW - 1);
    }

    #[tokio::test]
    async fn test_blocked_and_unusable_records_are_skipped() {
        let source = ScriptedSource::with(vec![Ok(vec![
            raw(1, "troll", 10),
            raw(2, "friend", 11),
            json!({ "user_id": "nobody", "timestamp": 12 }),
            json!("not an object"),
        ])]);
        let store = MemoryStore::default();
        store.blocked.lock().unwrap().insert("troll".into());
        let (mut poller, mut rx) = poller(&source, &store, 0);

        let report = poller.run_cycle(Mode::Normal, NOW).await.unwrap();
        assert_eq!(report.fetched, 4);
        assert_eq!(report.accepted, 1);
        assert_eq!(published(&mut rx), [(11, "2".to_string())]);
    }

    #[tokio::test]
    async fn test_failed_fetch_abandons_cycle() {
        let source = ScriptedSource::with(vec![Err(503), Ok(vec![raw(1, "a", 10)])]);
        let store = MemoryStore::default();
        let (mut poller, mut rx) = poller(&source, &store, 0);

        let err = poller.run_cycle(Mode::Normal, NOW).await.unwrap_err();
        assert!(matches!(err, IngestError::Status { status: 503, .. }));
        assert_eq!(source.calls().len(), 1);
        assert!(published(&mut rx).is_empty());
        assert!(store.stored.lock().unwrap().is_empty());
        assert_eq!(poller.cursor().timestamp(), 0);

        // The next cycle starts from the same place.
        let report = poller.run_cycle(Mode::Normal, NOW).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(source.calls(), [-2, -2]);
    }

    #[tokio::test]
    async fn test_commit_failure_leaves_cursor_and_hub_alone() {
        let source = ScriptedSource::with(vec![Ok(vec![raw(1, "a", 10)])]);
        let store = MemoryStore::default();
        *store.fail_commits.lock().unwrap() = true;
        let (mut poller, mut rx) = poller(&source, &store, 0);

        assert!(matches!(
            poller.run_cycle(Mode::Normal, NOW).await,
            Err(IngestError::Store(_))
        ));
        assert!(published(&mut rx).is_empty());
        assert_eq!(poller.cursor().timestamp(), 0);
    }

    #[tokio::test]
    async fn test_every_second_tick_adds_a_sweep() {
        let source = ScriptedSource::default();
        let store = MemoryStore::default();
        let (mut poller, _rx) = poller(&source, &store, 1_000);

        poller.run_once(NOW).await;
        poller.run_once(NOW).await;
        assert_eq!(source.calls(), [998, 998, 700]);
        assert_eq!(poller.cursor().ticks(), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_resumes_from_store() {
        let store = MemoryStore::default();
        store
            .commit(
                vec![
                    NormalizedRecord::from_value(&raw(8, "a", 500)).unwrap(),
                    NormalizedRecord::from_value(&raw(9, "a", 500)).unwrap(),
                ],
                HashSet::new(),
            )
            .await
            .unwrap();
        let source = ScriptedSource::default();
        let (tx, _rx) = mpsc::channel(1);

        let poller = Poller::bootstrap(&source, &store, HubHandle::new(tx), config(), NOW)
            .await
            .unwrap();
        assert_eq!(poller.cursor().timestamp(), 500);
        assert_eq!(poller.cursor().ids().len(), 2);

        let empty = MemoryStore::default();
        let (tx, _rx) = mpsc::channel(1);
        let poller = Poller::bootstrap(&source, &empty, HubHandle::new(tx), config(), NOW)
            .await
            .unwrap();
        assert_eq!(poller.cursor().timestamp(), NOW - 300);
    }

    #[tokio::test]
    async fn test_restart_ignores_clamped_placeholders() {
        let source = ScriptedSource::with(vec![Ok(vec![
            raw(1, "a", NOW - 30),
            raw(2, "system", NOW + 3_600),
        ])]);
        let store = MemoryStore::default();
        let (mut poller, _rx) = poller(&source, &store, NOW - 60);

        poller.run_cycle(Mode::Normal, NOW).await.unwrap();
        assert_eq!(poller.cursor().timestamp(), NOW - 30);

        let (tx, _rx) = mpsc::channel(1);
        let restarted = Poller::bootstrap(&source, &store, HubHandle::new(tx), config(), NOW + 5)
            .await
            .unwrap();
        assert_eq!(restarted.cursor().timestamp(), NOW - 30);
        let ids: Vec<_> = restarted.cursor().ids().iter().map(ExternalId::as_str).collect();
        assert_eq!(ids, ["1"]);
    }
}
