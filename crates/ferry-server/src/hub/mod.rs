//! The connection hub: registry, presence, reliable delivery and optimistic
//! reconciliation behind one owner.
//!
//! All state lives in a single [`Hub`] value driven by one tokio task. The
//! task reacts to [`HubCommand`]s and to three periodic ticks (retry,
//! liveness, presence sweep); every mutation happens synchronously inside one
//! loop iteration, so nothing needs a lock. The synchronous core takes the
//! current time as epoch milliseconds, which lets tests drive it with a
//! fake clock.

mod delivery;
mod pending;
mod presence;
mod registry;
pub mod transport;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ferry_shared::{content_fingerprint, EnrichedRecord, Notice, ServerEvent};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::HubConfig;

use self::pending::PendingMessages;
use self::registry::{Connection, UserPresence};
pub use self::registry::ConnId;
pub use self::transport::Transport;

/// Capacity of the command channel feeding the hub task.
const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Error)]
#[error("relay hub is not running")]
pub struct HubClosed;

/// Point-in-time counters for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub users: usize,
    pub online: usize,
}

pub struct Hub {
    config: HubConfig,
    next_conn_id: ConnId,
    next_ack_id: u64,
    connections: BTreeMap<ConnId, Connection>,
    users: HashMap<String, UserPresence>,
    pending: PendingMessages,
    last_online_count: Option<usize>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            next_conn_id: 0,
            next_ack_id: 0,
            connections: BTreeMap::new(),
            users: HashMap::new(),
            pending: PendingMessages::default(),
            last_online_count: None,
        }
    }

    /// Forget every connection, user and draft. Transports are closed.
    /// Id counters keep increasing so ids are never reused.
    pub fn reset(&mut self) {
        for connection in self.connections.values() {
            connection.transport.close();
        }
        self.connections.clear();
        self.users.clear();
        self.pending = PendingMessages::default();
        self.last_online_count = None;
    }

    pub fn stats(&self, now: i64) -> HubStats {
        HubStats {
            connections: self.connection_count(),
            users: self.users.len(),
            online: self.online_count(now),
        }
    }

    /// Fan newly ingested records out to every connection as one reliable
    /// `new_messages` event, then push each targeted notice to the live
    /// connections of its user.
    pub fn publish_records(
        &mut self,
        mut records: Vec<EnrichedRecord>,
        notices: Vec<Notice>,
        now: i64,
    ) {
        let ttl = self.config.pending_ttl_ms;
        let mut reconciled = 0;
        for enriched in &mut records {
            if enriched.temp_id.is_some() {
                continue;
            }
            let fingerprint = content_fingerprint(&enriched.record.body);
            if let Some(temp_id) =
                self.pending
                    .take_match(&enriched.record.author_id, fingerprint, now, ttl)
            {
                enriched.temp_id = Some(temp_id);
                reconciled += 1;
            }
        }

        if !records.is_empty() {
            match ServerEvent::new_messages(&records) {
                Ok(event) => self.broadcast(&event, now),
                Err(e) => warn!(error = %e, "Failed to encode new_messages"),
            }
        }

        for notice in &notices {
            let event = ServerEvent::notification(notice);
            let targets: Vec<ConnId> = self
                .users
                .get(&notice.target_uid)
                .map(|u| u.connections.iter().copied().collect())
                .unwrap_or_default();
            for conn in targets {
                self.send_to(conn, &event, now);
            }
        }

        info!(
            records = records.len(),
            notices = notices.len(),
            reconciled,
            connections = self.connections.len(),
            "Fanned out new records"
        );
    }

    fn handle(&mut self, command: HubCommand, now: i64) {
        match command {
            HubCommand::Register { transport, reply } => {
                let conn = self.register(transport);
                if reply.send(conn).is_err() {
                    // The socket task went away before it learned its id.
                    self.destroy(conn, now);
                }
            }
            HubCommand::Frame { conn, text } => self.on_message(conn, &text, now),
            HubCommand::Pong { conn } => self.on_pong(conn),
            HubCommand::Writable { conn } => self.on_writable(conn, now),
            HubCommand::Closed { conn } => self.destroy(conn, now),
            HubCommand::Records { records, notices } => {
                self.publish_records(records, notices, now)
            }
            HubCommand::Publish { event } => self.broadcast(&event, now),
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.stats(now));
            }
        }
    }

    /// Own the hub until every [`HubHandle`] is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>) {
        let mut retry = interval(self.config.retry_tick);
        let mut liveness = interval(self.config.liveness_tick);
        let mut sweep = interval(self.config.presence_tick);
        for ticker in [&mut retry, &mut liveness, &mut sweep] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!("Hub started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command, now_millis()),
                    None => break,
                },
                _ = retry.tick() => self.retry_tick(now_millis()),
                _ = liveness.tick() => self.liveness_tick(now_millis()),
                _ = sweep.tick() => self.presence_sweep(now_millis()),
            }
        }

        self.reset();
        info!("Hub stopped");
    }

    /// Start the hub task and return a handle to it.
    pub fn spawn(config: HubConfig) -> HubHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::spawn(Hub::new(config).run(rx));
        HubHandle { tx }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub enum HubCommand {
    Register {
        transport: Arc<dyn Transport>,
        reply: oneshot::Sender<ConnId>,
    },
    Frame {
        conn: ConnId,
        text: String,
    },
    Pong {
        conn: ConnId,
    },
    Writable {
        conn: ConnId,
    },
    Closed {
        conn: ConnId,
    },
    Records {
        records: Vec<EnrichedRecord>,
        notices: Vec<Notice>,
    },
    Publish {
        event: ServerEvent,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Cloneable sender side of the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub fn new(tx: mpsc::Sender<HubCommand>) -> Self {
        Self { tx }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubClosed> {
        self.tx.send(command).await.map_err(|_| HubClosed)
    }

    pub async fn register(&self, transport: Arc<dyn Transport>) -> Result<ConnId, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Register { transport, reply }).await?;
        rx.await.map_err(|_| HubClosed)
    }

    pub async fn frame(&self, conn: ConnId, text: String) -> Result<(), HubClosed> {
        self.send(HubCommand::Frame { conn, text }).await
    }

    pub async fn pong(&self, conn: ConnId) -> Result<(), HubClosed> {
        self.send(HubCommand::Pong { conn }).await
    }

    pub async fn writable(&self, conn: ConnId) -> Result<(), HubClosed> {
        self.send(HubCommand::Writable { conn }).await
    }

    pub async fn closed(&self, conn: ConnId) -> Result<(), HubClosed> {
        self.send(HubCommand::Closed { conn }).await
    }

    pub async fn publish_records(
        &self,
        records: Vec<EnrichedRecord>,
        notices: Vec<Notice>,
    ) -> Result<(), HubClosed> {
        self.send(HubCommand::Records { records, notices }).await
    }

    pub async fn publish(&self, event: ServerEvent) -> Result<(), HubClosed> {
        self.send(HubCommand::Publish { event }).await
    }

    pub async fn stats(&self) -> Result<HubStats, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply }).await?;
        rx.await.map_err(|_| HubClosed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ferry_shared::{EventKind, ExternalId, NoticeKind, NormalizedRecord};
    use serde_json::json;

    use super::transport::testing::FakeTransport;
    use super::*;

    pub(crate) fn hub() -> Hub {
        Hub::new(HubConfig::default())
    }

    pub(crate) fn identify(hub: &mut Hub, conn: ConnId, uid: &str, now: i64) {
        hub.on_message(conn, &json!({"type": "identify", "uid": uid}).to_string(), now);
    }

    pub(crate) fn reaction() -> ServerEvent {
        let fields = json!({"messageId": "1", "emoji": "+1"});
        ServerEvent::new(EventKind::ReactionAdd, fields.as_object().unwrap().clone())
    }

    fn enriched(id: &str, author: &str, body: &str) -> EnrichedRecord {
        NormalizedRecord {
            id: ExternalId::parse(id).unwrap(),
            author_id: author.into(),
            display_name: author.into(),
            avatar: None,
            color: None,
            timestamp: 1,
            body: body.into(),
            kind: "message".into(),
            reply_to_id: None,
        }
        .into()
    }

    #[test]
    fn test_records_fan_out_reliably_to_everyone() {
        let mut hub = hub();
        let a = FakeTransport::new();
        let b = FakeTransport::new();
        hub.register(a.clone());
        let cb = hub.register(b.clone());
        identify(&mut hub, cb, "u2", 0);
        b.take();

        hub.publish_records(vec![enriched("5", "u9", "hi")], Vec::new(), 10);

        for t in [&a, &b] {
            let sent = t.take();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0]["type"], "new_messages");
            assert!(sent[0]["ackId"].as_u64().is_some());
            assert_eq!(sent[0]["messages"][0]["id"], "5");
            assert_eq!(sent[0]["messages"][0]["authorId"], "u9");
        }
    }

    #[test]
    fn test_optimistic_draft_is_reconciled() {
        let mut hub = hub();
        let t = FakeTransport::new();
        let conn = hub.register(t.clone());
        identify(&mut hub, conn, "u1", 0);
        hub.on_message(
            conn,
            r#"{"type":"pending_message","tempId":"tmp-1","content":"see you "}"#,
            0,
        );
        t.take();

        hub.publish_records(
            vec![enriched("1", "u1", "see you"), enriched("2", "u1", "see you")],
            Vec::new(),
            1_000,
        );

        let sent = t.take();
        let messages = sent[0]["messages"].as_array().unwrap();
        assert_eq!(messages[0]["tempId"], "tmp-1");
        // Consumed by the first match only.
        assert!(messages[1].get("tempId").is_none());
    }

    #[test]
    fn test_anonymous_drafts_are_ignored() {
        let mut hub = hub();
        let conn = hub.register(FakeTransport::new());
        hub.on_message(
            conn,
            r#"{"type":"pending_message","tempId":"t","content":"x"}"#,
            0,
        );
        assert_eq!(hub.pending.len(), 0);
    }

    #[test]
    fn test_notices_reach_only_their_target() {
        let mut hub = hub();
        let target_t = FakeTransport::new();
        let other_t = FakeTransport::new();
        let target = hub.register(target_t.clone());
        let other = hub.register(other_t.clone());
        identify(&mut hub, target, "alice", 0);
        identify(&mut hub, other, "bob", 0);
        target_t.take();
        other_t.take();

        let notice = Notice {
            target_uid: "alice".into(),
            kind: NoticeKind::Mention,
            record_id: ExternalId::parse("77").unwrap(),
            from_uid: "bob".into(),
            from_name: "Bob".into(),
        };
        hub.publish_records(Vec::new(), vec![notice], 5);

        let sent = target_t.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "notification");
        assert_eq!(sent[0]["kind"], "mention");
        assert_eq!(sent[0]["recordId"], "77");
        assert!(sent[0].get("ackId").is_none());
        assert!(other_t.take().is_empty());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut hub = hub();
        let t = FakeTransport::new();
        let conn = hub.register(t.clone());
        identify(&mut hub, conn, "u1", 0);
        hub.send_to(conn, &reaction(), 0);

        hub.reset();
        assert_eq!(hub.stats(0), HubStats { connections: 0, users: 0, online: 0 });
        assert!(!t.is_open());

        let next = hub.register(FakeTransport::new());
        assert!(next > conn);
    }

    #[tokio::test]
    async fn test_actor_round_trip() {
        let handle = Hub::spawn(HubConfig::default());
        let t = FakeTransport::new();

        let conn = handle.register(t.clone()).await.unwrap();
        handle
            .frame(conn, r#"{"type":"identify","uid":"u1"}"#.into())
            .await
            .unwrap();
        handle.frame(conn, r#"{"type":"ping"}"#.into()).await.unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.users, 1);
        assert!(t.take_types().contains(&"pong".to_string()));

        handle.closed(conn).await.unwrap();
        assert_eq!(handle.stats().await.unwrap().connections, 0);
    }
}
