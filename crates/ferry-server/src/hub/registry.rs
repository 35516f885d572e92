//! Connection registry: per-connection context, user membership and the
//! control-frame dispatch table.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use ferry_shared::constants::{MAX_FRAME_SIZE, MAX_PRESENCE_SUBSCRIPTIONS};
use ferry_shared::{ClientFrame, PresenceInfo, ServerEvent};
use tracing::{debug, info};

use super::delivery::UnackedMessage;
use super::transport::Transport;
use super::Hub;

/// Process-lifetime unique connection id, assigned in increasing order.
pub type ConnId = u64;

/// Everything the hub knows about one push connection. The raw transport is
/// held next to this state, never extended with it.
pub(super) struct Connection {
    pub(super) id: ConnId,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) uid: Option<String>,
    /// Foreground flag reported by the client. Starts out `true`.
    pub(super) foreground: bool,
    pub(super) subscriptions: HashSet<String>,
    /// Keyed by delivery id, so iteration follows send order.
    pub(super) unacked: BTreeMap<u64, UnackedMessage>,
    /// Delivery ids waiting for backpressure to clear, oldest first.
    pub(super) queue: VecDeque<u64>,
    pub(super) backpressured: bool,
    /// Cleared on every liveness probe, set again by any sign of life.
    pub(super) alive: bool,
}

impl Connection {
    fn new(id: ConnId, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            transport,
            uid: None,
            foreground: true,
            subscriptions: HashSet::new(),
            unacked: BTreeMap::new(),
            queue: VecDeque::new(),
            backpressured: false,
            alive: true,
        }
    }

    /// Counts towards its user being active.
    pub(super) fn is_usable(&self) -> bool {
        self.foreground && self.transport.is_open()
    }
}

/// Presence record for one user id. Connections are back-references into
/// the registry, not owned.
#[derive(Debug, Default)]
pub(super) struct UserPresence {
    pub(super) name: Option<String>,
    pub(super) avatar: Option<String>,
    pub(super) connections: BTreeSet<ConnId>,
    pub(super) active: bool,
    /// Epoch millis of the last active/inactive transition.
    pub(super) last_seen: Option<i64>,
    /// When the last connection went away; `None` while any is attached.
    pub(super) empty_since: Option<i64>,
}

impl UserPresence {
    pub(super) fn info(&self, uid: &str) -> PresenceInfo {
        PresenceInfo {
            uid: uid.to_string(),
            active: self.active,
            last_seen: self.last_seen,
            name: self.name.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

impl Hub {
    pub fn register(&mut self, transport: Arc<dyn Transport>) -> ConnId {
        self.next_conn_id += 1;
        let id = self.next_conn_id;
        self.connections.insert(id, Connection::new(id, transport));

        info!(
            conn = id,
            connections = self.connections.len(),
            "Push connection registered"
        );
        id
    }

    /// Drop a connection and everything queued for it, then recompute its
    /// user's presence. Unknown ids are ignored.
    pub fn destroy(&mut self, conn: ConnId, now: i64) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        connection.transport.close();

        info!(
            conn,
            uid = connection.uid.as_deref().unwrap_or("-"),
            dropped_unacked = connection.unacked.len(),
            connections = self.connections.len(),
            "Push connection destroyed"
        );

        if let Some(uid) = connection.uid {
            self.detach_user(conn, &uid, now);
        }
    }

    /// Apply one raw control frame. Malformed or unknown frames are dropped
    /// without a reply and never affect the connection.
    pub fn on_message(&mut self, conn: ConnId, raw: &str, now: i64) {
        if raw.len() > MAX_FRAME_SIZE {
            debug!(conn, size = raw.len(), "Dropping oversized frame");
            return;
        }
        let Some(frame) = ClientFrame::parse(raw) else {
            debug!(conn, "Dropping malformed frame");
            return;
        };
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        connection.alive = true;

        match frame {
            ClientFrame::Identify { uid } => self.attach_user(conn, uid, None, None, now),
            ClientFrame::Join { uid, name, avatar } => {
                self.attach_user(conn, uid, name, avatar, now)
            }
            ClientFrame::Presence { open } => {
                connection.foreground = open;
                if let Some(uid) = connection.uid.clone() {
                    self.recompute(&uid, now);
                }
            }
            ClientFrame::PresenceSubscribe { uids } => {
                for uid in uids {
                    if connection.subscriptions.len() >= MAX_PRESENCE_SUBSCRIPTIONS {
                        debug!(conn, "Presence subscription limit reached");
                        break;
                    }
                    connection.subscriptions.insert(uid);
                }
            }
            ClientFrame::PresenceUnsubscribe => connection.subscriptions.clear(),
            ClientFrame::PresenceQuery { uids } => self.answer_presence_query(conn, &uids, now),
            ClientFrame::TypingStart => self.relay_typing(conn, true, now),
            ClientFrame::TypingStop => self.relay_typing(conn, false, now),
            ClientFrame::Ack { ack_id } => self.ack(conn, ack_id),
            ClientFrame::PendingMessage { temp_id, content } => {
                // Drafts only make sense for an identified author.
                if let Some(uid) = connection.uid.clone() {
                    self.pending.register(uid, temp_id, &content, now);
                }
            }
            ClientFrame::Ping => self.send_to(conn, &ServerEvent::pong(), now),
        }
    }

    /// Transport-level pong.
    pub fn on_pong(&mut self, conn: ConnId) {
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.alive = true;
        }
    }

    /// Probe every connection. One that has shown no sign of life since the
    /// previous probe is destroyed.
    pub fn liveness_tick(&mut self, now: i64) {
        let mut dead = Vec::new();
        for connection in self.connections.values_mut() {
            if !connection.alive || !connection.transport.is_open() {
                dead.push(connection.id);
                continue;
            }
            connection.alive = false;
            connection.transport.ping();
        }

        for conn in dead {
            debug!(conn, "Liveness probe unanswered");
            self.destroy(conn, now);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn attach_user(
        &mut self,
        conn: ConnId,
        uid: String,
        name: Option<String>,
        avatar: Option<String>,
        now: i64,
    ) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        let previous = connection.uid.replace(uid.clone());

        if let Some(old) = previous.filter(|old| *old != uid) {
            self.detach_user(conn, &old, now);
        }

        let user = self.users.entry(uid.clone()).or_default();
        user.connections.insert(conn);
        user.empty_since = None;
        if name.is_some() {
            user.name = name;
        }
        if avatar.is_some() {
            user.avatar = avatar;
        }

        debug!(conn, uid = %uid, "Connection identified");
        self.recompute(&uid, now);
    }

    fn detach_user(&mut self, conn: ConnId, uid: &str, now: i64) {
        if let Some(user) = self.users.get_mut(uid) {
            user.connections.remove(&conn);
            if user.connections.is_empty() {
                user.empty_since = Some(now);
            }
        }
        self.recompute(uid, now);
    }

    /// Typing indicators go to every other connection. Anonymous
    /// connections cannot type.
    fn relay_typing(&mut self, conn: ConnId, start: bool, now: i64) {
        let Some(uid) = self.connections.get(&conn).and_then(|c| c.uid.clone()) else {
            return;
        };
        let event = ServerEvent::typing(start, &uid);
        let targets: Vec<ConnId> = self
            .connections
            .keys()
            .copied()
            .filter(|id| *id != conn)
            .collect();
        for target in targets {
            self.send_to(target, &event, now);
        }
    }
}
