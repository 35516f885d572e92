//! Presence derived from registry membership.
//!
//! A user is active while at least one of its connections has an open
//! transport and reports itself in the foreground. Watchers only hear about
//! transitions, never about unchanged state.

use ferry_shared::constants::MAX_PRESENCE_QUERY;
use ferry_shared::{PresenceInfo, ServerEvent};
use tracing::{debug, info};

use super::registry::{ConnId, Connection};
use super::Hub;

impl Hub {
    /// Re-derive `active` for one user and notify its watchers if it changed.
    pub fn recompute(&mut self, uid: &str, now: i64) {
        let Some(user) = self.users.get(uid) else {
            return;
        };
        let active = user
            .connections
            .iter()
            .filter_map(|id| self.connections.get(id))
            .any(Connection::is_usable);

        let Some(user) = self.users.get_mut(uid) else {
            return;
        };
        if user.active == active {
            return;
        }
        user.active = active;
        user.last_seen = Some(now);
        let event = ServerEvent::presence_update(&user.info(uid));

        debug!(uid = %uid, active, "Presence changed");

        let watchers: Vec<ConnId> = self
            .connections
            .values()
            .filter(|c| c.subscriptions.contains(uid))
            .map(|c| c.id)
            .collect();
        for conn in watchers {
            self.send_to(conn, &event, now);
        }
    }

    /// Distinct identities considered online: registered users that are
    /// active or still inside the offline grace window, plus one per open
    /// anonymous connection.
    pub fn online_count(&self, now: i64) -> usize {
        let grace = self.config.presence_grace_ms;
        let users = self
            .users
            .values()
            .filter(|u| u.active || u.last_seen.is_some_and(|seen| now - seen < grace))
            .count();
        let anonymous = self
            .connections
            .values()
            .filter(|c| c.uid.is_none() && c.transport.is_open())
            .count();
        users + anonymous
    }

    #[cfg(test)]
    pub fn is_active(&self, uid: &str) -> bool {
        self.users.get(uid).is_some_and(|u| u.active)
    }

    /// Periodic presence pass: recompute everyone, broadcast the online
    /// count if it moved, evict users that stayed empty past the grace
    /// period, and expire stale optimistic drafts.
    pub fn presence_sweep(&mut self, now: i64) {
        let uids: Vec<String> = self.users.keys().cloned().collect();
        for uid in &uids {
            self.recompute(uid, now);
        }

        let count = self.online_count(now);
        if self.last_online_count != Some(count) {
            self.last_online_count = Some(count);
            self.broadcast(&ServerEvent::online_count(count), now);
        }

        let grace = self.config.presence_grace_ms;
        let before = self.users.len();
        self.users.retain(|_, user| {
            !(user.connections.is_empty()
                && user.empty_since.is_some_and(|since| now - since >= grace))
        });
        let evicted = before - self.users.len();

        let expired = self.pending.purge_expired(now, self.config.pending_ttl_ms);

        if evicted > 0 || expired > 0 {
            info!(evicted, expired_drafts = expired, online = count, "Presence sweep");
        }
    }

    pub(super) fn answer_presence_query(&mut self, conn: ConnId, uids: &[String], now: i64) {
        let entries: Vec<PresenceInfo> = uids
            .iter()
            .take(MAX_PRESENCE_QUERY)
            .map(|uid| match self.users.get(uid) {
                Some(user) => user.info(uid),
                None => PresenceInfo::unknown(uid),
            })
            .collect();
        self.send_to(conn, &ServerEvent::presence_result(&entries), now);
    }
}
