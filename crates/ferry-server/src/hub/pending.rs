//! Optimistic drafts waiting for their authoritative upstream copy.

use ferry_shared::constants::MAX_PENDING_PER_USER;
use ferry_shared::content_fingerprint;

#[derive(Debug, Clone)]
struct PendingMessage {
    temp_id: String,
    uid: String,
    fingerprint: u32,
    created_at: i64,
}

/// Drafts in registration order. Lookups are linear; the set is bounded per
/// user and purged on every presence sweep.
#[derive(Debug, Default)]
pub(super) struct PendingMessages {
    entries: Vec<PendingMessage>,
}

impl PendingMessages {
    pub(super) fn register(&mut self, uid: String, temp_id: String, content: &str, now: i64) {
        self.entries
            .retain(|e| !(e.uid == uid && e.temp_id == temp_id));

        let owned = self.entries.iter().filter(|e| e.uid == uid).count();
        if owned >= MAX_PENDING_PER_USER {
            if let Some(oldest) = self.entries.iter().position(|e| e.uid == uid) {
                self.entries.remove(oldest);
            }
        }

        self.entries.push(PendingMessage {
            fingerprint: content_fingerprint(content),
            temp_id,
            uid,
            created_at: now,
        });
    }

    /// Consume the oldest live draft by `uid` with this fingerprint.
    pub(super) fn take_match(
        &mut self,
        uid: &str,
        fingerprint: u32,
        now: i64,
        ttl_ms: i64,
    ) -> Option<String> {
        let index = self.entries.iter().position(|e| {
            e.uid == uid && e.fingerprint == fingerprint && now - e.created_at < ttl_ms
        })?;
        Some(self.entries.remove(index).temp_id)
    }

    pub(super) fn purge_expired(&mut self, now: i64, ttl_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| now - e.created_at < ttl_ms);
        before - self.entries.len()
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }
}
