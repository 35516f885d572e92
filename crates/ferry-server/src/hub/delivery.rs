//! Reliable delivery: delivery ids, acknowledgment, bounded retry and
//! backpressure hysteresis.
//!
//! Reliable events are stamped with a process-wide increasing `ackId` and
//! kept until the client echoes it back. Best-effort events are sent once if
//! the connection can take them and are otherwise dropped.
//!
//! Backpressure is a hysteresis band on the transport's buffered bytes:
//! going above `high_watermark` sets the flag, and only going below
//! `low_watermark` clears it. While set, reliable sends and due retries are
//! parked in a FIFO queue, which is drained as soon as the flag clears,
//! re-checking the high watermark after every item.

use ferry_shared::ServerEvent;
use tracing::{debug, warn};

use crate::config::HubConfig;

use super::registry::{ConnId, Connection};
use super::Hub;

/// One reliable payload waiting for its acknowledgment.
#[derive(Debug, Clone)]
pub(super) struct UnackedMessage {
    /// Encoded frame, `ackId` included.
    pub(super) payload: String,
    pub(super) next_retry: i64,
    /// Retransmissions so far, not counting the first transmission.
    pub(super) retries: u32,
    pub(super) first_sent: i64,
    pub(super) last_sent: i64,
    /// Whether the payload ever actually reached the transport.
    pub(super) transmitted: bool,
}

impl UnackedMessage {
    fn new(payload: String, now: i64, config: &HubConfig) -> Self {
        Self {
            payload,
            next_retry: now + backoff_ms(config, 0),
            retries: 0,
            first_sent: now,
            last_sent: now,
            transmitted: false,
        }
    }

    fn record_transmission(&mut self, config: &HubConfig, now: i64) {
        if self.transmitted {
            self.retries += 1;
        }
        self.transmitted = true;
        self.last_sent = now;
        self.next_retry = now + backoff_ms(config, self.retries);
    }
}

/// `base * 1.5^retries`, capped.
pub(super) fn backoff_ms(config: &HubConfig, retries: u32) -> i64 {
    let exponent = retries.min(64) as i32;
    let delay = config.retry_base_ms as f64 * 1.5f64.powi(exponent);
    delay.min(config.retry_max_backoff_ms as f64) as i64
}

// ---------------------------------------------------------------------------
// Per-connection delivery state
// ---------------------------------------------------------------------------

impl Connection {
    fn push_reliable(&mut self, ack_id: u64, event: &ServerEvent, config: &HubConfig, now: i64) {
        let payload = event.encode(Some(ack_id));
        self.unacked
            .insert(ack_id, UnackedMessage::new(payload, now, config));

        // May drain older parked items first, which keeps FIFO order.
        self.refresh_backpressure(config, now);
        if self.backpressured {
            self.queue.push_back(ack_id);
            return;
        }
        self.transmit(ack_id, config, now);
    }

    fn push_best_effort(&mut self, event: &ServerEvent, config: &HubConfig, now: i64) -> bool {
        self.refresh_backpressure(config, now);
        if self.backpressured || !self.transport.is_open() {
            return false;
        }
        let sent = self.transport.send(event.encode(None));
        self.check_high_watermark(config);
        sent
    }

    /// Send one unacked payload. Returns `false` if the transport refused it.
    fn transmit(&mut self, ack_id: u64, config: &HubConfig, now: i64) -> bool {
        let Some(message) = self.unacked.get_mut(&ack_id) else {
            return true;
        };
        if !self.transport.send(message.payload.clone()) {
            return false;
        }
        message.record_transmission(config, now);
        self.check_high_watermark(config);
        true
    }

    fn check_high_watermark(&mut self, config: &HubConfig) {
        let buffered = self.transport.buffered_amount();
        if !self.backpressured && buffered > config.high_watermark {
            self.backpressured = true;
            self.transport.request_drain_notice();
            debug!(conn = self.id, buffered, "Backpressure engaged");
        }
    }

    /// Apply the hysteresis band to the current buffered amount, draining
    /// the parked queue when the flag clears.
    pub(super) fn refresh_backpressure(&mut self, config: &HubConfig, now: i64) {
        if !self.backpressured {
            self.check_high_watermark(config);
            return;
        }
        let buffered = self.transport.buffered_amount();
        if buffered >= config.low_watermark {
            return;
        }
        self.backpressured = false;
        debug!(conn = self.id, buffered, queued = self.queue.len(), "Backpressure released");

        while let Some(ack_id) = self.queue.pop_front() {
            if !self.transmit(ack_id, config, now) {
                self.queue.push_front(ack_id);
                break;
            }
            if self.backpressured {
                break;
            }
        }
    }

    fn acknowledge(&mut self, ack_id: u64) -> bool {
        let removed = self.unacked.remove(&ack_id).is_some();
        if removed {
            self.queue.retain(|queued| *queued != ack_id);
        }
        removed
    }

    /// Resend due entries and drop exhausted ones.
    fn retry_due(&mut self, config: &HubConfig, now: i64) {
        self.refresh_backpressure(config, now);

        let mut expired = Vec::new();
        let mut due = Vec::new();
        for (ack_id, message) in &self.unacked {
            if now - message.first_sent >= config.retry_window_ms {
                expired.push(*ack_id);
            } else if now >= message.next_retry {
                if message.retries >= config.retry_max_attempts {
                    expired.push(*ack_id);
                } else {
                    due.push(*ack_id);
                }
            }
        }

        for ack_id in expired {
            if let Some(message) = self.unacked.remove(&ack_id) {
                self.queue.retain(|queued| *queued != ack_id);
                warn!(
                    conn = self.id,
                    ack_id,
                    retries = message.retries,
                    transmitted = message.transmitted,
                    age_ms = now - message.first_sent,
                    "Dropping unacknowledged message"
                );
            }
        }

        for ack_id in due {
            if self.backpressured {
                // Parked without counting as a retry.
                if !self.queue.contains(&ack_id) {
                    self.queue.push_back(ack_id);
                }
                continue;
            }
            if !self.transmit(ack_id, config, now) {
                break;
            }
            debug!(conn = self.id, ack_id, "Retransmitted reliable message");
        }
    }
}

// ---------------------------------------------------------------------------
// Hub entry points
// ---------------------------------------------------------------------------

impl Hub {
    /// Deliver one event to one connection, reliably or best-effort
    /// according to its kind.
    pub fn send_to(&mut self, conn: ConnId, event: &ServerEvent, now: i64) {
        if !self.connections.contains_key(&conn) {
            return;
        }

        if event.is_reliable() {
            self.next_ack_id += 1;
            let ack_id = self.next_ack_id;
            if let Some(connection) = self.connections.get_mut(&conn) {
                connection.push_reliable(ack_id, event, &self.config, now);
            }
        } else if let Some(connection) = self.connections.get_mut(&conn) {
            if !connection.push_best_effort(event, &self.config, now) {
                debug!(conn, kind = event.kind().tag(), "Dropped best-effort event");
            }
        }
    }

    /// Deliver one event to every live connection.
    pub fn broadcast(&mut self, event: &ServerEvent, now: i64) {
        let targets: Vec<ConnId> = self.connections.keys().copied().collect();
        for conn in targets {
            self.send_to(conn, event, now);
        }
    }

    pub fn ack(&mut self, conn: ConnId, ack_id: u64) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        if connection.acknowledge(ack_id) {
            debug!(conn, ack_id, "Delivery acknowledged");
        } else {
            debug!(conn, ack_id, "Ack for unknown delivery id");
        }
    }

    /// The transport reports an empty send buffer.
    pub fn on_writable(&mut self, conn: ConnId, now: i64) {
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.refresh_backpressure(&self.config, now);
        }
    }

    /// Periodic retry pass. Connections whose transport has closed are
    /// discovered here and destroyed.
    pub fn retry_tick(&mut self, now: i64) {
        let closed: Vec<ConnId> = self
            .connections
            .values()
            .filter(|c| !c.transport.is_open())
            .map(|c| c.id)
            .collect();
        for conn in closed {
            debug!(conn, "Transport closed, reaping connection");
            self.destroy(conn, now);
        }

        for connection in self.connections.values_mut() {
            connection.retry_due(&self.config, now);
        }
    }
}
