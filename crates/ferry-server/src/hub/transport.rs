//! The narrow view the hub has of a live push socket.
//!
//! The hub never touches a socket directly. It keeps its own per-connection
//! context and holds the transport handle alongside it.

/// A push transport as seen by the hub. Every method must be cheap and
/// non-blocking: they are called from inside the hub's event loop.
pub trait Transport: Send + Sync {
    /// Whether the transport is still usable for sending.
    fn is_open(&self) -> bool;

    /// Bytes accepted by `send` but not yet written to the peer.
    fn buffered_amount(&self) -> usize;

    /// Queue a text frame. Returns `false` if the transport is already closed.
    fn send(&self, text: String) -> bool;

    /// Send a liveness probe.
    fn ping(&self);

    /// Close the transport. Idempotent.
    fn close(&self);

    /// Ask for a `Writable` notification once buffered bytes reach zero.
    fn request_drain_notice(&self);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::Value;

    use super::Transport;

    /// Records everything the hub sends. Buffered bytes are driven by the test.
    #[derive(Default)]
    pub struct FakeTransport {
        open: AtomicBool,
        buffered: AtomicUsize,
        grow_on_send: AtomicUsize,
        sent: Mutex<Vec<String>>,
        pub pings: AtomicUsize,
        pub drain_requests: AtomicUsize,
    }

    impl FakeTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(true),
                ..Default::default()
            })
        }

        pub fn set_buffered(&self, bytes: usize) {
            self.buffered.store(bytes, Ordering::SeqCst);
        }

        /// Bytes added to the buffered amount by every accepted send.
        pub fn grow_on_send(&self, bytes: usize) {
            self.grow_on_send.store(bytes, Ordering::SeqCst);
        }

        pub fn set_open(&self, open: bool) {
            self.open.store(open, Ordering::SeqCst);
        }

        /// Drain and decode everything sent so far.
        pub fn take(&self) -> Vec<Value> {
            let mut sent = self.sent.lock().unwrap();
            sent.drain(..)
                .map(|raw| serde_json::from_str(&raw).unwrap())
                .collect()
        }

        /// `type` tags of everything sent so far, draining.
        pub fn take_types(&self) -> Vec<String> {
            self.take()
                .into_iter()
                .map(|v| v["type"].as_str().unwrap().to_string())
                .collect()
        }
    }

    impl Transport for FakeTransport {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        fn send(&self, text: String) -> bool {
            if !self.is_open() {
                return false;
            }
            self.sent.lock().unwrap().push(text);
            self.buffered
                .fetch_add(self.grow_on_send.load(Ordering::SeqCst), Ordering::SeqCst);
            true
        }

        fn ping(&self) {
            self.pings.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn request_drain_notice(&self) {
            self.drain_requests.fetch_add(1, Ordering::SeqCst);
        }
    }
}
