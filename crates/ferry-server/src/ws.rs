//! WebSocket bridge between axum sockets and the hub.
//!
//! Each socket gets a reader loop that forwards frames to the hub and a
//! writer task fed by an unbounded channel. The transport handed to the hub
//! counts bytes queued for the writer, which is what the backpressure
//! watermarks read.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use ferry_shared::constants::MAX_FRAME_SIZE;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::api::AppState;
use crate::error::ServerError;
use crate::hub::{ConnId, HubHandle, Transport};

enum Outbound {
    Text(String),
    Ping,
    Close,
}

#[derive(Default)]
struct SocketState {
    open: AtomicBool,
    buffered: AtomicUsize,
    drain_requested: AtomicBool,
}

struct WsTransport {
    tx: mpsc::UnboundedSender<Outbound>,
    state: Arc<SocketState>,
}

impl Transport for WsTransport {
    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    fn buffered_amount(&self) -> usize {
        self.state.buffered.load(Ordering::Acquire)
    }

    fn send(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        let len = text.len();
        self.state.buffered.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(Outbound::Text(text)).is_err() {
            self.state.buffered.fetch_sub(len, Ordering::AcqRel);
            self.state.open.store(false, Ordering::Release);
            return false;
        }
        true
    }

    fn ping(&self) {
        let _ = self.tx.send(Outbound::Ping);
    }

    fn close(&self) {
        if self.state.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    fn request_drain_notice(&self) {
        self.state.drain_requested.store(true, Ordering::Release);
    }
}

/// `GET /ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    check_capacity(&state).await?;

    let hub = state.hub.clone();
    Ok(ws
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, hub)))
}

/// Refuse new sockets once `max_connections` are open. Zero means no limit.
async fn check_capacity(state: &AppState) -> Result<(), ServerError> {
    let max = state.config.max_connections;
    if max > 0 && state.hub.stats().await?.connections >= max {
        return Err(ServerError::AtCapacity);
    }
    Ok(())
}

async fn handle_socket(socket: WebSocket, hub: HubHandle) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(SocketState {
        open: AtomicBool::new(true),
        ..Default::default()
    });
    let transport = Arc::new(WsTransport {
        tx,
        state: state.clone(),
    });

    let Ok(conn) = hub.register(transport.clone()).await else {
        return;
    };
    tokio::spawn(write_loop(sink, rx, state, hub.clone(), conn));

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(conn, error = %e, "WebSocket read failed");
                break;
            }
        };
        let forwarded = match message {
            Message::Text(text) => hub.frame(conn, text).await,
            Message::Pong(_) => hub.pong(conn).await,
            Message::Close(_) => break,
            // axum answers pings itself; binary frames are not part of the protocol.
            Message::Ping(_) | Message::Binary(_) => Ok(()),
        };
        if forwarded.is_err() {
            break;
        }
    }

    transport.close();
    let _ = hub.closed(conn).await;
}

/// Drain the outbound queue into the socket. Once the queue is empty and
/// the hub asked for it, report the connection writable again.
async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    state: Arc<SocketState>,
    hub: HubHandle,
    conn: ConnId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(outbound) = rx.recv().await {
        let result = match outbound {
            Outbound::Text(text) => {
                let len = text.len();
                let result = sink.send(Message::Text(text)).await;
                state.buffered.fetch_sub(len, Ordering::AcqRel);
                result
            }
            Outbound::Ping => sink.send(Message::Ping(Vec::new())).await,
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };

        if let Err(e) = result {
            debug!(conn, error = %e, "WebSocket write failed");
            break;
        }

        if state.buffered.load(Ordering::Acquire) == 0
            && state.drain_requested.swap(false, Ordering::AcqRel)
            && hub.writable(conn).await.is_err()
        {
            break;
        }
    }

    state.open.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use ferry_store::Database;

    use super::*;
    use crate::config::{HubConfig, ServerConfig};
    use crate::db::SharedDatabase;
    use crate::hub::transport::testing::FakeTransport;
    use crate::hub::{Hub, HubCommand};
    use crate::rate_limit::RateLimiter;

    fn transport() -> (WsTransport, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(SocketState {
            open: AtomicBool::new(true),
            ..Default::default()
        });
        (WsTransport { tx, state }, rx)
    }

    #[test]
    fn test_send_counts_buffered_bytes() {
        let (t, mut rx) = transport();
        assert!(t.send("hello".into()));
        assert!(t.send("abc".into()));
        assert_eq!(t.buffered_amount(), 8);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Text(s)) if s == "hello"));
    }

    #[test]
    fn test_close_is_idempotent_and_stops_sends() {
        let (t, mut rx) = transport();
        t.close();
        t.close();
        assert!(!t.is_open());
        assert!(!t.send("late".into()));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_after_writer_gone_marks_closed() {
        let (t, rx) = transport();
        drop(rx);
        assert!(!t.send("x".into()));
        assert!(!t.is_open());
        assert_eq!(t.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_writer_drains_buffer_then_reports_writable() {
        let (t, rx) = transport();
        let (sink, mut written) = futures::channel::mpsc::unbounded::<Message>();
        let (hub_tx, mut hub_rx) = mpsc::channel(4);

        assert!(t.send("hello".into()));
        assert!(t.send("abc".into()));
        t.request_drain_notice();
        let writer = tokio::spawn(write_loop(sink, rx, t.state.clone(), HubHandle::new(hub_tx), 7));

        assert!(matches!(hub_rx.recv().await, Some(HubCommand::Writable { conn: 7 })));
        assert_eq!(t.buffered_amount(), 0);
        assert!(matches!(written.next().await, Some(Message::Text(s)) if s == "hello"));
        assert!(matches!(written.next().await, Some(Message::Text(s)) if s == "abc"));

        t.close();
        writer.await.unwrap();
        assert!(matches!(written.next().await, Some(Message::Close(None))));
        // One notice per request.
        assert!(hub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_writer_stays_quiet_without_drain_request() {
        let (t, rx) = transport();
        let (sink, mut written) = futures::channel::mpsc::unbounded::<Message>();
        let (hub_tx, mut hub_rx) = mpsc::channel(4);

        assert!(t.send("x".into()));
        t.close();
        write_loop(sink, rx, t.state.clone(), HubHandle::new(hub_tx), 1).await;

        assert!(matches!(written.next().await, Some(Message::Text(s)) if s == "x"));
        assert_eq!(t.buffered_amount(), 0);
        assert!(hub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_failure_closes_transport() {
        let (t, rx) = transport();
        let (sink, written) = futures::channel::mpsc::unbounded::<Message>();
        let (hub_tx, _hub_rx) = mpsc::channel(4);
        drop(written);

        assert!(t.send("lost".into()));
        write_loop(sink, rx, t.state.clone(), HubHandle::new(hub_tx), 1).await;

        assert!(!t.is_open());
        assert_eq!(t.buffered_amount(), 0);
        assert!(!t.send("later".into()));
    }

    fn app_state(hub: HubHandle, max_connections: usize, dir: &tempfile::TempDir) -> AppState {
        let db = Database::open_at(&dir.path().join("ws.db")).unwrap();
        AppState {
            hub,
            db: SharedDatabase::new(db),
            rate_limiter: RateLimiter::new(10.0, 30.0),
            config: Arc::new(ServerConfig {
                max_connections,
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_upgrades_refused_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::spawn(HubConfig::default());
        hub.register(FakeTransport::new()).await.unwrap();

        let full = app_state(hub.clone(), 1, &dir);
        let err = check_capacity(&full).await.unwrap_err();
        assert!(matches!(err, ServerError::AtCapacity));
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        assert!(check_capacity(&app_state(hub.clone(), 2, &dir)).await.is_ok());
        assert!(check_capacity(&app_state(hub, 0, &dir)).await.is_ok());
    }
}
