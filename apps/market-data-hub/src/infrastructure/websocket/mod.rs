//! WebSocket Transport Adapter
//!
//! Serves `GET /socket`. Each upgraded connection gets:
//!
//! - a bounded outbound queue (`ConnectionHandle`) that the subscription
//!   core delivers into with `try_deliver`,
//! - a writer task draining that queue into the socket, each write bounded
//!   by the configured send timeout,
//! - a reader loop decoding `{"channel": <name>, "payload": <envelope>}`
//!   frames and handing the payload to the `SubscriptionService`.
//!
//! Whichever side fails first cancels the connection token. Teardown then
//! removes the connection from every channel before the connection is
//! released.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::value::RawValue;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{OutboundFrame, SharedConnection};
use crate::application::services::{ERROR_CHANNEL, SubscriptionService, send_error};
use crate::domain::subscription::{ChannelKind, ConnectionId};
use crate::infrastructure::config::ConnectionSettings;
use crate::infrastructure::connection::{ConnectionHandle, ConnectionIds, ConnectionTracker};

/// Path of the WebSocket endpoint.
pub const SOCKET_PATH: &str = "/socket";

/// Error code for frames that are not `{channel, payload}` objects.
pub const MALFORMED_FRAME: &str = "MALFORMED_FRAME";

/// Error code for frames naming a channel that does not exist.
pub const UNKNOWN_CHANNEL: &str = "UNKNOWN_CHANNEL";

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the socket server.
#[derive(Debug)]
pub struct SocketServerState {
    service: Arc<SubscriptionService>,
    settings: ConnectionSettings,
    ids: ConnectionIds,
    connections: Arc<ConnectionTracker>,
    shutdown: CancellationToken,
}

impl SocketServerState {
    /// Create socket server state.
    ///
    /// Every connection's token is a child of `shutdown`.
    #[must_use]
    pub fn new(
        service: Arc<SubscriptionService>,
        settings: ConnectionSettings,
        connections: Arc<ConnectionTracker>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service,
            settings,
            ids: ConnectionIds::default(),
            connections,
            shutdown,
        }
    }
}

// =============================================================================
// Socket Server
// =============================================================================

/// WebSocket server for client subscriptions.
pub struct SocketServer {
    port: u16,
    state: Arc<SocketServerState>,
}

impl SocketServer {
    /// Create a new socket server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<SocketServerState>) -> Self {
        Self { port, state }
    }

    /// Routes served by the socket server.
    pub fn router(state: Arc<SocketServerState>) -> Router {
        Router::new()
            .route(SOCKET_PATH, get(upgrade_handler))
            .with_state(state)
    }

    /// Bind the configured port and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns `HubServerError` if binding fails or the server stops with an
    /// error.
    pub async fn run(self) -> Result<(), HubServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HubServerError::BindFailed(self.port, e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    ///
    /// # Errors
    ///
    /// Returns `HubServerError::ServerFailed` if the server stops with an
    /// error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HubServerError> {
        let shutdown = self.state.shutdown.clone();
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, path = SOCKET_PATH, "Socket server listening");

        axum::serve(listener, Self::router(self.state))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| HubServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Socket server stopped");
        Ok(())
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SocketServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// =============================================================================
// Connection Lifecycle
// =============================================================================

#[derive(Deserialize)]
struct InboundFrame<'a> {
    channel: String,
    #[serde(borrow)]
    payload: &'a RawValue,
}

async fn handle_socket(socket: WebSocket, state: Arc<SocketServerState>) {
    let id = state.ids.next_id();
    let _live = state.connections.open();
    let cancel = state.shutdown.child_token();

    let capacity = state.settings.outbound_queue_capacity;
    let (handle, outbound) = ConnectionHandle::new(id, capacity, cancel.clone());
    let conn: SharedConnection = Arc::new(handle);

    tracing::info!(connection_id = id, "Client connected");

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_frames(
        id,
        sink,
        outbound,
        state.settings.send_timeout,
        cancel.clone(),
    ));

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => handle_frame(&state, &conn, text.as_str()).await,
                Some(Ok(Message::Binary(_))) => {
                    let reason = "binary frames are not supported";
                    send_error(&conn, ERROR_CHANNEL, MALFORMED_FRAME, reason);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = id, error = %e, "Socket read failed");
                    break;
                }
            },
        }
    }

    let removed = state.service.hub().unsubscribe_all(id);
    cancel.cancel();
    if let Err(e) = writer.await {
        tracing::warn!(connection_id = id, error = %e, "Writer task panicked");
    }

    tracing::info!(connection_id = id, removed, "Client disconnected");
}

/// Decode one text frame and dispatch its payload.
async fn handle_frame(state: &SocketServerState, conn: &SharedConnection, text: &str) {
    let frame: InboundFrame<'_> = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            send_error(conn, ERROR_CHANNEL, MALFORMED_FRAME, &e.to_string());
            return;
        }
    };

    let Some(channel) = ChannelKind::parse(&frame.channel) else {
        send_error(
            conn,
            ERROR_CHANNEL,
            UNKNOWN_CHANNEL,
            &format!("unknown channel: {}", frame.channel),
        );
        return;
    };

    if let Ok(intent) = state.service.handle_payload(conn, channel, frame.payload.get()).await {
        tracing::debug!(
            connection_id = conn.id(),
            channel = channel.as_str(),
            event = ?intent.event,
            pair = %intent.pair,
            "Subscription applied"
        );
    }
}

/// Drain `outbound` into `sink` until either side closes.
///
/// A write that does not finish within `send_timeout` drops the connection.
async fn write_frames<S>(
    id: ConnectionId,
    mut sink: S,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    send_timeout: Duration,
    cancel: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let message = Message::Text(frame.as_str().into());
        match tokio::time::timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(connection_id = id, error = %e, "Socket write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = id,
                    timeout_ms = send_timeout.as_millis(),
                    "Socket write timed out, dropping connection"
                );
                break;
            }
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(send_timeout, sink.close()).await;
}

// =============================================================================
// Errors
// =============================================================================

/// Socket server errors.
#[derive(Debug, thiserror::Error)]
pub enum HubServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use serde_json::{Value, json};

    use super::*;
    use crate::application::services::SocketHub;
    use crate::infrastructure::store::InMemoryMarketStore;

    fn state() -> SocketServerState {
        let hub = Arc::new(SocketHub::new());
        let service = SubscriptionService::new(hub, Arc::new(InMemoryMarketStore::default()), 20);
        SocketServerState::new(
            Arc::new(service),
            ConnectionSettings::default(),
            Arc::new(ConnectionTracker::new()),
            CancellationToken::new(),
        )
    }

    fn connection(id: ConnectionId) -> (SharedConnection, mpsc::Receiver<OutboundFrame>) {
        let (handle, rx) = ConnectionHandle::new(id, 8, CancellationToken::new());
        (Arc::new(handle), rx)
    }

    fn error_code(rx: &mut mpsc::Receiver<OutboundFrame>) -> (String, String) {
        let frame = rx.try_recv().unwrap();
        let value: Value = serde_json::from_str(frame.as_str()).unwrap();
        (
            value["channel"].as_str().unwrap().to_string(),
            value["payload"]["data"]["code"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn non_object_frame_is_malformed() {
        let state = state();
        let (conn, mut rx) = connection(1);

        handle_frame(&state, &conn, "not json").await;

        let expected = (ERROR_CHANNEL.to_string(), MALFORMED_FRAME.to_string());
        assert_eq!(error_code(&mut rx), expected);
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let state = state();
        let (conn, mut rx) = connection(1);

        handle_frame(&state, &conn, r#"{"channel":"quotes","payload":{"type":"ping"}}"#).await;

        let expected = (ERROR_CHANNEL.to_string(), UNKNOWN_CHANNEL.to_string());
        assert_eq!(error_code(&mut rx), expected);
        assert_eq!(state.service.hub().stats().trades.subscription_count, 0);
    }

    #[tokio::test]
    async fn payload_errors_reply_on_the_data_channel() {
        let state = state();
        let (conn, mut rx) = connection(1);

        handle_frame(&state, &conn, r#"{"channel":"trades","payload":{"type":"ping"}}"#).await;

        let expected = ("trades".to_string(), "UNKNOWN_PAYLOAD_TYPE".to_string());
        assert_eq!(error_code(&mut rx), expected);
    }

    #[tokio::test]
    async fn valid_subscribe_registers_connection() {
        let state = state();
        let (conn, _rx) = connection(3);
        let frame = json!({
            "channel": "trades",
            "payload": {
                "type": "subscription",
                "data": {
                    "event": "subscribe",
                    "pair": {
                        "baseToken": format!("0x{}", "11".repeat(20)),
                        "quoteToken": format!("0x{}", "22".repeat(20)),
                    }
                }
            }
        })
        .to_string();

        handle_frame(&state, &conn, &frame).await;

        assert_eq!(state.service.hub().stats().trades.connection_count, 1);
    }

    /// Socket whose writes never complete.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = Infallible;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Infallible> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn frames_are_written_in_order() {
        let (sink, mut written) = futures::channel::mpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let timeout = Duration::from_secs(1);
        let writer = tokio::spawn(write_frames(1, sink, rx, timeout, cancel.clone()));

        tx.send(OutboundFrame::new("first")).await.unwrap();
        tx.send(OutboundFrame::new("second")).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        let mut texts = Vec::new();
        while let Some(message) = written.next().await {
            if let Message::Text(text) = message {
                texts.push(text.as_str().to_string());
            }
        }
        assert_eq!(texts, vec!["first", "second"]);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out_and_cancels_connection() {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(write_frames(
            2,
            StalledSink,
            rx,
            Duration::from_millis(50),
            cancel.clone(),
        ));

        tx.send(OutboundFrame::new("stuck")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
        assert!(tx.is_closed());
    }
}
