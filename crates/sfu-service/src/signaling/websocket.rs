//! WebSocket transport for the signaling protocol.
//!
//! Connection lifecycle:
//! 1. Upgrade `GET /ws` and assign a connection id (also the peer id)
//! 2. Spawn a writer task draining the connection's outbound queue
//! 3. Feed every text frame to the connection's `SignalingGateway`
//! 4. On close, error or server shutdown, run gateway cleanup once

use super::gateway::SignalingGateway;
use super::notifier::ChannelNotifier;
use super::protocol::ServerMessage;
use crate::actors::RoomRegistryActorHandle;
use crate::engine::RoutingContext;
use crate::errors::SfuError;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// How long a closing connection may spend flushing queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for WebSocket connections.
#[derive(Clone)]
pub struct SignalingState {
    pub registry: RoomRegistryActorHandle,
    pub routing: Arc<dyn RoutingContext>,
    /// Cancelled on server shutdown; open connections close and clean up.
    pub shutdown: CancellationToken,
}

/// Create the signaling router.
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();

    // Responses and notifications share one queue, so the writer preserves
    // the order in which they were produced
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let notifier = Arc::new(ChannelNotifier::new(outbound.clone()));
    let mut gateway = SignalingGateway::new(
        connection_id.clone(),
        state.registry,
        state.routing,
        notifier,
    );

    info!(
        target: "sfu.signaling",
        connection_id = %connection_id,
        "Connection opened"
    );

    let writer_id = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        target: "sfu.signaling",
                        connection_id = %writer_id,
                        error = %e,
                        "Dropping unencodable frame"
                    );
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!(
                    target: "sfu.signaling",
                    connection_id = %writer_id,
                    error = %e,
                    "Send failed, closing writer"
                );
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let next = tokio::select! {
            () = state.shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if gateway.respond(&text).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                let error = SfuError::InvalidRequest("binary frames are not supported".to_string());
                if outbound.send(ServerMessage::failure(0, &error)).is_err() {
                    break;
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                debug!(
                    target: "sfu.signaling",
                    connection_id = %connection_id,
                    "Client closed connection"
                );
                break;
            }
            Some(Err(e)) => {
                debug!(
                    target: "sfu.signaling",
                    connection_id = %connection_id,
                    error = %e,
                    "Receive error"
                );
                break;
            }
        }
    }

    gateway.disconnect().await;

    // The writer exits once every queue sender is gone
    drop(gateway);
    drop(outbound);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    info!(
        target: "sfu.signaling",
        connection_id = %connection_id,
        "Connection closed"
    );
}
