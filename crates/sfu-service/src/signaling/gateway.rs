//! Per-connection signaling handler.
//!
//! A `SignalingGateway` belongs to exactly one client connection. It decodes
//! requests, drives the joined room, and converts every outcome into exactly
//! one response frame. Errors never escape the gateway: they become error
//! responses carrying a client-safe message.
//!
//! The peer id is the connection id, so one connection is at most one peer
//! in at most one room.

use super::notifier::{ChannelNotifier, Notifier};
use super::protocol::{ClientRequest, JoinRoomData, Notification, RequestEnvelope, ServerMessage};
use crate::actors::{RoomActorHandle, RoomRegistryActorHandle};
use crate::engine::RoutingContext;
use crate::errors::SfuError;
use crate::observability::metrics as prom;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// A closed room is being evicted; a fresh `get_or_create` replaces it.
const JOIN_ATTEMPTS: usize = 3;

/// Successful dispatch: response data plus notifications that must follow it.
struct Reply {
    data: Value,
    follow_up: Vec<Notification>,
}

impl Reply {
    fn data(data: Value) -> Self {
        Self {
            data,
            follow_up: Vec::new(),
        }
    }

    fn empty() -> Self {
        Self::data(json!({}))
    }
}

pub struct SignalingGateway {
    connection_id: String,
    registry: RoomRegistryActorHandle,
    routing: Arc<dyn RoutingContext>,
    notifier: Arc<ChannelNotifier>,
    room: Option<RoomActorHandle>,
}

impl SignalingGateway {
    /// `notifier` must deliver to this same connection.
    #[must_use]
    pub fn new(
        connection_id: String,
        registry: RoomRegistryActorHandle,
        routing: Arc<dyn RoutingContext>,
        notifier: Arc<ChannelNotifier>,
    ) -> Self {
        Self {
            connection_id,
            registry,
            routing,
            notifier,
            room: None,
        }
    }

    /// Peer id used for this connection.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        self.room.as_ref().map(RoomActorHandle::room_id)
    }

    /// Handle one inbound text frame and queue everything it produced on the
    /// connection: the response, its follow-up notifications, then any
    /// notification raised while the request was in flight.
    pub async fn respond(&mut self, text: &str) -> Result<(), SfuError> {
        self.notifier.hold();
        let frames = self.handle_text(text).await;
        self.notifier.deliver(frames)
    }

    /// Handle one inbound text frame.
    ///
    /// Returns the frames to send in order: the response first, then any
    /// `new-consumer` notifications produced by the request.
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        match RequestEnvelope::from_text(text) {
            Ok(envelope) => self.handle_request(envelope).await,
            Err((id, e)) => {
                prom::record_signaling_request("invalid", "error");
                debug!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Rejected malformed frame"
                );
                vec![ServerMessage::failure(id, &e)]
            }
        }
    }

    #[instrument(skip_all, name = "sfu.signaling.request", fields(connection_id = %self.connection_id, request_id = envelope.id, method = %envelope.method))]
    pub async fn handle_request(&mut self, envelope: RequestEnvelope) -> Vec<ServerMessage> {
        let id = envelope.id;
        let request = match ClientRequest::parse(&envelope.method, envelope.data) {
            Ok(request) => request,
            Err(e) => {
                prom::record_signaling_request("invalid", "error");
                debug!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Rejected request"
                );
                return vec![ServerMessage::failure(id, &e)];
            }
        };

        let method = request.method();
        let start = Instant::now();
        let result = self.dispatch(request).await;
        prom::record_signaling_latency(method, start.elapsed());

        match result {
            Ok(reply) => {
                prom::record_signaling_request(method, "success");
                let mut frames = Vec::with_capacity(1 + reply.follow_up.len());
                frames.push(ServerMessage::success(id, reply.data));
                frames.extend(reply.follow_up.into_iter().map(ServerMessage::Notification));
                frames
            }
            Err(e) => {
                prom::record_signaling_request(method, "error");
                if e.is_fatal() {
                    error!(
                        target: "sfu.signaling",
                        connection_id = %self.connection_id,
                        method,
                        error = %e,
                        "Request failed, media engine unavailable"
                    );
                } else {
                    debug!(
                        target: "sfu.signaling",
                        connection_id = %self.connection_id,
                        method,
                        error = %e,
                        "Request failed"
                    );
                }
                vec![ServerMessage::failure(id, &e)]
            }
        }
    }

    async fn dispatch(&mut self, request: ClientRequest) -> Result<Reply, SfuError> {
        match request {
            ClientRequest::GetRouterCapabilities => Ok(Reply::data(json!({
                "rtpCapabilities": self.routing.rtp_capabilities()
            }))),

            ClientRequest::JoinRoom(data) => self.join_room(data).await,

            ClientRequest::CreateTransport(data) => {
                let mut descriptor = self
                    .joined_room()?
                    .create_transport(self.connection_id.clone(), data.direction)
                    .await?;
                let follow_up = std::mem::take(&mut descriptor.catch_up);
                let data = serde_json::to_value(&descriptor)
                    .map_err(|e| SfuError::Internal(format!("failed to encode transport: {e}")))?;
                Ok(Reply { data, follow_up })
            }

            ClientRequest::ConnectTransport(data) => {
                self.joined_room()?
                    .connect_transport(
                        self.connection_id.clone(),
                        data.transport_id,
                        data.dtls_parameters,
                    )
                    .await?;
                Ok(Reply::empty())
            }

            ClientRequest::Produce(data) => {
                let producer_id = self
                    .joined_room()?
                    .produce(
                        self.connection_id.clone(),
                        data.transport_id,
                        data.kind,
                        data.rtp_parameters,
                    )
                    .await?;
                Ok(Reply::data(json!({ "producerId": producer_id })))
            }

            ClientRequest::CloseProducer(data) => {
                self.joined_room()?
                    .close_producer(self.connection_id.clone(), data.producer_id)
                    .await?;
                Ok(Reply::empty())
            }

            ClientRequest::ConsumeAck(data) => {
                self.joined_room()?
                    .resume_consumer(self.connection_id.clone(), data.consumer_id)
                    .await?;
                Ok(Reply::empty())
            }

            ClientRequest::LeaveRoom => {
                self.leave("leave-room").await;
                Ok(Reply::empty())
            }
        }
    }

    async fn join_room(&mut self, data: JoinRoomData) -> Result<Reply, SfuError> {
        if let Some(room) = &self.room {
            return Err(SfuError::AlreadyJoined(room.room_id().to_string()));
        }

        let notifier: Arc<dyn Notifier> = self.notifier.clone();
        let mut attempt = 1;
        loop {
            let room = self.registry.get_or_create(data.room_id.clone()).await?;
            let joined = room
                .add_peer(
                    self.connection_id.clone(),
                    Arc::clone(&notifier),
                    data.rtp_capabilities.clone(),
                )
                .await;

            match joined {
                Ok(joined) => {
                    info!(
                        target: "sfu.signaling",
                        connection_id = %self.connection_id,
                        room_id = %room.room_id(),
                        peers = joined.peers.len(),
                        "Connection joined room"
                    );
                    self.room = Some(room);
                    return Ok(Reply {
                        data: json!({ "peerId": joined.peer_id, "peers": joined.peers }),
                        follow_up: joined.catch_up,
                    });
                }
                Err(SfuError::RoomClosed(room_id)) if attempt < JOIN_ATTEMPTS => {
                    debug!(
                        target: "sfu.signaling",
                        connection_id = %self.connection_id,
                        room_id = %room_id,
                        attempt,
                        "Room closed during join, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Clean up after the connection is gone. Safe to call more than once;
    /// only the first call (or an earlier `leave-room`) removes the peer.
    pub async fn disconnect(&mut self) {
        self.leave("disconnect").await;
    }

    async fn leave(&mut self, reason: &'static str) {
        let Some(room) = self.room.take() else {
            return;
        };

        match room.remove_peer(self.connection_id.clone()).await {
            Ok(removed) => {
                info!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    room_id = %room.room_id(),
                    reason,
                    removed,
                    "Connection left room"
                );
            }
            Err(e) => {
                // Room already gone; its shutdown closed this peer's resources
                warn!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    room_id = %room.room_id(),
                    reason,
                    error = %e,
                    "Peer removal failed"
                );
            }
        }
    }

    fn joined_room(&self) -> Result<RoomActorHandle, SfuError> {
        self.room
            .clone()
            .ok_or_else(|| SfuError::UnknownPeer(self.connection_id.clone()))
    }
}
