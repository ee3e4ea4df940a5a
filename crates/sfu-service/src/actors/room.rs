//! `RoomActor` - per-room actor that owns the peer/media graph.
//!
//! Each `RoomActor`:
//! - Owns every peer in one room, and for each peer its transports,
//!   producers and consumers
//! - Serializes all mutations; engine calls are awaited inline so other
//!   operations queue behind them
//! - Fans each new producer out to every other active peer
//! - Reports itself empty to the registry, which evicts it only after the
//!   room confirms it is still empty (`CloseIfEmpty`)
//!
//! # Consumer delivery
//!
//! Each peer keeps a producer -> consumer index. A remote producer is
//! consumed at most once per peer, whichever path gets there first:
//! normal fan-out, the join-time catch-up, or the catch-up sweep that runs
//! when the peer creates a receive transport.

use super::messages::{
    ConsumerSummary, JoinResult, PeerState, PeerSummary, ProducerSummary, RegistryEvent,
    RoomMessage, RoomState, TransportDescriptor, TransportSummary,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::engine::{
    ConsumerHandle, DtlsParameters, MediaKind, ProducerHandle, RoutingContext, RtpCapabilities,
    RtpParameters, TransportDirection, TransportHandle, TransportOptions,
};
use crate::errors::SfuError;
use crate::observability::metrics as prom;
use crate::signaling::{Notification, Notifier};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to a `RoomActor`.
#[derive(Debug, Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
    instance_id: u64,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Distinguishes successive rooms created under the same id.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Send a request and await the reply.
    ///
    /// A room that has been evicted (its actor cancelled) answers
    /// `RoomClosed`, so callers can retry against a fresh room.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.sender.send(build(tx)).await {
            return Err(self.unavailable(format!("channel send failed: {e}")));
        }
        rx.await
            .map_err(|e| self.unavailable(format!("response receive failed: {e}")))
    }

    fn unavailable(&self, detail: String) -> SfuError {
        if self.cancel_token.is_cancelled() {
            SfuError::RoomClosed(self.room_id.clone())
        } else {
            SfuError::Internal(detail)
        }
    }

    /// Add a peer. Existing peers are notified; the joining peer is not.
    pub async fn add_peer(
        &self,
        peer_id: String,
        notifier: Arc<dyn Notifier>,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> Result<JoinResult, SfuError> {
        self.request(|respond_to| RoomMessage::AddPeer {
            peer_id,
            notifier,
            rtp_capabilities,
            respond_to,
        })
        .await?
    }

    /// Remove a peer with full cleanup cascade.
    ///
    /// Returns `false` if the peer was not in the room (not an error).
    pub async fn remove_peer(&self, peer_id: String) -> Result<bool, SfuError> {
        self.request(|respond_to| RoomMessage::RemovePeer {
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn create_transport(
        &self,
        peer_id: String,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, SfuError> {
        self.request(|respond_to| RoomMessage::CreateTransport {
            peer_id,
            direction,
            respond_to,
        })
        .await?
    }

    pub async fn connect_transport(
        &self,
        peer_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::ConnectTransport {
            peer_id,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await?
    }

    /// Start producing on a connected send transport. Returns the producer id.
    pub async fn produce(
        &self,
        peer_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, SfuError> {
        self.request(|respond_to| RoomMessage::Produce {
            peer_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to,
        })
        .await?
    }

    pub async fn close_producer(
        &self,
        peer_id: String,
        producer_id: String,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::CloseProducer {
            peer_id,
            producer_id,
            respond_to,
        })
        .await?
    }

    pub async fn resume_consumer(
        &self,
        peer_id: String,
        consumer_id: String,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::ResumeConsumer {
            peer_id,
            consumer_id,
            respond_to,
        })
        .await?
    }

    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        self.request(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    /// Close the room if it has no peers. Used by the registry only.
    pub(crate) async fn close_if_empty(&self) -> Result<bool, SfuError> {
        self.request(|respond_to| RoomMessage::CloseIfEmpty { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Dependencies a room is spawned with.
#[derive(Clone)]
pub struct RoomContext {
    /// Shared routing context, read-only.
    pub routing: Arc<dyn RoutingContext>,
    /// Event channel back to the registry.
    pub events: mpsc::UnboundedSender<RegistryEvent>,
    pub metrics: Arc<ActorMetrics>,
    pub max_peers: usize,
}

struct PeerTransport {
    handle: Box<dyn TransportHandle>,
    connected: bool,
}

struct PeerConsumer {
    handle: Box<dyn ConsumerHandle>,
}

/// Peer state within a room.
struct Peer {
    peer_id: String,
    notifier: Arc<dyn Notifier>,
    state: PeerState,
    rtp_capabilities: RtpCapabilities,
    transports: HashMap<String, PeerTransport>,
    /// First receive transport; all consumers are created on it.
    recv_transport_id: Option<String>,
    producers: HashMap<String, Box<dyn ProducerHandle>>,
    consumers: HashMap<String, PeerConsumer>,
    /// Remote producer id -> consumer id.
    consumed: HashMap<String, String>,
}

impl Peer {
    fn new(peer_id: String, notifier: Arc<dyn Notifier>, rtp_capabilities: RtpCapabilities) -> Self {
        Self {
            peer_id,
            notifier,
            state: PeerState::Joining,
            rtp_capabilities,
            transports: HashMap::new(),
            recv_transport_id: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            consumed: HashMap::new(),
        }
    }

    fn summary(&self) -> PeerSummary {
        let mut transports: Vec<TransportSummary> = self
            .transports
            .iter()
            .map(|(id, t)| TransportSummary {
                transport_id: id.clone(),
                direction: t.handle.direction(),
                connected: t.connected,
            })
            .collect();
        transports.sort_by(|a, b| a.transport_id.cmp(&b.transport_id));

        let mut producers: Vec<ProducerSummary> = self
            .producers
            .iter()
            .map(|(id, p)| ProducerSummary {
                producer_id: id.clone(),
                kind: p.kind(),
            })
            .collect();
        producers.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));

        let mut consumers: Vec<ConsumerSummary> = self
            .consumers
            .iter()
            .map(|(id, c)| ConsumerSummary {
                consumer_id: id.clone(),
                producer_id: c.handle.producer_id().to_string(),
                kind: c.handle.kind(),
                paused: c.handle.paused(),
            })
            .collect();
        consumers.sort_by(|a, b| a.consumer_id.cmp(&b.consumer_id));

        PeerSummary {
            peer_id: self.peer_id.clone(),
            state: self.state,
            transports,
            producers,
            consumers,
        }
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    instance_id: u64,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
    routing: Arc<dyn RoutingContext>,
    events: mpsc::UnboundedSender<RegistryEvent>,
    peers: HashMap<String, Peer>,
    max_peers: usize,
    /// Set once the room confirmed it is empty. A closed room admits no one.
    closed: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: String,
        instance_id: u64,
        cancel_token: CancellationToken,
        context: RoomContext,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            instance_id,
            receiver,
            cancel_token: cancel_token.clone(),
            routing: context.routing,
            events: context.events,
            peers: HashMap::new(),
            max_peers: context.max_peers,
            closed: false,
            metrics: context.metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            instance_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.room", fields(room_id = %self.room_id, instance_id = self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            instance_id = self.instance_id,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            instance_id = self.instance_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::AddPeer {
                peer_id,
                notifier,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self.add_peer(peer_id, notifier, rtp_capabilities).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::RemovePeer {
                peer_id,
                respond_to,
            } => {
                let removed = self.remove_peer(&peer_id).await;
                let _ = respond_to.send(removed);
            }

            RoomMessage::CreateTransport {
                peer_id,
                direction,
                respond_to,
            } => {
                let result = self.create_transport(peer_id, direction).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ConnectTransport {
                peer_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = self
                    .connect_transport(&peer_id, &transport_id, dtls_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Produce {
                peer_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = self
                    .produce(&peer_id, &transport_id, kind, rtp_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::CloseProducer {
                peer_id,
                producer_id,
                respond_to,
            } => {
                let result = self.close_producer(&peer_id, &producer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ResumeConsumer {
                peer_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.resume_consumer(&peer_id, &consumer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }

            RoomMessage::CloseIfEmpty { respond_to } => {
                let _ = respond_to.send(self.close_if_empty());
            }
        }
    }

    async fn add_peer(
        &mut self,
        peer_id: String,
        notifier: Arc<dyn Notifier>,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> Result<JoinResult, SfuError> {
        if self.closed {
            return Err(SfuError::RoomClosed(self.room_id.clone()));
        }
        if self.peers.contains_key(&peer_id) {
            return Err(SfuError::DuplicatePeer(peer_id));
        }
        if self.peers.len() >= self.max_peers {
            return Err(SfuError::RoomCapacityExceeded(format!(
                "room {} is at its limit of {} peers",
                self.room_id, self.max_peers
            )));
        }

        let rtp_capabilities = rtp_capabilities.unwrap_or_else(|| self.routing.rtp_capabilities());
        let mut peers: Vec<String> = self.peers.keys().cloned().collect();
        peers.sort();

        self.peers.insert(
            peer_id.clone(),
            Peer::new(peer_id.clone(), notifier, rtp_capabilities),
        );

        self.broadcast(
            &peer_id,
            &Notification::PeerJoined {
                peer_id: peer_id.clone(),
            },
        );

        let catch_up = self.catch_up(&peer_id).await;

        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.state = PeerState::Active;
        }
        self.metrics.peer_joined();

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            total_peers = self.peers.len(),
            "Peer joined"
        );

        Ok(JoinResult {
            peer_id,
            peers,
            catch_up,
        })
    }

    async fn remove_peer(&mut self, peer_id: &str) -> bool {
        let (transports, producers, consumers) = match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.state = PeerState::Leaving;
                peer.consumed.clear();
                (
                    std::mem::take(&mut peer.transports),
                    std::mem::take(&mut peer.producers),
                    std::mem::take(&mut peer.consumers),
                )
            }
            None => {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    peer_id = %peer_id,
                    "Remove for absent peer ignored"
                );
                return false;
            }
        };

        // Consumers elsewhere that reference this peer's producers
        for producer_id in producers.keys() {
            self.close_consumers_of(producer_id).await;
        }

        for (transport_id, transport) in transports {
            record_close("transport", &transport_id, transport.handle.close().await);
        }
        for (producer_id, producer) in producers {
            record_close("producer", &producer_id, producer.close().await);
        }
        for (consumer_id, consumer) in consumers {
            record_close("consumer", &consumer_id, consumer.handle.close().await);
        }

        self.peers.remove(peer_id);
        self.metrics.peer_left();

        self.broadcast(
            peer_id,
            &Notification::PeerLeft {
                peer_id: peer_id.to_string(),
            },
        );

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            remaining_peers = self.peers.len(),
            "Peer removed"
        );

        if self.peers.is_empty() {
            let event = RegistryEvent::RoomEmptied {
                room_id: self.room_id.clone(),
                instance_id: self.instance_id,
            };
            if self.events.send(event).is_err() {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    "Registry event channel closed, room not reported empty"
                );
            }
        }

        true
    }

    async fn create_transport(
        &mut self,
        peer_id: String,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, SfuError> {
        if !self.peers.contains_key(&peer_id) {
            return Err(SfuError::UnknownPeer(peer_id));
        }

        let handle = self
            .routing
            .create_transport(TransportOptions {
                direction,
                peer_id: peer_id.clone(),
            })
            .await?;
        let transport_id = handle.id().to_string();
        let parameters = handle.parameters();

        let Some(peer) = self.peers.get_mut(&peer_id) else {
            record_close("transport", &transport_id, handle.close().await);
            return Err(SfuError::UnknownPeer(peer_id));
        };
        peer.transports.insert(
            transport_id.clone(),
            PeerTransport {
                handle,
                connected: false,
            },
        );

        let catch_up = if direction == TransportDirection::Recv {
            if peer.recv_transport_id.is_none() {
                peer.recv_transport_id = Some(transport_id.clone());
            }
            self.catch_up(&peer_id).await
        } else {
            Vec::new()
        };

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            direction = %direction,
            catch_up_consumers = catch_up.len(),
            "Transport created"
        );

        Ok(TransportDescriptor {
            transport_id,
            direction,
            parameters,
            catch_up,
        })
    }

    async fn connect_transport(
        &mut self,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        {
            let transport = self.transport(peer_id, transport_id)?;
            transport.handle.connect(dtls_parameters).await?;
        }

        if let Some(transport) = self
            .peers
            .get_mut(peer_id)
            .and_then(|p| p.transports.get_mut(transport_id))
        {
            transport.connected = true;
        }
        Ok(())
    }

    async fn produce(
        &mut self,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, SfuError> {
        let producer = {
            let transport = self.transport(peer_id, transport_id)?;
            if transport.handle.direction() != TransportDirection::Send {
                return Err(SfuError::Negotiation(format!(
                    "transport {transport_id} is not a send transport"
                )));
            }
            if !transport.connected {
                return Err(SfuError::Negotiation(format!(
                    "transport {transport_id} is not connected"
                )));
            }
            transport.handle.produce(kind, rtp_parameters).await?
        };

        let producer_id = producer.id().to_string();
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.producers.insert(producer_id.clone(), producer);
            }
            None => {
                record_close("producer", &producer_id, producer.close().await);
                return Err(SfuError::UnknownPeer(peer_id.to_string()));
            }
        }
        prom::record_producer_created(kind.as_str());

        let targets: Vec<String> = self
            .peers
            .values()
            .filter(|p| {
                p.peer_id != peer_id
                    && p.state == PeerState::Active
                    && p.recv_transport_id.is_some()
            })
            .map(|p| p.peer_id.clone())
            .collect();

        let mut delivered = 0usize;
        for target in &targets {
            match self.create_consumer(target, peer_id, &producer_id).await {
                Ok(Some(notification)) => {
                    self.notify(target, notification);
                    delivered += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        producer_id = %producer_id,
                        consumer_peer_id = %target,
                        error = %e,
                        "Fan-out consumer creation failed, peer skipped"
                    );
                }
            }
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            consumers = delivered,
            "Producer created"
        );

        Ok(producer_id)
    }

    async fn close_producer(&mut self, peer_id: &str, producer_id: &str) -> Result<(), SfuError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| SfuError::UnknownPeer(peer_id.to_string()))?;
        if !peer.producers.contains_key(producer_id) {
            return Err(SfuError::UnknownProducer(producer_id.to_string()));
        }

        self.close_consumers_of(producer_id).await;

        if let Some(producer) = self
            .peers
            .get_mut(peer_id)
            .and_then(|p| p.producers.remove(producer_id))
        {
            record_close("producer", producer_id, producer.close().await);
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            "Producer closed"
        );
        Ok(())
    }

    async fn resume_consumer(&mut self, peer_id: &str, consumer_id: &str) -> Result<(), SfuError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| SfuError::UnknownPeer(peer_id.to_string()))?;
        let consumer = peer
            .consumers
            .get(consumer_id)
            .ok_or_else(|| SfuError::UnknownConsumer(consumer_id.to_string()))?;
        consumer.handle.resume().await
    }

    fn get_state(&self) -> RoomState {
        let mut peers: Vec<PeerSummary> = self.peers.values().map(Peer::summary).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        RoomState {
            room_id: self.room_id.clone(),
            instance_id: self.instance_id,
            closed: self.closed,
            peers,
        }
    }

    /// Close the room if it has no peers. A closed room also cancels its own
    /// token, so the registry never hands it out again.
    fn close_if_empty(&mut self) -> bool {
        if self.peers.is_empty() && !self.closed {
            self.closed = true;
            self.cancel_token.cancel();
            debug!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                instance_id = self.instance_id,
                "Room closed, no peers left"
            );
        }
        self.closed
    }

    /// Look up a transport owned by `peer_id`.
    fn transport(&self, peer_id: &str, transport_id: &str) -> Result<&PeerTransport, SfuError> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| SfuError::UnknownPeer(peer_id.to_string()))?
            .transports
            .get(transport_id)
            .ok_or_else(|| SfuError::UnknownTransport(transport_id.to_string()))
    }

    /// Create consumers on `peer_id` for every live producer of other active
    /// peers it does not consume yet. No-op without a receive transport.
    ///
    /// Returns the `new-consumer` events for the caller to deliver.
    async fn catch_up(&mut self, peer_id: &str) -> Vec<Notification> {
        let pending: Vec<(String, String)> = match self.peers.get(peer_id) {
            Some(peer) if peer.recv_transport_id.is_some() => self
                .peers
                .values()
                .filter(|other| other.peer_id != peer_id && other.state == PeerState::Active)
                .flat_map(|other| {
                    other
                        .producers
                        .keys()
                        .map(move |producer_id| (other.peer_id.clone(), producer_id.clone()))
                })
                .filter(|(_, producer_id)| !peer.consumed.contains_key(producer_id))
                .collect(),
            _ => return Vec::new(),
        };

        let mut notifications = Vec::with_capacity(pending.len());
        for (owner_id, producer_id) in pending {
            match self.create_consumer(peer_id, &owner_id, &producer_id).await {
                Ok(Some(notification)) => notifications.push(notification),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        producer_id = %producer_id,
                        error = %e,
                        "Catch-up consumer creation failed"
                    );
                }
            }
        }
        notifications
    }

    /// Consume `producer_id` (owned by `owner_id`) on `target_id`'s receive
    /// transport.
    ///
    /// Returns `None` if the target already consumes the producer or has no
    /// receive transport.
    async fn create_consumer(
        &mut self,
        target_id: &str,
        owner_id: &str,
        producer_id: &str,
    ) -> Result<Option<Notification>, SfuError> {
        let consumer = {
            let target = self
                .peers
                .get(target_id)
                .ok_or_else(|| SfuError::UnknownPeer(target_id.to_string()))?;
            if target.consumed.contains_key(producer_id) {
                return Ok(None);
            }
            let Some(transport) = target
                .recv_transport_id
                .as_ref()
                .and_then(|id| target.transports.get(id))
            else {
                return Ok(None);
            };
            transport
                .handle
                .consume(producer_id, target.rtp_capabilities.clone())
                .await?
        };

        let consumer_id = consumer.id().to_string();
        let notification = Notification::NewConsumer {
            peer_id: owner_id.to_string(),
            producer_id: producer_id.to_string(),
            consumer_id: consumer_id.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };

        match self.peers.get_mut(target_id) {
            Some(target) => {
                target
                    .consumed
                    .insert(producer_id.to_string(), consumer_id.clone());
                target
                    .consumers
                    .insert(consumer_id, PeerConsumer { handle: consumer });
            }
            None => {
                record_close("consumer", &consumer_id, consumer.close().await);
                return Err(SfuError::UnknownPeer(target_id.to_string()));
            }
        }
        prom::record_consumer_created();

        Ok(Some(notification))
    }

    /// Close every consumer of `producer_id` across all peers.
    async fn close_consumers_of(&mut self, producer_id: &str) {
        let mut closing = Vec::new();
        for peer in self.peers.values_mut() {
            if let Some(consumer_id) = peer.consumed.remove(producer_id) {
                if let Some(consumer) = peer.consumers.remove(&consumer_id) {
                    closing.push((peer.peer_id.clone(), consumer_id, consumer));
                }
            }
        }

        for (peer_id, consumer_id, consumer) in closing {
            record_close("consumer", &consumer_id, consumer.handle.close().await);
            self.notify(
                &peer_id,
                Notification::ConsumerClosed {
                    consumer_id,
                    producer_id: producer_id.to_string(),
                },
            );
        }
    }

    /// Push a notification to one peer. Leaving peers get nothing.
    fn notify(&self, peer_id: &str, notification: Notification) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        if peer.state == PeerState::Leaving {
            return;
        }
        if let Err(e) = peer.notifier.notify(notification) {
            debug!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                error = %e,
                "Notification dropped"
            );
        }
    }

    /// Push a notification to every active peer except `except_peer_id`.
    fn broadcast(&self, except_peer_id: &str, notification: &Notification) {
        for peer in self.peers.values() {
            if peer.peer_id != except_peer_id && peer.state == PeerState::Active {
                if let Err(e) = peer.notifier.notify(notification.clone()) {
                    debug!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer.peer_id,
                        error = %e,
                        "Broadcast dropped"
                    );
                }
            }
        }
    }

    /// Close every engine resource. No notifications are sent.
    async fn graceful_shutdown(&mut self) {
        self.closed = true;
        let peer_count = self.peers.len();

        for (_, peer) in self.peers.drain() {
            for (transport_id, transport) in peer.transports {
                record_close("transport", &transport_id, transport.handle.close().await);
            }
            for (producer_id, producer) in peer.producers {
                record_close("producer", &producer_id, producer.close().await);
            }
            for (consumer_id, consumer) in peer.consumers {
                record_close("consumer", &consumer_id, consumer.handle.close().await);
            }
            self.metrics.peer_left();
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peers_closed = peer_count,
            "Graceful shutdown complete"
        );
    }
}

/// Log and count a failed close. Cleanup always continues.
fn record_close(resource: &'static str, id: &str, result: Result<(), SfuError>) {
    if let Err(e) = result {
        prom::record_cleanup_failure(resource);
        warn!(
            target: "sfu.actor.room",
            resource,
            id = %id,
            error = %e,
            "Failed to close media resource"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::local::{LocalWorker, WorkerSettings};
    use crate::engine::{default_media_codecs, DtlsFingerprint, DtlsRole, MediaWorker};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        received: Mutex<Vec<Notification>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Notification> {
            std::mem::take(&mut *self.received.lock().unwrap())
        }
    }

    impl Notifier for Recorder {
        fn notify(&self, notification: Notification) -> Result<(), SfuError> {
            self.received.lock().unwrap().push(notification);
            Ok(())
        }
    }

    struct Fixture {
        handle: RoomActorHandle,
        events: mpsc::UnboundedReceiver<RegistryEvent>,
        _worker: LocalWorker,
    }

    async fn room(max_peers: usize) -> Fixture {
        let worker = LocalWorker::spawn(WorkerSettings {
            rtc_min_port: 41000,
            rtc_max_port: 41100,
            listen_ip: "127.0.0.1".parse().unwrap(),
            announced_ip: None,
            log_level: "warn".to_string(),
        })
        .unwrap();
        let routing = worker.create_router(default_media_codecs()).await.unwrap();
        let (events_tx, events) = mpsc::unbounded_channel();

        let (handle, _task) = RoomActor::spawn(
            "room-1".to_string(),
            1,
            CancellationToken::new(),
            RoomContext {
                routing,
                events: events_tx,
                metrics: ActorMetrics::new(),
                max_peers,
            },
        );

        Fixture {
            handle,
            events,
            _worker: worker,
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AB:CD:EF".to_string(),
            }],
        }
    }

    fn video() -> RtpParameters {
        json!({ "codecs": [{ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 }] })
    }

    async fn join(room: &RoomActorHandle, peer_id: &str) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        room.add_peer(peer_id.to_string(), Arc::clone(&recorder) as Arc<dyn Notifier>, None)
            .await
            .unwrap();
        recorder
    }

    async fn connected_send(room: &RoomActorHandle, peer_id: &str) -> String {
        let transport = room
            .create_transport(peer_id.to_string(), TransportDirection::Send)
            .await
            .unwrap();
        room.connect_transport(peer_id.to_string(), transport.transport_id.clone(), dtls())
            .await
            .unwrap();
        transport.transport_id
    }

    fn new_consumer_count(notifications: &[Notification]) -> usize {
        notifications
            .iter()
            .filter(|n| matches!(n, Notification::NewConsumer { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_join_notifies_others_but_not_self() {
        let fixture = room(10).await;
        let alice = join(&fixture.handle, "alice").await;
        assert!(alice.take().is_empty());

        let bob = join(&fixture.handle, "bob").await;
        assert_eq!(
            alice.take(),
            vec![Notification::PeerJoined {
                peer_id: "bob".to_string()
            }]
        );
        assert!(bob.take().is_empty());
    }

    #[tokio::test]
    async fn test_join_lists_existing_peers() {
        let fixture = room(10).await;
        join(&fixture.handle, "alice").await;

        let result = fixture
            .handle
            .add_peer(
                "bob".to_string(),
                Arc::new(Recorder::default()) as Arc<dyn Notifier>,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.peer_id, "bob");
        assert_eq!(result.peers, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected_and_existing_untouched() {
        let fixture = room(10).await;
        let alice = join(&fixture.handle, "alice").await;
        connected_send(&fixture.handle, "alice").await;

        let result = fixture
            .handle
            .add_peer(
                "alice".to_string(),
                Arc::new(Recorder::default()) as Arc<dyn Notifier>,
                None,
            )
            .await;
        assert!(matches!(result, Err(SfuError::DuplicatePeer(_))));

        let state = fixture.handle.get_state().await.unwrap();
        assert_eq!(state.peers.len(), 1);
        assert_eq!(state.peer("alice").unwrap().transports.len(), 1);
        assert!(alice.take().is_empty());
    }

    #[tokio::test]
    async fn test_room_capacity_enforced() {
        let fixture = room(1).await;
        join(&fixture.handle, "alice").await;

        let result = fixture
            .handle
            .add_peer(
                "bob".to_string(),
                Arc::new(Recorder::default()) as Arc<dyn Notifier>,
                None,
            )
            .await;
        assert!(matches!(result, Err(SfuError::RoomCapacityExceeded(_))));
    }

    #[tokio::test]
    async fn test_unknown_lookups() {
        let fixture = room(10).await;
        join(&fixture.handle, "alice").await;

        let result = fixture
            .handle
            .create_transport("ghost".to_string(), TransportDirection::Send)
            .await;
        assert!(matches!(result, Err(SfuError::UnknownPeer(_))));

        let result = fixture
            .handle
            .connect_transport("alice".to_string(), "nope".to_string(), dtls())
            .await;
        assert!(matches!(result, Err(SfuError::UnknownTransport(_))));

        let result = fixture
            .handle
            .close_producer("alice".to_string(), "nope".to_string())
            .await;
        assert!(matches!(result, Err(SfuError::UnknownProducer(_))));

        let result = fixture
            .handle
            .resume_consumer("alice".to_string(), "nope".to_string())
            .await;
        assert!(matches!(result, Err(SfuError::UnknownConsumer(_))));
    }

    #[tokio::test]
    async fn test_produce_requires_connected_send_transport() {
        let fixture = room(10).await;
        join(&fixture.handle, "alice").await;

        let send = fixture
            .handle
            .create_transport("alice".to_string(), TransportDirection::Send)
            .await
            .unwrap();
        let result = fixture
            .handle
            .produce(
                "alice".to_string(),
                send.transport_id.clone(),
                MediaKind::Video,
                video(),
            )
            .await;
        assert!(matches!(result, Err(SfuError::Negotiation(_))));

        let recv = fixture
            .handle
            .create_transport("alice".to_string(), TransportDirection::Recv)
            .await
            .unwrap();
        fixture
            .handle
            .connect_transport("alice".to_string(), recv.transport_id.clone(), dtls())
            .await
            .unwrap();
        let result = fixture
            .handle
            .produce("alice".to_string(), recv.transport_id, MediaKind::Video, video())
            .await;
        assert!(matches!(result, Err(SfuError::Negotiation(_))));

        let state = fixture.handle.get_state().await.unwrap();
        assert!(state.peer("alice").unwrap().producers.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_skips_producer_and_peers_without_recv_transport() {
        let fixture = room(10).await;
        let alice = join(&fixture.handle, "alice").await;
        let bob = join(&fixture.handle, "bob").await;
        let carol = join(&fixture.handle, "carol").await;
        fixture
            .handle
            .create_transport("bob".to_string(), TransportDirection::Recv)
            .await
            .unwrap();
        alice.take();

        let send = connected_send(&fixture.handle, "alice").await;
        let producer_id = fixture
            .handle
            .produce("alice".to_string(), send, MediaKind::Video, video())
            .await
            .unwrap();

        let bob_events = bob.take();
        assert_eq!(new_consumer_count(&bob_events), 1);
        assert!(matches!(
            bob_events.last(),
            Some(Notification::NewConsumer { peer_id, producer_id: p, .. })
                if peer_id == "alice" && *p == producer_id
        ));
        assert_eq!(new_consumer_count(&alice.take()), 0);
        assert_eq!(new_consumer_count(&carol.take()), 0);
    }

    #[tokio::test]
    async fn test_late_recv_transport_catches_up_exactly_once() {
        let fixture = room(10).await;
        join(&fixture.handle, "alice").await;
        let send = connected_send(&fixture.handle, "alice").await;
        fixture
            .handle
            .produce("alice".to_string(), send, MediaKind::Video, video())
            .await
            .unwrap();

        join(&fixture.handle, "bob").await;
        let first = fixture
            .handle
            .create_transport("bob".to_string(), TransportDirection::Recv)
            .await
            .unwrap();
        assert_eq!(first.catch_up.len(), 1);

        let second = fixture
            .handle
            .create_transport("bob".to_string(), TransportDirection::Recv)
            .await
            .unwrap();
        assert!(second.catch_up.is_empty());

        let state = fixture.handle.get_state().await.unwrap();
        assert_eq!(state.peer("bob").unwrap().consumers.len(), 1);
        assert!(state.peer("bob").unwrap().consumers[0].paused);
    }

    #[tokio::test]
    async fn test_close_producer_closes_remote_consumers() {
        let fixture = room(10).await;
        join(&fixture.handle, "alice").await;
        let bob = join(&fixture.handle, "bob").await;
        fixture
            .handle
            .create_transport("bob".to_string(), TransportDirection::Recv)
            .await
            .unwrap();
        let send = connected_send(&fixture.handle, "alice").await;
        let producer_id = fixture
            .handle
            .produce("alice".to_string(), send, MediaKind::Video, video())
            .await
            .unwrap();
        bob.take();

        fixture
            .handle
            .close_producer("alice".to_string(), producer_id.clone())
            .await
            .unwrap();

        assert!(matches!(
            bob.take().as_slice(),
            [Notification::ConsumerClosed { producer_id: p, .. }] if *p == producer_id
        ));
        let state = fixture.handle.get_state().await.unwrap();
        assert!(state.peer("alice").unwrap().producers.is_empty());
        assert!(state.peer("bob").unwrap().consumers.is_empty());
    }

    #[tokio::test]
    async fn test_resume_consumer() {
        let fixture = room(10).await;
        join(&fixture.handle, "alice").await;
        join(&fixture.handle, "bob").await;
        fixture
            .handle
            .create_transport("bob".to_string(), TransportDirection::Recv)
            .await
            .unwrap();
        let send = connected_send(&fixture.handle, "alice").await;
        fixture
            .handle
            .produce("alice".to_string(), send, MediaKind::Video, video())
            .await
            .unwrap();

        let state = fixture.handle.get_state().await.unwrap();
        let consumer_id = state.peer("bob").unwrap().consumers[0].consumer_id.clone();
        fixture
            .handle
            .resume_consumer("bob".to_string(), consumer_id)
            .await
            .unwrap();

        let state = fixture.handle.get_state().await.unwrap();
        assert!(!state.peer("bob").unwrap().consumers[0].paused);
    }

    #[tokio::test]
    async fn test_remove_peer_is_idempotent_and_reports_empty() {
        let mut fixture = room(10).await;
        join(&fixture.handle, "alice").await;
        let bob = join(&fixture.handle, "bob").await;

        assert!(fixture.handle.remove_peer("alice".to_string()).await.unwrap());
        assert!(!fixture.handle.remove_peer("alice".to_string()).await.unwrap());
        assert_eq!(
            bob.take(),
            vec![Notification::PeerLeft {
                peer_id: "alice".to_string()
            }]
        );
        assert!(fixture.events.try_recv().is_err());

        assert!(fixture.handle.remove_peer("bob".to_string()).await.unwrap());
        assert_eq!(
            fixture.events.recv().await,
            Some(RegistryEvent::RoomEmptied {
                room_id: "room-1".to_string(),
                instance_id: 1
            })
        );
    }

    #[tokio::test]
    async fn test_closed_room_rejects_joins() {
        let fixture = room(10).await;
        join(&fixture.handle, "alice").await;
        assert!(!fixture.handle.close_if_empty().await.unwrap());

        fixture
            .handle
            .remove_peer("alice".to_string())
            .await
            .unwrap();
        assert!(fixture.handle.close_if_empty().await.unwrap());

        let result = fixture
            .handle
            .add_peer(
                "bob".to_string(),
                Arc::new(Recorder::default()) as Arc<dyn Notifier>,
                None,
            )
            .await;
        assert!(matches!(result, Err(SfuError::RoomClosed(_))));
    }

    #[tokio::test]
    async fn test_cancelled_room_answers_room_closed() {
        let fixture = room(10).await;
        fixture.handle.cancel();
        tokio::task::yield_now().await;

        let result = fixture
            .handle
            .add_peer(
                "alice".to_string(),
                Arc::new(Recorder::default()) as Arc<dyn Notifier>,
                None,
            )
            .await;
        assert!(matches!(result, Err(SfuError::RoomClosed(_))));
    }
}
