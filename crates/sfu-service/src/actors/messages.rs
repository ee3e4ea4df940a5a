//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use super::room::RoomActorHandle;
use crate::engine::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportDirection,
    TransportParameters,
};
use crate::errors::SfuError;
use crate::signaling::{Notification, Notifier};

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Return the live room for `room_id`, creating it if absent.
    GetOrCreate {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },

    /// Look up a room without creating it.
    Get {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },

    /// Get registry status (for health and diagnostics).
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and close every room.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
}

/// Events delivered to the registry outside its request mailbox.
/// Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The room's last peer left. The registry re-validates before evicting.
    RoomEmptied { room_id: String, instance_id: u64 },

    /// Answer to the registry's close check. `closed` is false if the room
    /// gained a peer after it reported empty.
    RoomCloseChecked {
        room_id: String,
        instance_id: u64,
        closed: bool,
    },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    AddPeer {
        peer_id: String,
        notifier: Arc<dyn Notifier>,
        /// Client device capabilities. Defaults to the router's.
        rtp_capabilities: Option<RtpCapabilities>,
        respond_to: oneshot::Sender<Result<JoinResult, SfuError>>,
    },

    /// Remove a peer and cascade cleanup. Answers `false` if it was absent.
    RemovePeer {
        peer_id: String,
        respond_to: oneshot::Sender<bool>,
    },

    CreateTransport {
        peer_id: String,
        direction: TransportDirection,
        respond_to: oneshot::Sender<Result<TransportDescriptor, SfuError>>,
    },

    ConnectTransport {
        peer_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    Produce {
        peer_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        /// Response channel for the new producer id.
        respond_to: oneshot::Sender<Result<String, SfuError>>,
    },

    CloseProducer {
        peer_id: String,
        producer_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    ResumeConsumer {
        peer_id: String,
        consumer_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Registry-only. Closes the room if it is still empty.
    CloseIfEmpty { respond_to: oneshot::Sender<bool> },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Peer lifecycle within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Registered, join broadcast in progress.
    Joining,
    Active,
    /// Cleanup cascade in progress.
    Leaving,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinResult {
    pub peer_id: String,
    /// Other peers already in the room.
    pub peers: Vec<String>,
    /// `new-consumer` events for the joining peer, to be delivered after the
    /// join response.
    pub catch_up: Vec<Notification>,
}

/// A new transport, as returned to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub transport_id: String,
    #[serde(skip)]
    pub direction: TransportDirection,
    #[serde(flatten)]
    pub parameters: TransportParameters,
    /// `new-consumer` events from the receive-transport catch-up sweep, to be
    /// delivered after the create-transport response.
    #[serde(skip)]
    pub catch_up: Vec<Notification>,
}

/// Room snapshot (for diagnostics and tests).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_id: String,
    pub instance_id: u64,
    pub closed: bool,
    pub peers: Vec<PeerSummary>,
}

impl RoomState {
    #[must_use]
    pub fn peer(&self, peer_id: &str) -> Option<&PeerSummary> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: String,
    pub state: PeerState,
    pub transports: Vec<TransportSummary>,
    pub producers: Vec<ProducerSummary>,
    pub consumers: Vec<ConsumerSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSummary {
    pub transport_id: String,
    pub direction: TransportDirection,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSummary {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

/// Registry status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub room_count: usize,
    pub peer_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}
