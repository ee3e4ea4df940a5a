//! SFU coordinator error types.
//!
//! Error types map to signaling error codes for client responses.
//! Internal details are logged server-side but not exposed to clients.

use thiserror::Error;

/// SFU coordinator error type.
///
/// Maps to signaling error codes:
/// - `InvalidRequest`: `BAD_REQUEST` (1)
/// - `Unknown*`, `RoomNotFound`: `NOT_FOUND` (4)
/// - `DuplicatePeer`, `AlreadyJoined`: `CONFLICT` (5)
/// - `EngineUnavailable`, `ResourceExhausted`, `Internal`: `INTERNAL_ERROR` (6)
/// - Capacity, draining and closed-room rejections: `CAPACITY_EXCEEDED` (7)
/// - `Negotiation`: `NEGOTIATION_FAILED` (8)
#[derive(Debug, Error)]
pub enum SfuError {
    /// Malformed or unknown signaling request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Peer is not a member of the room (or the connection never joined one).
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Transport is not owned by the requesting peer.
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    /// Producer is not owned by the requesting peer.
    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    /// Consumer is not owned by the requesting peer.
    #[error("Unknown consumer: {0}")]
    UnknownConsumer(String),

    /// Room is not present in the registry.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// A peer with the same ID is already in the room.
    #[error("Duplicate peer: {0}")]
    DuplicatePeer(String),

    /// The connection is already a member of a room.
    #[error("Connection already joined room {0}")]
    AlreadyJoined(String),

    /// The media engine rejected connect/produce/consume parameters.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The room has been closed and is being evicted from the registry.
    #[error("Room closed: {0}")]
    RoomClosed(String),

    /// The room is at its peer limit.
    #[error("Room at capacity: {0}")]
    RoomCapacityExceeded(String),

    /// This instance is at its room limit.
    #[error("SFU at capacity")]
    CapacityExceeded,

    /// This instance is shutting down.
    #[error("SFU is draining")]
    Draining,

    /// The media worker died. Not recoverable in-process.
    #[error("Media engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The media engine ran out of a finite resource (e.g. RTC ports).
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Internal error (actor channel failures and similar).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the signaling error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            SfuError::InvalidRequest(_) => 1, // BAD_REQUEST
            SfuError::UnknownPeer(_)
            | SfuError::UnknownTransport(_)
            | SfuError::UnknownProducer(_)
            | SfuError::UnknownConsumer(_)
            | SfuError::RoomNotFound(_) => 4, // NOT_FOUND
            SfuError::DuplicatePeer(_) | SfuError::AlreadyJoined(_) => 5, // CONFLICT
            SfuError::EngineUnavailable(_)
            | SfuError::ResourceExhausted(_)
            | SfuError::Internal(_) => 6, // INTERNAL_ERROR
            SfuError::RoomClosed(_)
            | SfuError::RoomCapacityExceeded(_)
            | SfuError::CapacityExceeded
            | SfuError::Draining => 7, // CAPACITY_EXCEEDED
            SfuError::Negotiation(_) => 8,         // NEGOTIATION_FAILED
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::InvalidRequest(msg) => msg.clone(),
            SfuError::UnknownPeer(_) => "Not a member of this room".to_string(),
            SfuError::UnknownTransport(_) => "Transport not found".to_string(),
            SfuError::UnknownProducer(_) => "Producer not found".to_string(),
            SfuError::UnknownConsumer(_) => "Consumer not found".to_string(),
            SfuError::RoomNotFound(_) => "Room not found".to_string(),
            SfuError::DuplicatePeer(_) => "Peer already in room".to_string(),
            SfuError::AlreadyJoined(_) => "Connection already joined a room".to_string(),
            SfuError::Negotiation(_) => "Media negotiation failed".to_string(),
            SfuError::RoomClosed(_) => "Room is closing, please retry".to_string(),
            SfuError::RoomCapacityExceeded(_) => "Room is full".to_string(),
            SfuError::CapacityExceeded => "Server is at capacity, please try again".to_string(),
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::EngineUnavailable(_)
            | SfuError::ResourceExhausted(_)
            | SfuError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Whether this error means the process must exit and be restarted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, SfuError::EngineUnavailable(_))
    }
}
