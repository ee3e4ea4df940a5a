//! Client signaling.
//!
//! `protocol` defines the JSON wire format, `notifier` the capability rooms
//! use to push events, `gateway` the per-connection request handling and
//! `websocket` the axum transport that carries it.

pub mod gateway;
pub mod notifier;
pub mod protocol;
pub mod websocket;

pub use gateway::SignalingGateway;
pub use notifier::{ChannelNotifier, Notifier};
pub use protocol::{ClientRequest, Notification, RequestEnvelope, ServerMessage};
pub use websocket::{signaling_router, SignalingState};
