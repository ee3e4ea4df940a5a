//! Study Room SFU Service Library
//!
//! Coordinator for a selective forwarding unit serving small study-room
//! calls:
//!
//! - Room and peer bookkeeping for every active call
//! - Fan-out of each new media producer to every other participant
//! - WebSocket signaling for joins, transport negotiation and media setup
//! - Supervision of the process-wide media engine
//!
//! # Architecture
//!
//! ```text
//! MediaEngineBootstrap (worker + shared routing context)
//! RoomRegistryActor (singleton per SFU instance)
//! └── RoomActor (one per active room)
//!     └── peers → transports / producers / consumers
//! WebSocket connection
//! └── SignalingGateway (one per connection, at most one room)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Actor per room**: every room mutation is serialized through one mailbox
//! - **Self-removal with re-validation**: a room is evicted only after it
//!   confirms, inside its own sequence, that it is still empty
//! - **Exactly-once consumers**: each peer indexes the producers it consumes
//! - **Engine death is fatal**: the process exits and is restarted
//!
//! # Modules
//!
//! - [`actors`] - Room registry and room actors
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media engine capability and bootstrap
//! - [`errors`] - Error types with signaling error codes
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`signaling`] - Wire protocol, gateway and WebSocket transport

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod signaling;
