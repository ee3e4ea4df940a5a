//! Actor hierarchy for room and peer state.
//!
//! ```text
//! RoomRegistryActor (singleton per SFU)
//! └── RoomActor (one per active room)
//!     └── peers, each owning transports / producers / consumers
//! ```
//!
//! Every room mutation is a message on the room's mailbox, so operations on
//! one room never interleave while different rooms run in parallel.
//! Cancellation flows down through child `CancellationToken`s.

pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

pub use messages::{
    ConsumerSummary, JoinResult, PeerState, PeerSummary, ProducerSummary, RegistryEvent,
    RegistryStatus, RoomState, TransportDescriptor, TransportSummary,
};
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
pub use registry::{RegistryLimits, RoomRegistryActorHandle};
pub use room::{RoomActor, RoomActorHandle, RoomContext};
