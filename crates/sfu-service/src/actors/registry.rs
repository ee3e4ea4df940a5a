//! `RoomRegistryActor` - singleton owner of the room table.
//!
//! The `RoomRegistryActor` is the top-level actor of the SFU:
//!
//! - Singleton per SFU instance
//! - Maps `room_id` to at most one live `RoomActor`
//! - Creates rooms lazily on first join
//! - Evicts a room only after the room itself confirms it is empty
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors room actor health (panic detection via `JoinHandle`)
//!
//! # Room eviction
//!
//! A room that loses its last peer emits `RoomEmptied`. The registry ignores
//! the event if the table entry has since been replaced by a newer instance,
//! otherwise it marks the entry closing and asks the room `CloseIfEmpty` from
//! a spawned task, so a busy room never stalls lookups for other rooms. The
//! answer comes back as `RoomCloseChecked`. Only a `true` answer evicts the
//! entry; a room that gained a peer in the meantime stays.
//!
//! Lookups for a room whose close check is in flight are parked and replayed
//! once the answer arrives.

use crate::engine::RoutingContext;
use crate::errors::SfuError;

use super::messages::{RegistryEvent, RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomContext};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long an evicted room gets to close its engine resources.
const ROOM_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for each room.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity limits applied by the registry and its rooms.
#[derive(Debug, Clone, Copy)]
pub struct RegistryLimits {
    pub max_rooms: usize,
    pub max_peers_per_room: usize,
}

/// Handle to the `RoomRegistryActor`.
///
/// Cloned into every signaling connection. All methods are async and return
/// results via oneshot channels.
#[derive(Clone)]
pub struct RoomRegistryActorHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryActorHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately. Every room shares
    /// `routing`.
    #[must_use]
    pub fn new(
        sfu_id: String,
        routing: Arc<dyn RoutingContext>,
        limits: RegistryLimits,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor::new(
            sfu_id,
            receiver,
            cancel_token.clone(),
            routing,
            limits,
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Return the live room for `room_id`, creating it if needed.
    pub async fn get_or_create(&self, room_id: String) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreate {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Look up a room. Fails with `RoomNotFound` if it does not exist.
    pub async fn get(&self, room_id: String) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Get {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting rooms, close every room, then stop the registry.
    ///
    /// Returns once all rooms have finished (or timed out).
    pub async fn shutdown(&self) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for tasks that must stop with the registry.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    created_at: DateTime<Utc>,
    /// A close check is in flight for this instance.
    closing: bool,
    /// Lookups that arrived during the close check.
    parked: Vec<RegistryMessage>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    sfu_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Room events (sender is cloned into every room).
    events: mpsc::UnboundedReceiver<RegistryEvent>,
    events_sender: mpsc::UnboundedSender<RegistryEvent>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    routing: Arc<dyn RoutingContext>,
    limits: RegistryLimits,
    rooms: HashMap<String, ManagedRoom>,
    /// Incremented for every room spawned.
    next_instance_id: u64,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    fn new(
        sfu_id: String,
        receiver: mpsc::Receiver<RegistryMessage>,
        cancel_token: CancellationToken,
        routing: Arc<dyn RoutingContext>,
        limits: RegistryLimits,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let mailbox = MailboxMonitor::new(ActorType::Registry, &sfu_id);
        let (events_sender, events) = mpsc::unbounded_channel();

        Self {
            sfu_id,
            receiver,
            events,
            events_sender,
            cancel_token,
            routing,
            limits,
            rooms: HashMap::new(),
            next_instance_id: 1,
            accepting_new: true,
            metrics,
            mailbox,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.registry", fields(sfu_id = %self.sfu_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            "RoomRegistryActor started"
        );

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                // Room events first: a request queued after an emptied-room
                // event finds the room closing
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            let stop = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if stop {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "sfu.actor.registry",
                                sfu_id = %self.sfu_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    /// Handle a single message. Returns `true` when the actor should stop.
    async fn handle_message(&mut self, message: RegistryMessage) -> bool {
        let Some(message) = self.park_if_closing(message) else {
            return false;
        };

        match message {
            RegistryMessage::GetOrCreate {
                room_id,
                respond_to,
            } => {
                let result = self.get_or_create(room_id).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::Get {
                room_id,
                respond_to,
            } => {
                let result = self
                    .rooms
                    .get(&room_id)
                    .map(|managed| managed.handle.clone())
                    .ok_or(SfuError::RoomNotFound(room_id));
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown { respond_to } => {
                self.graceful_shutdown().await;
                let _ = respond_to.send(Ok(()));
                self.cancel_token.cancel();
                return true;
            }
        }
        false
    }

    async fn handle_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::RoomEmptied {
                room_id,
                instance_id,
            } => self.begin_close_check(room_id, instance_id),
            RegistryEvent::RoomCloseChecked {
                room_id,
                instance_id,
                closed,
            } => self.finish_close_check(&room_id, instance_id, closed).await,
        }
    }

    /// Hold lookups for a room whose close check is in flight. Returns the
    /// message if it can be handled now.
    fn park_if_closing(&mut self, message: RegistryMessage) -> Option<RegistryMessage> {
        let room_id = match &message {
            RegistryMessage::GetOrCreate { room_id, .. } | RegistryMessage::Get { room_id, .. } => {
                room_id.clone()
            }
            RegistryMessage::GetStatus { .. } | RegistryMessage::Shutdown { .. } => {
                return Some(message);
            }
        };

        match self.rooms.get_mut(&room_id) {
            Some(managed) if managed.closing => {
                debug!(
                    target: "sfu.actor.registry",
                    sfu_id = %self.sfu_id,
                    room_id = %room_id,
                    "Lookup parked until close check completes"
                );
                managed.parked.push(message);
                None
            }
            _ => Some(message),
        }
    }

    async fn get_or_create(&mut self, room_id: String) -> Result<RoomActorHandle, SfuError> {
        if !self.accepting_new {
            return Err(SfuError::Draining);
        }

        if let Some(managed) = self.rooms.get(&room_id) {
            if !managed.handle.is_cancelled() {
                return Ok(managed.handle.clone());
            }
            debug!(
                target: "sfu.actor.registry",
                sfu_id = %self.sfu_id,
                room_id = %room_id,
                "Replacing cancelled room actor"
            );
            self.evict(&room_id);
        }

        if self.rooms.len() >= self.limits.max_rooms {
            warn!(
                target: "sfu.actor.registry",
                sfu_id = %self.sfu_id,
                max_rooms = self.limits.max_rooms,
                "Room limit reached, refusing new room"
            );
            return Err(SfuError::CapacityExceeded);
        }

        let instance_id = self.next_instance_id;
        self.next_instance_id += 1;

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            instance_id,
            self.cancel_token.child_token(),
            RoomContext {
                routing: Arc::clone(&self.routing),
                events: self.events_sender.clone(),
                metrics: Arc::clone(&self.metrics),
                max_peers: self.limits.max_peers_per_room,
            },
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                created_at: Utc::now(),
                closing: false,
                parked: Vec::new(),
            },
        );
        self.metrics.room_created();

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_id = %room_id,
            instance_id,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    /// Ask `room_id` to close if it is still `instance_id` and empty.
    ///
    /// The question runs on its own task; the room may be in the middle of
    /// an engine call.
    fn begin_close_check(&mut self, room_id: String, instance_id: u64) {
        let Some(managed) = self.rooms.get_mut(&room_id) else {
            return;
        };
        if managed.handle.instance_id() != instance_id {
            debug!(
                target: "sfu.actor.registry",
                sfu_id = %self.sfu_id,
                room_id = %room_id,
                instance_id,
                "Stale room-emptied event ignored"
            );
            return;
        }
        if managed.closing {
            return;
        }
        managed.closing = true;

        let handle = managed.handle.clone();
        let events = self.events_sender.clone();
        let sfu_id = self.sfu_id.clone();
        tokio::spawn(async move {
            let closed = match handle.close_if_empty().await {
                Ok(closed) => closed,
                Err(e) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_id = %room_id,
                        error = %e,
                        "Room did not answer close check, evicting"
                    );
                    true
                }
            };
            let _ = events.send(RegistryEvent::RoomCloseChecked {
                room_id,
                instance_id,
                closed,
            });
        });
    }

    /// Apply a close-check answer, then replay the lookups it held up.
    async fn finish_close_check(&mut self, room_id: &str, instance_id: u64, closed: bool) {
        let parked = match self.rooms.get_mut(room_id) {
            Some(managed) if managed.handle.instance_id() == instance_id => {
                managed.closing = false;
                std::mem::take(&mut managed.parked)
            }
            _ => return,
        };

        if closed {
            self.evict(room_id);
        } else {
            debug!(
                target: "sfu.actor.registry",
                sfu_id = %self.sfu_id,
                room_id = %room_id,
                "Room gained a peer before eviction, kept"
            );
        }

        for message in parked {
            self.handle_message(message).await;
        }
    }

    /// Remove the entry, cancel the room, and reap its task in the background.
    fn evict(&mut self, room_id: &str) {
        let Some(managed) = self.rooms.remove(room_id) else {
            return;
        };
        managed.handle.cancel();
        self.metrics.room_removed();

        let lifetime_secs = (Utc::now() - managed.created_at).num_seconds();
        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_id = %room_id,
            lifetime_secs,
            total_rooms = self.rooms.len(),
            "Room actor removed"
        );

        // Don't block the message loop on engine cleanup
        let room_id = room_id.to_string();
        let sfu_id = self.sfu_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_CLEANUP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_id = %room_id,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_id = %room_id,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            peer_count: self.metrics.peer_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    /// Stop accepting rooms and wait for every room to close.
    async fn graceful_shutdown(&mut self) {
        self.accepting_new = false;
        if self.rooms.is_empty() {
            return;
        }

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            refuse_parked(managed.parked);
            match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            "Graceful shutdown complete"
        );
    }

    /// Evict rooms whose actor task ended without being removed.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            // A closing room stops on its own; the close check evicts it
            .filter(|(_, managed)| !managed.closing && managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            self.metrics.room_removed();

            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_id = %room_id,
                        "Room actor exited without eviction"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sfu.actor.registry",
                            sfu_id = %self.sfu_id,
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked, room dropped"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
        }
    }
}

/// Answer lookups parked behind a close check that will never complete.
fn refuse_parked(parked: Vec<RegistryMessage>) {
    for message in parked {
        match message {
            RegistryMessage::GetOrCreate { respond_to, .. } | RegistryMessage::Get { respond_to, .. } => {
                let _ = respond_to.send(Err(SfuError::Draining));
            }
            RegistryMessage::GetStatus { .. } | RegistryMessage::Shutdown { .. } => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::local::{LocalWorker, WorkerSettings};
    use crate::engine::{default_media_codecs, MediaWorker};
    use crate::signaling::{Notification, Notifier};
    use std::collections::HashSet;

    #[derive(Debug)]
    struct Discard;

    impl Notifier for Discard {
        fn notify(&self, _notification: Notification) -> Result<(), SfuError> {
            Ok(())
        }
    }

    async fn registry(max_rooms: usize) -> (RoomRegistryActorHandle, LocalWorker) {
        let worker = LocalWorker::spawn(WorkerSettings {
            rtc_min_port: 42000,
            rtc_max_port: 42100,
            listen_ip: "127.0.0.1".parse().unwrap(),
            announced_ip: None,
            log_level: "warn".to_string(),
        })
        .unwrap();
        let routing = worker.create_router(default_media_codecs()).await.unwrap();
        let handle = RoomRegistryActorHandle::new(
            "sfu-test".to_string(),
            routing,
            RegistryLimits {
                max_rooms,
                max_peers_per_room: 10,
            },
            ActorMetrics::new(),
        );
        (handle, worker)
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_instance() {
        let (registry, _worker) = registry(10).await;

        let first = registry.get_or_create("r1".to_string()).await.unwrap();
        let second = registry.get_or_create("r1".to_string()).await.unwrap();
        assert_eq!(first.instance_id(), second.instance_id());

        let other = registry.get_or_create("r2".to_string()).await.unwrap();
        assert_ne!(first.instance_id(), other.instance_id());

        let status = registry.get_status().await.unwrap();
        assert_eq!(status.room_count, 2);
        assert!(!status.is_draining);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_single_instance() {
        let (registry, _worker) = registry(10).await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.get_or_create("shared".to_string()).await.unwrap().instance_id()
            }));
        }
        let mut ids = HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap());
        }
        assert_eq!(ids.len(), 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_get_unknown_room() {
        let (registry, _worker) = registry(10).await;
        let result = registry.get("missing".to_string()).await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));
        registry.cancel();
    }

    #[tokio::test]
    async fn test_room_evicted_when_last_peer_leaves() {
        let (registry, _worker) = registry(10).await;

        let room = registry.get_or_create("r1".to_string()).await.unwrap();
        room.add_peer("alice".to_string(), Arc::new(Discard), None)
            .await
            .unwrap();
        assert!(registry.get("r1".to_string()).await.is_ok());

        assert!(room.remove_peer("alice".to_string()).await.unwrap());
        let result = registry.get("r1".to_string()).await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));

        let fresh = registry.get_or_create("r1".to_string()).await.unwrap();
        assert_ne!(fresh.instance_id(), room.instance_id());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_peer_joining_before_close_check_keeps_room() {
        let (registry, _worker) = registry(10).await;

        let room = registry.get_or_create("r1".to_string()).await.unwrap();
        room.add_peer("alice".to_string(), Arc::new(Discard), None)
            .await
            .unwrap();

        // Both land in the room's mailbox ahead of the registry's close check
        let (removed, added) = tokio::join!(
            room.remove_peer("alice".to_string()),
            room.add_peer("bob".to_string(), Arc::new(Discard), None),
        );
        assert!(removed.unwrap());
        added.unwrap();

        let current = registry.get("r1".to_string()).await.unwrap();
        assert_eq!(current.instance_id(), room.instance_id());
        let state = current.get_state().await.unwrap();
        assert!(!state.closed);
        assert!(state.peer("bob").is_some());

        // The kept room still evicts normally later
        room.remove_peer("bob".to_string()).await.unwrap();
        let result = registry.get("r1".to_string()).await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_lookup_during_close_check_waits_for_eviction() {
        let (registry, _worker) = registry(10).await;

        let room = registry.get_or_create("r1".to_string()).await.unwrap();
        room.add_peer("alice".to_string(), Arc::new(Discard), None)
            .await
            .unwrap();
        room.remove_peer("alice".to_string()).await.unwrap();

        // Queued right behind the room-emptied event
        let fresh = registry.get_or_create("r1".to_string()).await.unwrap();
        assert_ne!(fresh.instance_id(), room.instance_id());
        assert!(room.is_cancelled());

        let status = registry.get_status().await.unwrap();
        assert_eq!(status.room_count, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_cancelled_room_is_replaced() {
        let (registry, _worker) = registry(10).await;

        let room = registry.get_or_create("r1".to_string()).await.unwrap();
        room.cancel();

        let replacement = registry.get_or_create("r1".to_string()).await.unwrap();
        assert_ne!(replacement.instance_id(), room.instance_id());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_room_limit() {
        let (registry, _worker) = registry(1).await;

        registry.get_or_create("r1".to_string()).await.unwrap();
        let result = registry.get_or_create("r2".to_string()).await;
        assert!(matches!(result, Err(SfuError::CapacityExceeded)));

        // Existing room is still reachable at the limit
        assert!(registry.get_or_create("r1".to_string()).await.is_ok());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_closes_rooms() {
        let (registry, _worker) = registry(10).await;

        let room = registry.get_or_create("r1".to_string()).await.unwrap();
        room.add_peer("alice".to_string(), Arc::new(Discard), None)
            .await
            .unwrap();

        registry.shutdown().await.unwrap();
        assert!(room.is_cancelled());
        assert!(registry.is_cancelled());

        let result = room
            .add_peer("bob".to_string(), Arc::new(Discard), None)
            .await;
        assert!(matches!(result, Err(SfuError::RoomClosed(_))));
    }

    #[tokio::test]
    async fn test_cancellation_token_propagates() {
        let (registry, _worker) = registry(10).await;

        let child = registry.child_token();
        assert!(!child.is_cancelled());

        registry.cancel();
        assert!(registry.is_cancelled());
        assert!(child.is_cancelled());
    }
}
