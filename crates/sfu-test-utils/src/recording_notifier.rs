//! Recording notifier for room tests.
//!
//! Stands in for a client connection: every notification a room pushes is
//! kept in order so tests can assert exactly what a peer was told.

use sfu_service::errors::SfuError;
use sfu_service::signaling::{Notification, Notifier};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A `new-consumer` event, flattened for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConsumerEvent {
    /// Producing peer.
    pub peer_id: String,
    pub producer_id: String,
    pub consumer_id: String,
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
    disconnected: AtomicBool,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All notifications received so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<Notification> {
        self.lock().clone()
    }

    /// Drain the recorded notifications.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of recorded notifications with the given wire method name.
    #[must_use]
    pub fn count(&self, method: &str) -> usize {
        self.lock()
            .iter()
            .filter(|n| method_name(n) == method)
            .count()
    }

    #[must_use]
    pub fn peers_joined(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|n| match n {
                Notification::PeerJoined { peer_id } => Some(peer_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn peers_left(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|n| match n {
                Notification::PeerLeft { peer_id } => Some(peer_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn new_consumers(&self) -> Vec<NewConsumerEvent> {
        self.lock()
            .iter()
            .filter_map(|n| match n {
                Notification::NewConsumer {
                    peer_id,
                    producer_id,
                    consumer_id,
                    ..
                } => Some(NewConsumerEvent {
                    peer_id: peer_id.clone(),
                    producer_id: producer_id.clone(),
                    consumer_id: consumer_id.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Consumer ids from `consumer-closed` events.
    #[must_use]
    pub fn consumers_closed(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|n| match n {
                Notification::ConsumerClosed { consumer_id, .. } => Some(consumer_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Simulate a dead connection: later notifications fail.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) -> Result<(), SfuError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(SfuError::Internal("recording notifier disconnected".to_string()));
        }
        self.lock().push(notification);
        Ok(())
    }
}

/// Wire method name of a notification.
#[must_use]
pub fn method_name(notification: &Notification) -> &'static str {
    match notification {
        Notification::PeerJoined { .. } => "peer-joined",
        Notification::PeerLeft { .. } => "peer-left",
        Notification::NewConsumer { .. } => "new-consumer",
        Notification::ConsumerClosed { .. } => "consumer-closed",
    }
}
