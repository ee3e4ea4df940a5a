//! The notifiable capability injected into each peer.
//!
//! Rooms push events through a [`Notifier`] and never see the underlying
//! connection. Delivery is non-blocking so a slow client cannot stall the
//! room actor.
//!
//! While a connection's own request is in flight its [`ChannelNotifier`]
//! parks notifications; they are queued right after that request's response.
//! A client therefore never hears about a consumer on a transport before the
//! response that created the transport.

use super::protocol::{Notification, ServerMessage};
use crate::errors::SfuError;

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

pub trait Notifier: Send + Sync + fmt::Debug {
    /// Queue a notification for delivery. Fails if the connection is gone.
    fn notify(&self, notification: Notification) -> Result<(), SfuError>;
}

/// Notifier backed by a connection's outbound frame queue.
#[derive(Debug)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<ServerMessage>,
    /// `Some` between `hold` and `deliver`.
    parked: Mutex<Option<Vec<Notification>>>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            sender,
            parked: Mutex::new(None),
        }
    }

    /// Park notifications until the next [`deliver`](Self::deliver).
    pub fn hold(&self) {
        let mut parked = self.parked();
        if parked.is_none() {
            *parked = Some(Vec::new());
        }
    }

    /// Queue `frames`, then every notification parked since `hold`, and go
    /// back to direct delivery.
    pub fn deliver(&self, frames: Vec<ServerMessage>) -> Result<(), SfuError> {
        // Held across the sends so nothing slips in between
        let mut parked = self.parked();
        let held = parked.take().unwrap_or_default();
        frames
            .into_iter()
            .chain(held.into_iter().map(ServerMessage::Notification))
            .try_for_each(|frame| self.send(frame))
    }

    fn send(&self, frame: ServerMessage) -> Result<(), SfuError> {
        self.sender
            .send(frame)
            .map_err(|_| SfuError::Internal("connection outbound queue closed".to_string()))
    }

    fn parked(&self) -> MutexGuard<'_, Option<Vec<Notification>>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) -> Result<(), SfuError> {
        let mut parked = self.parked();
        if let Some(held) = parked.as_mut() {
            held.push(notification);
            return Ok(());
        }
        self.send(ServerMessage::Notification(notification))
    }
}
