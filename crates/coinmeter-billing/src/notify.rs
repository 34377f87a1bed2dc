//! Notification hand-off
//!
//! Publishing never blocks billing. Delivery is owned by whoever drains the
//! channel.

use coinmeter_common::{CoinmeterError, Notification, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Sink for user-facing notification events
pub trait Notifier: Send + Sync {
    /// Hand off a notification without waiting on delivery
    fn publish(&self, notification: Notification) -> Result<()>;
}

/// Bounded channel notifier
///
/// Events are dropped with a warning when the receiver falls behind.
#[derive(Clone)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn publish(&self, notification: Notification) -> Result<()> {
        let user_id = notification.user_id;
        match self.sender.try_send(notification) {
            Ok(()) => {
                debug!(user_id = %user_id, "Notification queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(user_id = %user_id, "Notification channel full, dropping event");
                Err(CoinmeterError::Notification("channel full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(CoinmeterError::Notification("channel closed".into()))
            }
        }
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn publish(&self, _notification: Notification) -> Result<()> {
        Ok(())
    }
}
