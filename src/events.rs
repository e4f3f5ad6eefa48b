//! Typed publish/subscribe channels.
//!
//! Every component owns its own [`EventChannel`]; there are no global listeners.
//! Subscribers hold a [`Subscription`] and release it by dropping it or calling
//! [`Subscription::unsubscribe`].

use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast channel for one component's notifications.
#[derive(Debug)]
pub struct EventChannel<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventChannel<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers that will see it.
    pub fn publish(&self, event: E) -> usize {
        // No receivers is the normal case for unobserved components.
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// A live subscription to an [`EventChannel`].
#[derive(Debug)]
pub struct Subscription<E: Clone> {
    receiver: broadcast::Receiver<E>,
}

impl<E: Clone> Subscription<E> {
    /// Wait for the next event. `None` once the channel owner is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Subscriber lagged");
                    continue;
                }
            }
        }
    }

    /// Non-blocking receive. `None` when nothing is buffered.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// Release the subscription.
    pub fn unsubscribe(self) {}
}
