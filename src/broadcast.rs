//! Fan-out of core messages to live subscribers.
//!
//! The [`Broadcaster`] holds every current subscriber behind one mutex.
//! Publishing copies the set under the lock and delivers outside it, so a slow
//! or broken subscriber never holds up the others or the producer. A
//! subscriber whose delivery fails is evicted on the spot.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use poolwatch_types::Message;
use thiserror::Error;
use tokio::sync::mpsc;

/// Why a message could not be handed to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("subscriber is gone")]
    Closed,

    #[error("subscriber is not keeping up")]
    Full,
}

/// A sink for broadcast messages.
///
/// `deliver` must not block. Returning an error removes the subscriber.
pub trait Subscriber: Send + Sync {
    fn deliver(&self, message: &Arc<Message>) -> Result<(), DeliveryError>;
}

/// Subscriber backed by a bounded channel.
impl Subscriber for mpsc::Sender<Arc<Message>> {
    fn deliver(&self, message: &Arc<Message>) -> Result<(), DeliveryError> {
        self.try_send(Arc::clone(message)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Subscriber backed by an unbounded channel.
impl Subscriber for mpsc::UnboundedSender<Arc<Message>> {
    fn deliver(&self, message: &Arc<Message>) -> Result<(), DeliveryError> {
        self.send(Arc::clone(message))
            .map_err(|_| DeliveryError::Closed)
    }
}

/// Identifies one registration with a [`Broadcaster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receiving end of a channel subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<Message>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next message. `None` once the subscription was removed
    /// and every buffered message has been read.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Message>> {
        self.receiver.try_recv().ok()
    }
}

/// Thread-safe set of live subscribers.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. It receives every message published from now on.
    pub fn register(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().insert(id, subscriber);
        tracing::debug!(subscriber = %id, "Subscriber registered");
        id
    }

    /// Subscribe through a channel holding up to `buffer` undelivered
    /// messages. A subscriber that lets the buffer fill up is evicted.
    pub fn subscribe(&self, buffer: usize) -> Subscription {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let id = self.register(Arc::new(sender));
        Subscription { id, receiver }
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.lock().remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = %id, "Subscriber removed");
        }
        removed
    }

    /// Deliver `message` to every current subscriber.
    ///
    /// Returns the number of successful deliveries. Subscribers that fail are
    /// evicted.
    pub fn publish(&self, message: Message) -> usize {
        let message = Arc::new(message);
        let targets: Vec<(SubscriberId, Arc<dyn Subscriber>)> = self
            .subscribers
            .lock()
            .iter()
            .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
            .collect();

        let mut delivered = 0;
        for (id, subscriber) in targets {
            match subscriber.deliver(&message) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    if self.subscribers.lock().remove(&id).is_some() {
                        tracing::debug!(
                            subscriber = %id,
                            core = %message.name,
                            error = %e,
                            "Evicted subscriber after failed delivery"
                        );
                    }
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use poolwatch_types::{EventBatch, MessageKind};

    fn events(name: &str) -> Message {
        Message::events(name, EventBatch::new(vec!["started".into()]))
    }

    /// Fails every delivery and counts the attempts.
    #[derive(Default)]
    struct Broken {
        attempts: AtomicUsize,
    }

    impl Subscriber for Broken {
        fn deliver(&self, _message: &Arc<Message>) -> Result<(), DeliveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::Closed)
        }
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let broadcaster = Broadcaster::new();
        let mut a = broadcaster.subscribe(4);
        let mut b = broadcaster.subscribe(4);

        assert_eq!(broadcaster.publish(events("alpha")), 2);

        let got_a = a.try_recv().unwrap();
        let got_b = b.try_recv().unwrap();
        assert_eq!(got_a.name, "alpha");
        assert_eq!(got_a.kind(), MessageKind::Events);
        assert!(Arc::ptr_eq(&got_a, &got_b));
    }

    #[test]
    fn test_failing_subscriber_is_evicted_once() {
        let broadcaster = Broadcaster::new();
        let broken = Arc::new(Broken::default());
        broadcaster.register(broken.clone());
        let mut healthy = broadcaster.subscribe(4);

        assert_eq!(broadcaster.publish(events("alpha")), 1);
        assert_eq!(broadcaster.subscriber_count(), 1);

        assert_eq!(broadcaster.publish(events("alpha")), 1);
        assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);

        assert!(healthy.try_recv().is_some());
        assert!(healthy.try_recv().is_some());
    }

    #[test]
    fn test_full_subscriber_is_evicted() {
        let broadcaster = Broadcaster::new();
        let mut slow = broadcaster.subscribe(1);

        assert_eq!(broadcaster.publish(events("alpha")), 1);
        assert_eq!(broadcaster.publish(events("alpha")), 0);
        assert_eq!(broadcaster.subscriber_count(), 0);

        // The buffered message is still readable, then the channel ends.
        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_none());
    }

    #[test]
    fn test_dropped_subscription_is_evicted() {
        let broadcaster = Broadcaster::new();
        let sub = broadcaster.subscribe(4);
        drop(sub);

        assert_eq!(broadcaster.publish(events("alpha")), 0);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let broadcaster = Broadcaster::new();
        let sub = broadcaster.subscribe(4);

        assert!(broadcaster.unsubscribe(sub.id()));
        assert!(!broadcaster.unsubscribe(sub.id()));
        assert_eq!(broadcaster.publish(events("alpha")), 0);
    }

    #[test]
    fn test_unbounded_sender_subscriber() {
        let broadcaster = Broadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broadcaster.register(Arc::new(tx));

        broadcaster.publish(events("beta"));
        assert_eq!(rx.try_recv().unwrap().name, "beta");

        drop(rx);
        assert_eq!(broadcaster.publish(events("beta")), 0);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_ends_after_unsubscribe() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe(4);
        broadcaster.publish(events("alpha"));
        broadcaster.unsubscribe(sub.id());

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
