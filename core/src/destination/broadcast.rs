//! Fan-out destination delivering every message to every subscriber.

use super::{
    DeliveryError, DeliveryReport, Destination, DestinationError, Message, SubscriberHandle,
    SubscriberId,
};
use parking_lot::RwLock;
use tracing::{debug, warn};

/// Destination that hands each published message to all current
/// subscribers.
///
/// Subscribe and unsubscribe take the write lock; publishes share the read
/// lock, so any number of sessions can fan out concurrently. Delivery into a
/// subscriber never blocks (see [`super::Subscriber::deliver`]).
#[derive(Debug, Default)]
pub struct Broadcast {
    subscribers: RwLock<Vec<SubscriberHandle>>,
}

impl Broadcast {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Destination for Broadcast {
    fn subscribe(&self, subscriber: SubscriberHandle) -> Result<(), DestinationError> {
        let mut subscribers = self.subscribers.write();
        let id = subscriber.id();
        if subscribers.iter().any(|s| s.id() == id) {
            return Err(DestinationError::AlreadySubscribed(id));
        }
        subscribers.push(subscriber);
        Ok(())
    }

    fn unsubscribe(&self, subscriber: SubscriberId) -> Result<(), DestinationError> {
        let mut subscribers = self.subscribers.write();
        match subscribers.iter().position(|s| s.id() == subscriber) {
            Some(index) => {
                // Subscriber order carries no meaning.
                subscribers.swap_remove(index);
                Ok(())
            }
            None => Err(DestinationError::NotSubscribed(subscriber)),
        }
    }

    fn publish(&self, message: &Message) -> DeliveryReport {
        let subscribers = self.subscribers.read();
        let mut report = DeliveryReport::default();

        for subscriber in subscribers.iter() {
            match subscriber.deliver(message) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::InboxFull) => {
                    warn!(
                        "Dropping message {} for subscriber {}: inbox full",
                        message.id,
                        subscriber.id()
                    );
                    report.dropped += 1;
                }
                Err(DeliveryError::InboxClosed) => {
                    debug!(
                        "Subscriber {} is shutting down, message {} not delivered",
                        subscriber.id(),
                        message.id
                    );
                    report.dropped += 1;
                }
            }
        }

        report
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{MessageId, Subscriber};
    use crate::protocol::{Command, Frame};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug)]
    struct RecordingSubscriber {
        id: SubscriberId,
        received: Mutex<Vec<MessageId>>,
        refuse: Option<DeliveryError>,
    }

    impl RecordingSubscriber {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: SubscriberId(id),
                received: Mutex::new(Vec::new()),
                refuse: None,
            })
        }

        fn refusing(id: u64, error: DeliveryError) -> Arc<Self> {
            Arc::new(Self {
                id: SubscriberId(id),
                received: Mutex::new(Vec::new()),
                refuse: Some(error),
            })
        }

        fn received(&self) -> Vec<MessageId> {
            self.received.lock().clone()
        }
    }

    impl Subscriber for RecordingSubscriber {
        fn id(&self) -> SubscriberId {
            self.id
        }

        fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
            if let Some(error) = &self.refuse {
                return Err(error.clone());
            }
            self.received.lock().push(message.id);
            Ok(())
        }
    }

    fn message(id: u64) -> Message {
        Message::new(
            MessageId(id),
            Frame::new(Command::Send)
                .header("destination", "/topic/test")
                .with_body("hi"),
        )
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let broadcast = Broadcast::new();
        let s1 = RecordingSubscriber::new(1);
        let s2 = RecordingSubscriber::new(2);

        broadcast.subscribe(s1.clone()).unwrap();
        broadcast.subscribe(s2.clone()).unwrap();
        assert!(matches!(
            broadcast.subscribe(s1.clone()),
            Err(DestinationError::AlreadySubscribed(SubscriberId(1)))
        ));
        assert_eq!(broadcast.subscriber_count(), 2);

        broadcast.unsubscribe(s1.id()).unwrap();
        broadcast.unsubscribe(s2.id()).unwrap();
        assert!(matches!(
            broadcast.unsubscribe(s1.id()),
            Err(DestinationError::NotSubscribed(SubscriberId(1)))
        ));
        assert!(broadcast.unsubscribe(s2.id()).is_err());
        assert_eq!(broadcast.subscriber_count(), 0);
    }

    #[test]
    fn test_duplicate_subscribe_does_not_duplicate_delivery() {
        let broadcast = Broadcast::new();
        let s1 = RecordingSubscriber::new(1);

        broadcast.subscribe(s1.clone()).unwrap();
        assert!(broadcast.subscribe(s1.clone()).is_err());

        let report = broadcast.publish(&message(7));
        assert_eq!(report.delivered, 1);
        assert_eq!(s1.received(), vec![MessageId(7)]);
    }

    #[test]
    fn test_unsubscribe_unknown_has_no_side_effects() {
        let broadcast = Broadcast::new();
        let s1 = RecordingSubscriber::new(1);
        broadcast.subscribe(s1.clone()).unwrap();

        assert!(broadcast.unsubscribe(SubscriberId(99)).is_err());
        assert_eq!(broadcast.subscriber_count(), 1);

        broadcast.publish(&message(1));
        assert_eq!(s1.received(), vec![MessageId(1)]);
    }

    #[test]
    fn test_publish_fans_out_to_remaining_subscribers() {
        let broadcast = Broadcast::new();
        let s1 = RecordingSubscriber::new(1);
        let s2 = RecordingSubscriber::new(2);
        broadcast.subscribe(s1.clone()).unwrap();
        broadcast.subscribe(s2.clone()).unwrap();

        let report = broadcast.publish(&message(1));
        assert_eq!(report, DeliveryReport { delivered: 2, dropped: 0 });
        assert_eq!(s1.received(), vec![MessageId(1)]);
        assert_eq!(s2.received(), vec![MessageId(1)]);

        broadcast.unsubscribe(s1.id()).unwrap();
        broadcast.publish(&message(2));
        assert_eq!(s1.received(), vec![MessageId(1)]);
        assert_eq!(s2.received(), vec![MessageId(1), MessageId(2)]);
    }

    #[test]
    fn test_failed_delivery_does_not_fail_publish() {
        let broadcast = Broadcast::new();
        let full = RecordingSubscriber::refusing(1, DeliveryError::InboxFull);
        let closed = RecordingSubscriber::refusing(2, DeliveryError::InboxClosed);
        let healthy = RecordingSubscriber::new(3);
        broadcast.subscribe(full).unwrap();
        broadcast.subscribe(closed).unwrap();
        broadcast.subscribe(healthy.clone()).unwrap();

        let report = broadcast.publish(&message(5));
        assert_eq!(report, DeliveryReport { delivered: 1, dropped: 2 });
        assert_eq!(healthy.received(), vec![MessageId(5)]);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcast = Broadcast::new();
        assert_eq!(broadcast.publish(&message(1)), DeliveryReport::default());
    }
}
