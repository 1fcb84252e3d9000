//! # Stompbox Destination Registry
//!
//! Destinations are named targets that SEND frames are published to and that
//! sessions subscribe to. The [`DestinationRegistry`] is the single
//! process-wide table mapping destination ids to destination objects; it is
//! owned by the broker and shared with every session through an `Arc`.
//!
//! ## Contracts
//!
//! - **Registration**: an id is registered at most once; a duplicate
//!   registration fails and leaves the existing destination in place
//! - **Subscribers**: a [`Subscriber`] is identified by its [`SubscriberId`];
//!   a destination holds a given subscriber at most once
//! - **Publishing**: the registry wraps the frame in a [`Message`] carrying
//!   the next broker-wide [`MessageId`] and hands it to the destination;
//!   delivery failures of individual subscribers never surface to the
//!   publisher
//!
//! ## Thread Safety
//!
//! The destination table is a `DashMap`, so lookups from concurrent sessions
//! only contend on a shard read lock and registration is an atomic
//! check-and-insert. Fan-out happens after the table lock is released, under
//! the destination's own reader lock (see [`Broadcast`]).

pub mod broadcast;
pub mod message;

pub use broadcast::Broadcast;
pub use message::{Message, MessageId};

use crate::metrics::BrokerMetrics;
use crate::protocol::Frame;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Opaque destination key, e.g. `/topic/prices`.
pub type DestinationId = String;

/// Identity of a subscriber handle. Two handles are the same subscriber iff
/// their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestinationError {
    #[error("destination '{0}' already exists")]
    AlreadyExists(DestinationId),

    #[error("destination '{0}' does not exist")]
    NotFound(DestinationId),

    #[error("subscriber {0} is already subscribed")]
    AlreadySubscribed(SubscriberId),

    #[error("subscriber {0} is not subscribed")]
    NotSubscribed(SubscriberId),
}

/// Why a single delivery did not reach its subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("subscriber inbox is full")]
    InboxFull,

    #[error("subscriber inbox is closed")]
    InboxClosed,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Receiving end of a subscription.
pub trait Subscriber: Send + Sync + fmt::Debug {
    fn id(&self) -> SubscriberId;

    /// Hand one message over. Must not block; a subscriber that cannot take
    /// the message right now reports [`DeliveryError::InboxFull`].
    fn deliver(&self, message: &Message) -> Result<(), DeliveryError>;
}

pub type SubscriberHandle = Arc<dyn Subscriber>;

/// A named delivery target.
pub trait Destination: Send + Sync + fmt::Debug {
    fn subscribe(&self, subscriber: SubscriberHandle) -> Result<(), DestinationError>;

    fn unsubscribe(&self, subscriber: SubscriberId) -> Result<(), DestinationError>;

    /// Deliver to every current subscriber. Never fails as a whole.
    fn publish(&self, message: &Message) -> DeliveryReport;

    fn subscriber_count(&self) -> usize;
}

/// Process-wide destination table.
#[derive(Debug)]
pub struct DestinationRegistry {
    destinations: DashMap<DestinationId, Arc<dyn Destination>>,
    next_message_id: AtomicU64,
    next_subscriber_id: AtomicU64,
    /// Create a [`Broadcast`] on first use of an unknown id.
    auto_create: bool,
    metrics: Arc<BrokerMetrics>,
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(BrokerMetrics::new()))
    }

    pub fn with_metrics(metrics: Arc<BrokerMetrics>) -> Self {
        Self {
            destinations: DashMap::new(),
            next_message_id: AtomicU64::new(0),
            next_subscriber_id: AtomicU64::new(0),
            auto_create: false,
            metrics,
        }
    }

    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    pub fn auto_create(&self) -> bool {
        self.auto_create
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Register `destination` under `id`. Fails without touching the table if
    /// the id is taken.
    pub fn register(
        &self,
        id: impl Into<DestinationId>,
        destination: Arc<dyn Destination>,
    ) -> Result<(), DestinationError> {
        match self.destinations.entry(id.into()) {
            Entry::Occupied(entry) => Err(DestinationError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                info!("Registered destination '{}'", entry.key());
                entry.insert(destination);
                Ok(())
            }
        }
    }

    /// Register a new [`Broadcast`] under `id`.
    pub fn register_broadcast(&self, id: impl Into<DestinationId>) -> Result<(), DestinationError> {
        self.register(id, Arc::new(Broadcast::new()))
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Destination>> {
        self.destinations.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.destinations.contains_key(id)
    }

    pub fn destination_ids(&self) -> Vec<DestinationId> {
        let mut ids: Vec<DestinationId> = self
            .destinations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Allocate an identity for a new subscriber handle.
    pub fn next_subscriber_id(&self) -> SubscriberId {
        SubscriberId(self.next_subscriber_id.fetch_add(1, Ordering::Relaxed))
    }

    fn next_message_id(&self) -> MessageId {
        MessageId(self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Look up `id`, creating a broadcast for it when auto-creation is on.
    fn resolve(&self, id: &str) -> Result<Arc<dyn Destination>, DestinationError> {
        if let Some(destination) = self.get(id) {
            return Ok(destination);
        }
        if !self.auto_create {
            return Err(DestinationError::NotFound(id.to_string()));
        }

        let destination = self
            .destinations
            .entry(id.to_string())
            .or_insert_with(|| {
                info!("Auto-created broadcast destination '{}'", id);
                let broadcast: Arc<dyn Destination> = Arc::new(Broadcast::new());
                broadcast
            })
            .value()
            .clone();
        Ok(destination)
    }

    pub fn subscribe(&self, id: &str, subscriber: SubscriberHandle) -> Result<(), DestinationError> {
        let subscriber_id = subscriber.id();
        self.resolve(id)?.subscribe(subscriber)?;
        debug!("{} subscribed to '{}'", subscriber_id, id);
        Ok(())
    }

    /// Unknown ids are reported as [`DestinationError::NotFound`] and never
    /// auto-created.
    pub fn unsubscribe(&self, id: &str, subscriber: SubscriberId) -> Result<(), DestinationError> {
        let destination = self
            .get(id)
            .ok_or_else(|| DestinationError::NotFound(id.to_string()))?;
        destination.unsubscribe(subscriber)?;
        debug!("{} unsubscribed from '{}'", subscriber, id);
        Ok(())
    }

    /// Wrap `frame` as the next [`Message`] and fan it out.
    pub fn publish(&self, id: &str, frame: Frame) -> Result<DeliveryReport, DestinationError> {
        let destination = self.resolve(id)?;
        let message = Message::new(self.next_message_id(), frame);
        let report = destination.publish(&message);

        self.metrics.message_published();
        self.metrics.messages_delivered(report.delivered as u64);
        self.metrics.messages_dropped(report.dropped as u64);
        debug!(
            "Published message {} to '{}': delivered={}, dropped={}",
            message.id, id, report.delivered, report.dropped
        );
        Ok(report)
    }
}

impl Default for DestinationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
