//! Per-session subscriptions and the subscriber handle that feeds the inbox.

use crate::destination::{
    DeliveryError, DestinationId, Message, Subscriber, SubscriberId,
};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Acknowledgement mode requested by SUBSCRIBE's `ack` header.
///
/// Only tags outgoing MESSAGE frames; acknowledgements are not tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Whether MESSAGE frames for this mode carry an `ack` header.
    pub fn expects_ack(&self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local record of one open subscription, keyed by its client-chosen id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubscription {
    pub id: Arc<str>,
    pub destination: DestinationId,
    pub ack_mode: AckMode,
    pub subscriber: SubscriberId,
}

/// A message routed to one of the session's subscriptions.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: Arc<str>,
    pub ack_mode: AckMode,
    pub message: Message,
}

/// The handle a session registers with a destination.
///
/// Holds only the sending half of the session inbox, so a destination never
/// keeps a session alive. Once the session drops its inbox, deliveries fail
/// with [`DeliveryError::InboxClosed`].
#[derive(Debug)]
pub struct SessionSubscriber {
    id: SubscriberId,
    subscription: Arc<str>,
    ack_mode: AckMode,
    inbox: mpsc::Sender<Delivery>,
}

impl SessionSubscriber {
    pub fn new(
        id: SubscriberId,
        subscription: Arc<str>,
        ack_mode: AckMode,
        inbox: mpsc::Sender<Delivery>,
    ) -> Self {
        Self {
            id,
            subscription,
            ack_mode,
            inbox,
        }
    }
}

impl Subscriber for SessionSubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        let delivery = Delivery {
            subscription: Arc::clone(&self.subscription),
            ack_mode: self.ack_mode,
            message: message.clone(),
        };

        self.inbox.try_send(delivery).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::InboxFull,
            TrySendError::Closed(_) => DeliveryError::InboxClosed,
        })
    }
}
