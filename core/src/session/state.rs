//! The per-connection protocol state machine.
//!
//! [`SessionState::handle`] is the transition function: it takes one inbound
//! frame, updates the phase and the subscription table, talks to the
//! destination registry, and returns the frames to send back together with
//! whether the inbound loop should keep going. It never touches the
//! transport, so it can be driven directly in tests.

use super::subscription::{AckMode, ClientSubscription, Delivery, SessionSubscriber};
use crate::destination::{DestinationError, DestinationRegistry};
use crate::metrics::BrokerMetrics;
use crate::protocol::{headers, Command, Frame, ParseError, ValidationError, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for CONNECT or STOMP.
    Opened,
    Connected,
    /// The client sent DISCONNECT.
    Disconnected,
    /// A terminal ERROR was sent.
    Error,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Disconnected | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Opened => "opened",
            Phase::Connected => "connected",
            Phase::Disconnected => "disconnected",
            Phase::Error => "error",
        };
        f.write_str(name)
    }
}

/// Which ERROR frames end the session.
///
/// Failures before CONNECT succeeded, body rule violations and unparseable
/// input end the session under either policy.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Every ERROR ends the session; no RECEIPT is sent after an ERROR.
    #[default]
    Terminal,
    /// Errors after CONNECT are reported and the session carries on,
    /// still honouring the frame's `receipt` header.
    Lenient,
}

/// A client-visible protocol failure. The `Display` text becomes the body of
/// the ERROR frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("receipt not allowed during connect")]
    ReceiptDuringConnect,

    #[error("a version header is required")]
    MissingVersion,

    #[error("this server only supports standard version 1.2")]
    UnsupportedVersion(String),

    #[error("unknown/unallowed command")]
    NotConnected(Command),

    #[error("already connected")]
    AlreadyConnected,

    #[error("unknown command")]
    UnknownCommand(Command),

    #[error("missing required header '{0}'")]
    MissingHeader(&'static str),

    #[error("subscription id already exists")]
    DuplicateSubscription(String),

    #[error("no subscription with id '{0}'")]
    UnknownSubscription(String),

    #[error("invalid destination '{0}'")]
    InvalidDestination(String),

    #[error("invalid ack mode '{0}'")]
    InvalidAckMode(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error("failed to parse frame, good bye")]
    Unparseable,
}

impl ProtocolViolation {
    /// Whether this violation ends the session under `policy`.
    pub fn is_fatal(&self, policy: ErrorPolicy) -> bool {
        match self {
            ProtocolViolation::ReceiptDuringConnect
            | ProtocolViolation::MissingVersion
            | ProtocolViolation::UnsupportedVersion(_)
            | ProtocolViolation::NotConnected(_)
            | ProtocolViolation::Invalid(_)
            | ProtocolViolation::Unparseable => true,
            _ => policy == ErrorPolicy::Terminal,
        }
    }
}

/// Whether the inbound loop keeps reading after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Result of feeding one frame to the state machine.
#[derive(Debug)]
pub struct Transition {
    pub replies: Vec<Frame>,
    pub flow: Flow,
}

/// Protocol state of one connection.
#[derive(Debug)]
pub struct SessionState {
    connection_id: u64,
    phase: Phase,
    version: Option<&'static str>,
    policy: ErrorPolicy,
    registry: Arc<DestinationRegistry>,
    metrics: Arc<BrokerMetrics>,
    inbox: mpsc::Sender<Delivery>,
    subscriptions: HashMap<Arc<str>, ClientSubscription>,
}

impl SessionState {
    pub fn new(
        connection_id: u64,
        registry: Arc<DestinationRegistry>,
        inbox: mpsc::Sender<Delivery>,
        policy: ErrorPolicy,
    ) -> Self {
        let metrics = registry.metrics();
        Self {
            connection_id,
            phase: Phase::Opened,
            version: None,
            policy,
            registry,
            metrics,
            inbox,
            subscriptions: HashMap::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Negotiated protocol version, once connected.
    pub fn version(&self) -> Option<&'static str> {
        self.version
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &ClientSubscription> {
        self.subscriptions.values()
    }

    pub fn subscription(&self, id: &str) -> Option<&ClientSubscription> {
        self.subscriptions.get(id)
    }

    /// Process one inbound frame.
    pub fn handle(&mut self, frame: Frame) -> Transition {
        debug!(
            "conn {} cmd {} in phase {}",
            self.connection_id, frame.command, self.phase
        );

        let mut replies = Vec::new();
        match self.phase {
            Phase::Opened => match self.connect(&frame) {
                Ok(connected) => {
                    info!("conn {} connected", self.connection_id);
                    self.phase = Phase::Connected;
                    replies.push(connected);
                }
                Err(violation) => self.fail(violation, &mut replies),
            },
            Phase::Connected => {
                let result = frame
                    .validate()
                    .map_err(ProtocolViolation::from)
                    .and_then(|()| self.dispatch(&frame));

                let receipt_allowed = match result {
                    Ok(()) => true,
                    Err(violation) => {
                        let fatal = violation.is_fatal(self.policy);
                        self.fail(violation, &mut replies);
                        !fatal
                    }
                };

                if receipt_allowed {
                    if let Some(receipt) = frame.headers.get(headers::RECEIPT) {
                        replies.push(Frame::receipt(receipt));
                    }
                }
            }
            Phase::Disconnected | Phase::Error => {
                warn!(
                    "conn {} received {} after the session ended",
                    self.connection_id, frame.command
                );
            }
        }

        Transition {
            replies,
            flow: self.flow(),
        }
    }

    /// The frame source failed; answer with a final ERROR.
    pub fn parse_failed(&mut self, err: &ParseError) -> Transition {
        warn!("conn {} failed to parse frame: {}", self.connection_id, err);
        let mut replies = Vec::new();
        self.fail(ProtocolViolation::Unparseable, &mut replies);
        Transition {
            replies,
            flow: self.flow(),
        }
    }

    /// Unsubscribe every open subscription. Returns how many were removed.
    pub fn teardown(&mut self) -> usize {
        let mut removed = 0;
        for (id, subscription) in self.subscriptions.drain() {
            match self
                .registry
                .unsubscribe(&subscription.destination, subscription.subscriber)
            {
                Ok(()) => removed += 1,
                Err(e) => debug!(
                    "conn {} teardown of subscription {}: {}",
                    self.connection_id, id, e
                ),
            }
        }
        removed
    }

    fn flow(&self) -> Flow {
        if self.phase.is_terminal() {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn fail(&mut self, violation: ProtocolViolation, replies: &mut Vec<Frame>) {
        info!(
            "conn {} sending ERROR: {}",
            self.connection_id, violation
        );
        if violation.is_fatal(self.policy) {
            self.phase = Phase::Error;
        }
        self.metrics.error_sent();
        replies.push(Frame::error(&violation.to_string()));
    }

    fn connect(&mut self, frame: &Frame) -> Result<Frame, ProtocolViolation> {
        if !frame.command.is_handshake() {
            return Err(ProtocolViolation::NotConnected(frame.command.clone()));
        }
        frame.validate()?;
        if frame.headers.contains(headers::RECEIPT) {
            return Err(ProtocolViolation::ReceiptDuringConnect);
        }

        let accepted = frame
            .headers
            .get(headers::ACCEPT_VERSION)
            .ok_or(ProtocolViolation::MissingVersion)?;
        if !accepted.split(',').any(|v| v.trim() == PROTOCOL_VERSION) {
            return Err(ProtocolViolation::UnsupportedVersion(accepted.to_string()));
        }

        self.version = Some(PROTOCOL_VERSION);
        let mut connected = Frame::new(Command::Connected).header(headers::VERSION, PROTOCOL_VERSION);
        // Heart-beats are acknowledged but never scheduled.
        if frame.headers.contains(headers::HEART_BEAT) {
            connected = connected.header(headers::HEART_BEAT, "0,0");
        }
        Ok(connected)
    }

    fn dispatch(&mut self, frame: &Frame) -> Result<(), ProtocolViolation> {
        match &frame.command {
            Command::Connect | Command::Stomp => Err(ProtocolViolation::AlreadyConnected),
            Command::Disconnect => {
                info!("conn {} requested disconnect", self.connection_id);
                self.phase = Phase::Disconnected;
                Ok(())
            }
            Command::Subscribe => self.subscribe(frame),
            Command::Unsubscribe => self.unsubscribe(frame),
            Command::Send => self.send(frame),
            other => Err(ProtocolViolation::UnknownCommand(other.clone())),
        }
    }

    fn subscribe(&mut self, frame: &Frame) -> Result<(), ProtocolViolation> {
        let id = frame
            .headers
            .get(headers::ID)
            .filter(|id| !id.is_empty())
            .ok_or(ProtocolViolation::MissingHeader(headers::ID))?;
        if self.subscriptions.contains_key(id) {
            return Err(ProtocolViolation::DuplicateSubscription(id.to_string()));
        }

        let destination = frame
            .headers
            .get(headers::DESTINATION)
            .ok_or(ProtocolViolation::MissingHeader(headers::DESTINATION))?;
        if destination.len() <= 1 {
            return Err(ProtocolViolation::InvalidDestination(destination.to_string()));
        }

        let ack_mode = match frame.headers.get(headers::ACK) {
            Some(mode) => mode
                .parse::<AckMode>()
                .map_err(ProtocolViolation::InvalidAckMode)?,
            None => AckMode::Auto,
        };

        let id: Arc<str> = Arc::from(id);
        let subscriber_id = self.registry.next_subscriber_id();
        let subscriber = SessionSubscriber::new(
            subscriber_id,
            Arc::clone(&id),
            ack_mode,
            self.inbox.clone(),
        );
        self.registry.subscribe(destination, Arc::new(subscriber))?;

        debug!(
            "conn {} subscription {} -> '{}' ({})",
            self.connection_id, id, destination, ack_mode
        );
        self.subscriptions.insert(
            Arc::clone(&id),
            ClientSubscription {
                id,
                destination: destination.to_string(),
                ack_mode,
                subscriber: subscriber_id,
            },
        );
        Ok(())
    }

    fn unsubscribe(&mut self, frame: &Frame) -> Result<(), ProtocolViolation> {
        let id = frame
            .headers
            .get(headers::ID)
            .ok_or(ProtocolViolation::MissingHeader(headers::ID))?;
        let subscription = self
            .subscriptions
            .remove(id)
            .ok_or_else(|| ProtocolViolation::UnknownSubscription(id.to_string()))?;

        if let Err(e) = self
            .registry
            .unsubscribe(&subscription.destination, subscription.subscriber)
        {
            // The local entry is gone either way.
            debug!("conn {} unsubscribe {}: {}", self.connection_id, id, e);
        }
        Ok(())
    }

    fn send(&mut self, frame: &Frame) -> Result<(), ProtocolViolation> {
        let destination = frame
            .headers
            .get(headers::DESTINATION)
            .ok_or(ProtocolViolation::MissingHeader(headers::DESTINATION))?;

        // Publishing is fire-and-forget.
        if let Err(e) = self.registry.publish(destination, frame.clone()) {
            debug!("conn {} SEND dropped: {}", self.connection_id, e);
        }
        Ok(())
    }
}
