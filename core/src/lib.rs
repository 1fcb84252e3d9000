//! # Stompbox Core Library
//!
//! Stompbox is a STOMP 1.2 message broker. Clients connect over TCP, negotiate
//! a session, subscribe to named destinations and publish messages that are
//! fanned out to every current subscriber.
//!
//! ## Architecture Overview
//!
//! - [`protocol`] - frame model and the incremental wire codec
//! - [`destination`] - process-wide destination registry and broadcast fan-out
//! - [`session`] - per-connection protocol state machine and inbox delivery
//! - [`broker`] - TCP accept loop and per-connection tasks
//! - [`config`] - broker configuration from defaults, CLI flags or environment
//! - [`metrics`] - lock-free broker counters
//!
//! Data flows `bytes → StompCodec → ClientSession → DestinationRegistry →
//! Broadcast → other sessions' inboxes → StompCodec → bytes`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stompbox::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig {
//!         port: 61613,
//!         host: "0.0.0.0".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let server = BrokerServer::new(config)?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod destination;
pub mod metrics;
pub mod protocol;
pub mod session;

pub use broker::BrokerServer;
pub use config::BrokerConfig;
pub use destination::{
    Broadcast, Destination, DestinationError, DestinationRegistry, Message, MessageId, Subscriber,
    SubscriberId,
};
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use protocol::{Command, Frame, FrameHeaders, ParseError, StompCodec};
pub use session::{ClientSession, ErrorPolicy, Phase, ProtocolViolation};

use thiserror::Error;

/// Stompbox error types
///
/// Failures surfaced to the embedding application. Client-visible protocol
/// problems never end up here; sessions report those as ERROR frames.
#[derive(Debug, Error)]
pub enum StompError {
    /// Socket and listener failures
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration validation and parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Destination registration failures, e.g. a duplicate id at startup
    #[error("Destination error: {0}")]
    Destination(#[from] DestinationError),
}

/// Result type alias for Stompbox operations
pub type Result<T> = std::result::Result<T, StompError>;
