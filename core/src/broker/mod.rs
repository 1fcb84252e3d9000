//! # Stompbox Broker Module
//!
//! TCP bootstrap around the protocol core. [`BrokerServer`] owns the
//! destination registry and metrics, accepts connections, and wires each one
//! to a [`crate::session::ClientSession`]:
//!
//! ```text
//! TcpStream ──Framed<StompCodec>──┬── read half ──▶ ClientSession
//!                                 └── write half ◀── writer task ◀── outgoing queue
//! ```
//!
//! The writer task exits once the session drops the outgoing queue, closing
//! the connection behind it. Bookkeeping for the connection is removed when
//! both halves are done.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use stompbox::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::default().with_destination("/topic/prices");
//!     let server = BrokerServer::new(config)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod server;

pub use server::*;
