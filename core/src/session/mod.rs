//! # Stompbox Client Sessions
//!
//! One [`ClientSession`] exists per connection. It runs two activities:
//!
//! - the **inbound loop** pulls frames from the frame source one at a time
//!   and drives the [`SessionState`] machine, pushing replies onto the
//!   outgoing queue
//! - the **inbox drain** turns messages delivered by destinations into
//!   MESSAGE frames on the same outgoing queue
//!
//! The transport owns the receiving end of the outgoing queue. When the
//! session ends it unsubscribes everything, stops the drain and drops its
//! senders; the closed queue is the transport's cue to flush and hang up.
//!
//! ```text
//! frame source ──▶ inbound loop ──▶ SessionState ──▶ registry
//!                       │                               │
//!                       ▼                               ▼
//!                 outgoing queue ◀── inbox drain ◀── inbox
//! ```

pub mod state;
pub mod subscription;


pub use state::{ErrorPolicy, Flow, Phase, ProtocolViolation, SessionState, Transition};
pub use subscription::{AckMode, ClientSubscription, Delivery, SessionSubscriber};

use crate::destination::DestinationRegistry;
use crate::metrics::BrokerMetrics;
use crate::protocol::{headers, Command, Frame, ParseError};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-session settings, usually derived from the broker configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub inbox_size: usize,
    pub error_policy: ErrorPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inbox_size: 1024,
            error_policy: ErrorPolicy::default(),
        }
    }
}

pub struct ClientSession {
    connection_id: u64,
    state: SessionState,
    outgoing: mpsc::Sender<Frame>,
    metrics: Arc<BrokerMetrics>,
    drain: JoinHandle<()>,
    drain_cancel: CancellationToken,
    shutdown: Option<broadcast::Receiver<()>>,
}

impl ClientSession {
    /// Create a session writing to `outgoing` and start its inbox drain.
    pub fn new(
        connection_id: u64,
        registry: Arc<DestinationRegistry>,
        outgoing: mpsc::Sender<Frame>,
        config: SessionConfig,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_size);
        let metrics = registry.metrics();
        let drain_cancel = CancellationToken::new();
        let drain = tokio::spawn(drain_inbox(
            connection_id,
            inbox_rx,
            outgoing.clone(),
            drain_cancel.clone(),
        ));

        Self {
            connection_id,
            state: SessionState::new(connection_id, registry, inbox_tx, config.error_policy),
            outgoing,
            metrics,
            drain,
            drain_cancel,
            shutdown: None,
        }
    }

    /// End the session when the broker shuts down.
    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Drive the session until the client disconnects, a terminal error is
    /// sent, the source ends or the broker shuts down. Returns the final
    /// phase.
    pub async fn run<S>(mut self, mut frames: S) -> Phase
    where
        S: Stream<Item = Result<Frame, ParseError>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                next = frames.next() => next,
                _ = shutdown_signal(&mut self.shutdown) => {
                    info!("conn {} closing for broker shutdown", self.connection_id);
                    break;
                }
            };

            let transition = match next {
                Some(Ok(frame)) => {
                    self.metrics.frame_received();
                    self.state.handle(frame)
                }
                Some(Err(e)) => self.state.parse_failed(&e),
                None => {
                    debug!("conn {} frame source closed", self.connection_id);
                    break;
                }
            };

            let mut writable = true;
            for reply in transition.replies {
                if self.outgoing.send(reply).await.is_err() {
                    warn!("conn {} outgoing queue closed", self.connection_id);
                    writable = false;
                    break;
                }
            }

            if !writable || transition.flow == Flow::Stop {
                break;
            }
        }

        self.close().await
    }

    async fn close(mut self) -> Phase {
        let removed = self.state.teardown();
        self.drain_cancel.cancel();
        if let Err(e) = (&mut self.drain).await {
            warn!("conn {} inbox drain failed: {}", self.connection_id, e);
        }
        info!(
            "conn {} session ended in phase {} ({} subscriptions removed)",
            self.connection_id,
            self.state.phase(),
            removed
        );
        // Dropping `self` drops the last outgoing sender.
        self.state.phase()
    }
}

async fn shutdown_signal(shutdown: &mut Option<broadcast::Receiver<()>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Build the MESSAGE frame for one delivery.
///
/// `ack` is the per-session counter value, present for non-auto
/// subscriptions.
pub fn message_frame(delivery: &Delivery, ack: Option<u64>) -> Frame {
    let published = &delivery.message.frame;
    let mut frame = Frame::new(Command::Message).header(headers::SUBSCRIPTION, &*delivery.subscription);
    if let Some(ack) = ack {
        frame = frame.header(headers::ACK, ack.to_string());
    }
    for (name, value) in published.headers.iter() {
        frame = frame.header(name, value);
    }
    if !frame.headers.contains(headers::MESSAGE_ID) {
        frame = frame.header(headers::MESSAGE_ID, delivery.message.id.to_string());
    }
    frame.with_body(published.body.clone())
}

async fn drain_inbox(
    connection_id: u64,
    mut inbox: mpsc::Receiver<Delivery>,
    outgoing: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    let mut ack_counter: u64 = 0;

    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = inbox.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let ack = if delivery.ack_mode.expects_ack() {
            ack_counter += 1;
            Some(ack_counter)
        } else {
            None
        };
        let frame = message_frame(&delivery, ack);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = outgoing.send(frame) => {
                if sent.is_err() {
                    debug!("conn {} outgoing queue closed, stopping inbox drain", connection_id);
                    break;
                }
            }
        }
    }

    // Deliveries racing with teardown now fail as InboxClosed.
    inbox.close();
}
