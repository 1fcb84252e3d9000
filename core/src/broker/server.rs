use crate::config::BrokerConfig;
use crate::destination::DestinationRegistry;
use crate::metrics::BrokerMetrics;
use crate::protocol::{Frame, StompCodec};
use crate::session::{ClientSession, SessionConfig};
use crate::{Result, StompError};
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Serial id handed to each accepted connection; used in log lines.
pub type SessionId = u64;

type FrameSink = SplitSink<Framed<TcpStream, StompCodec>, Frame>;

pub struct BrokerServer {
    config: BrokerConfig,
    registry: Arc<DestinationRegistry>,
    metrics: Arc<BrokerMetrics>,
    // Live connections, removed when the connection task ends
    sessions: Arc<DashMap<SessionId, SocketAddr>>,
    next_session_id: AtomicU64,
    // Graceful shutdown coordination
    shutdown_tx: broadcast::Sender<()>,
}

impl BrokerServer {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate().map_err(StompError::Config)?;

        let metrics = Arc::new(BrokerMetrics::new());
        let registry = DestinationRegistry::with_metrics(Arc::clone(&metrics))
            .with_auto_create(config.auto_create_destinations);
        for destination in &config.destinations {
            registry.register_broadcast(destination.as_str())?;
        }
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            config,
            registry: Arc::new(registry),
            metrics,
            sessions: Arc::new(DashMap::new()),
            next_session_id: AtomicU64::new(0),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The destination table, for registering destinations beyond the
    /// configured ones.
    pub fn registry(&self) -> Arc<DestinationRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Stop accepting connections and end every open session.
    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "Stompbox broker listening on {} (destinations: {:?})",
            local_addr,
            self.registry.destination_ids()
        );

        let reporter = self
            .config
            .stats_interval_secs
            .map(|secs| Arc::clone(&self.metrics).spawn_reporter(Duration::from_secs(secs)));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => self.accept(stream, peer_addr),
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping server gracefully...");
                    break;
                }
            }
        }

        if let Some(reporter) = reporter {
            reporter.abort();
        }
        info!("Server shutdown complete");
        Ok(())
    }

    fn accept(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if self.sessions.len() >= self.config.max_connections {
            warn!(
                "Connection limit {} reached, dropping connection from {}",
                self.config.max_connections, peer_addr
            );
            return;
        }

        if let Err(e) = Self::optimize_client_socket(&stream) {
            warn!("Failed to optimize client socket {}: {}", peer_addr, e);
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(session_id, peer_addr);
        self.metrics.connection_opened();
        info!(
            "conn {} accepted from {} (active: {})",
            session_id,
            peer_addr,
            self.sessions.len()
        );

        let connection = Connection {
            id: session_id,
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
            session_config: self.config.session_config(),
            max_frame_size: self.config.max_frame_size,
            outgoing_queue_size: self.config.outgoing_queue_size,
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        let sessions = Arc::clone(&self.sessions);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            connection.handle(stream).await;
            metrics.connection_closed();
            sessions.remove(&session_id);
            info!(
                "conn {} from {} closed (active: {})",
                session_id,
                peer_addr,
                sessions.len()
            );
        });
    }

    fn optimize_client_socket(stream: &TcpStream) -> Result<()> {
        use socket2::SockRef;

        let socket_ref = SockRef::from(stream);
        socket_ref.set_tcp_nodelay(true)?;
        socket_ref.set_keepalive(true)?;
        Ok(())
    }
}

/// Everything one connection task needs from the broker.
struct Connection {
    id: SessionId,
    registry: Arc<DestinationRegistry>,
    metrics: Arc<BrokerMetrics>,
    session_config: SessionConfig,
    max_frame_size: usize,
    outgoing_queue_size: usize,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Connection {
    /// Wire the socket to a session: the read half feeds the session, a
    /// writer task drains the outgoing queue into the write half.
    async fn handle(self, stream: TcpStream) {
        let framed = Framed::new(stream, StompCodec::with_max_frame_size(self.max_frame_size));
        let (sink, frames) = framed.split();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.outgoing_queue_size);

        let writer = tokio::spawn(write_frames(
            self.id,
            sink,
            outgoing_rx,
            Arc::clone(&self.metrics),
        ));

        let session = ClientSession::new(self.id, self.registry, outgoing_tx, self.session_config)
            .with_shutdown(self.shutdown_rx);
        let phase = session.run(frames).await;
        debug!("conn {} session finished in phase {}", self.id, phase);

        if let Err(e) = writer.await {
            error!("conn {} writer task failed: {}", self.id, e);
        }
    }
}

/// Forward queued frames to the socket until the queue closes, then flush and
/// shut down the write side.
async fn write_frames(
    connection_id: SessionId,
    mut sink: FrameSink,
    mut outgoing: mpsc::Receiver<Frame>,
    metrics: Arc<BrokerMetrics>,
) {
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!("conn {} failed to write frame: {}", connection_id, e);
            return;
        }
        metrics.frame_sent();
    }

    if let Err(e) = sink.close().await {
        debug!("conn {} close failed: {}", connection_id, e);
    }
}
