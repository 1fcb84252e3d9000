//! # Stompbox Metrics
//!
//! Lock-free counters describing broker activity. Every session and the
//! destination registry share one [`BrokerMetrics`] through an `Arc` and bump
//! counters on their hot paths with relaxed atomic adds.
//!
//! ## Counters
//!
//! - **Connections**: opened and closed, from which the active count follows
//! - **Frames**: received from clients, sent to clients, ERROR frames sent
//! - **Messages**: published, delivered into subscriber inboxes, dropped
//!   because an inbox was full or closed
//!
//! A [`MetricsSnapshot`] is a consistent-enough copy for logging and tests;
//! counters are read one at a time so a snapshot taken under load may be off
//! by in-flight updates.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::info;

/// Keeps hot counters on separate cache lines.
#[repr(align(64))]
#[derive(Debug, Default)]
struct CacheLineAligned<T>(T);

#[derive(Debug)]
pub struct BrokerMetrics {
    connections_opened: CacheLineAligned<AtomicU64>,
    connections_closed: CacheLineAligned<AtomicU64>,
    frames_received: CacheLineAligned<AtomicU64>,
    frames_sent: CacheLineAligned<AtomicU64>,
    errors_sent: AtomicU64,
    messages_published: CacheLineAligned<AtomicU64>,
    messages_delivered: CacheLineAligned<AtomicU64>,
    messages_dropped: AtomicU64,
    started_at: Instant,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            connections_opened: CacheLineAligned::default(),
            connections_closed: CacheLineAligned::default(),
            frames_received: CacheLineAligned::default(),
            frames_sent: CacheLineAligned::default(),
            errors_sent: AtomicU64::new(0),
            messages_published: CacheLineAligned::default(),
            messages_delivered: CacheLineAligned::default(),
            messages_dropped: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    #[inline(always)]
    pub fn connection_opened(&self) {
        self.connections_opened.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn connection_closed(&self) {
        self.connections_closed.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn frame_received(&self) {
        self.frames_received.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn frame_sent(&self) {
        self.frames_sent.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_sent(&self) {
        self.errors_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn message_published(&self) {
        self.messages_published.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn messages_delivered(&self, count: u64) {
        self.messages_delivered.0.fetch_add(count, Ordering::Relaxed);
    }

    pub fn messages_dropped(&self, count: u64) {
        if count > 0 {
            self.messages_dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Connections opened and not yet closed.
    pub fn active_connections(&self) -> u64 {
        let opened = self.connections_opened.0.load(Ordering::Acquire);
        let closed = self.connections_closed.0.load(Ordering::Acquire);
        opened.saturating_sub(closed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.uptime().as_secs(),
            connections_opened: self.connections_opened.0.load(Ordering::Acquire),
            connections_closed: self.connections_closed.0.load(Ordering::Acquire),
            active_connections: self.active_connections(),
            frames_received: self.frames_received.0.load(Ordering::Acquire),
            frames_sent: self.frames_sent.0.load(Ordering::Acquire),
            errors_sent: self.errors_sent.load(Ordering::Acquire),
            messages_published: self.messages_published.0.load(Ordering::Acquire),
            messages_delivered: self.messages_delivered.0.load(Ordering::Acquire),
            messages_dropped: self.messages_dropped.load(Ordering::Acquire),
        }
    }

    /// Log the current counters at info level.
    pub fn report(&self) {
        let snapshot = self.snapshot();
        info!("=== Stompbox Metrics Report ===");
        info!(
            "Connections: active={}, opened={}, closed={}",
            snapshot.active_connections, snapshot.connections_opened, snapshot.connections_closed
        );
        info!(
            "Frames: received={}, sent={}, errors={}",
            snapshot.frames_received, snapshot.frames_sent, snapshot.errors_sent
        );
        info!(
            "Messages: published={}, delivered={}, dropped={}",
            snapshot.messages_published, snapshot.messages_delivered, snapshot.messages_dropped
        );
        info!("Uptime: {}s", snapshot.uptime_seconds);
    }

    /// Report every `period` until the task is aborted.
    pub fn spawn_reporter(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.report();
            }
        })
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub errors_sent: u64,
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
}
