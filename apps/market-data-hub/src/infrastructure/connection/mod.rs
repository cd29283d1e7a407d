//! Connection Sink Adapter
//!
//! Backs `ConnectionSink` with a bounded tokio channel. The socket adapter
//! owns the receiving end and drains it into the WebSocket from a writer
//! task; the subscription core only ever calls the non-blocking
//! `try_deliver`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ConnectionSink, DeliveryError, OutboundFrame};
use crate::domain::subscription::ConnectionId;
use crate::infrastructure::metrics;

// =============================================================================
// Connection Handle
// =============================================================================

/// Sending half of a connection's outbound queue.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle with an outbound queue of `capacity` frames.
    ///
    /// `cancel` is fired by `close` and should stop the connection's tasks.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx, cancel }, rx)
    }
}

impl ConnectionSink for ConnectionHandle {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn try_deliver(&self, frame: OutboundFrame) -> Result<(), DeliveryError> {
        if self.cancel.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

// =============================================================================
// Connection Bookkeeping
// =============================================================================

/// Allocates process-unique connection ids.
#[derive(Debug)]
pub struct ConnectionIds(AtomicU64);

impl Default for ConnectionIds {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl ConnectionIds {
    /// Next unused id.
    pub fn next_id(&self) -> ConnectionId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Counts live connections.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    live: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    /// Create a tracker with no connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; it counts as live until the guard drops.
    #[must_use]
    pub fn open(&self) -> ConnectionGuard {
        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_connections(live);
        ConnectionGuard {
            live: Arc::clone(&self.live),
        }
    }

    /// Live connection count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// Keeps one connection counted.
#[derive(Debug)]
pub struct ConnectionGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let live = self.live.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        metrics::set_connections(live);
    }
}

// =============================================================================
// Tests
// =============================================================================
