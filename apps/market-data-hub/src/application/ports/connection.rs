//! Connection Sink Port (Driven Port)
//!
//! The subscription core never touches a socket. It hands fully encoded
//! frames to a `ConnectionSink`, which must not block: a sink that cannot
//! take a frame right now reports a `DeliveryError` instead.

use std::fmt;
use std::sync::Arc;

use crate::domain::subscription::ConnectionId;

/// An encoded text frame ready to be written to a connection.
///
/// Cloning is cheap, so one encoding can be shared by every recipient of a
/// broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame(Arc<str>);

impl OutboundFrame {
    /// Wrap encoded frame text.
    #[must_use]
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    /// Frame text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a frame could not be handed to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The connection's outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
    /// The connection has shut down.
    #[error("connection closed")]
    Closed,
}

impl DeliveryError {
    /// Short label for metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
        }
    }
}

/// Non-blocking delivery endpoint for one client connection.
pub trait ConnectionSink: Send + Sync {
    /// Connection identifier.
    fn id(&self) -> ConnectionId;

    /// Enqueue a frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError` if the frame cannot be queued right now.
    fn try_deliver(&self, frame: OutboundFrame) -> Result<(), DeliveryError>;

    /// Ask the connection to shut down. Idempotent.
    fn close(&self);

    /// Whether the connection has been asked to shut down.
    fn is_closed(&self) -> bool;
}

/// Shared handle to a connection, as stored in registry buckets.
pub type SharedConnection = Arc<dyn ConnectionSink>;
