//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `decoder`: Inbound payload validation and default filling
//! - `outbound`: Frame encoding for client delivery
//! - `socket_manager`: Per-channel registries and fan-out
//! - `subscription`: Subscribe/unsubscribe handling with snapshot replay
//! - `router`: Domain event routing to socket managers

/// Inbound payload decoding.
pub mod decoder;

/// Outbound frame encoding.
pub mod outbound;

/// Event routing workers.
pub mod router;

/// Per-channel socket managers.
pub mod socket_manager;

/// Subscription request handling.
pub mod subscription;

pub use decoder::{DecodeError, SubscriptionEvent, SubscriptionIntent, decode};
pub use outbound::{ERROR_CHANNEL, MessageType};
pub use router::{EventRouter, RouterConfig, RouterError, RouterWorker};
pub use socket_manager::{
    BroadcastOutcome, HubStats, SharedSocketHub, SocketHub, SocketManager, send_error,
};
pub use subscription::SubscriptionService;
