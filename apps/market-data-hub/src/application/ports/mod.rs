//! Port Interfaces
//!
//! Defines the interfaces (ports) between the subscription core and the
//! outside world following the Hexagonal Architecture pattern. These are
//! the contracts that infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `ConnectionSink`: Delivery of encoded frames to one client connection
//! - `MarketDataStore`: Historical queries used for subscribe-time replay

/// Client connection delivery port.
pub mod connection;

/// Historical market data query port.
pub mod store;

pub use connection::{ConnectionSink, DeliveryError, OutboundFrame, SharedConnection};
pub use store::{MarketDataStore, StoreError, TradeFilter};
