#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Data Hub - Subscription Registry and Event Distribution
//!
//! Accepts WebSocket subscriptions to a (channel, trading pair) combination
//! and fans freshly computed market data out to exactly the connections that
//! asked for it. Channels: lite order book, full order book, trades, and
//! OHLCV candles keyed by bucket width.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `pair`: Token addresses and canonical pair keys
//!   - `ohlcv`: Bucket specs and candle aggregation
//!   - `streaming`: Trades, order books and domain events
//!   - `subscription`: Sharded per-channel registry
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Client connection sink, market data store
//!   - `services`: Decoding, socket managers, subscription handling, routing
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `websocket`: `/socket` endpoint and per-connection tasks
//!   - `ingest`: `/events` endpoint producers post domain events to
//!   - `connection`: Bounded outbound queues
//!   - `store`: In-memory market data store
//!   - `config`: Environment configuration
//!   - `health`: Health check and metrics HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!  client ──frame──► decoder ──► SubscriptionService ──► SocketManager[channel]
//!                                        │                     │
//!                                  INIT snapshot          ChannelRegistry
//!                                   (store query)              ▲
//!                                                              │ bucket lookup
//!  matching engine ──POST /events──► EventRouter ──► RouterWorker[pair shard]
//!                                                       │      │
//!                                             store ◄───┘      ▼
//!                                                   UPDATE ──► subscribers only
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::ohlcv::{BucketSpec, Candle, OhlcvParams, TimeUnit};
pub use domain::pair::{Address, PairError, PairKey};
pub use domain::streaming::{DomainEvent, OrderBookDelta, OrderBookSnapshot, Trade};
pub use domain::subscription::{ChannelKind, ChannelRegistry, ConnectionId, RegistryKey};

// Ports
pub use application::ports::{
    ConnectionSink, MarketDataStore, SharedConnection, StoreError, TradeFilter,
};

// Services
pub use application::services::{
    EventRouter, RouterConfig, SharedSocketHub, SocketHub, SocketManager, SubscriptionService,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, ConnectionSettings, HubConfig, RouterSettings, ServerSettings,
};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::ingest::{IngestServer, IngestServerError};
pub use infrastructure::websocket::{HubServerError, SocketServer, SocketServerState};

// Adapters (for integration tests)
pub use infrastructure::connection::{ConnectionHandle, ConnectionTracker};
pub use infrastructure::store::InMemoryMarketStore;

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
