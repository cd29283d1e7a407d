//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Configuration from the environment.
pub mod config;

/// Bounded outbound queues backing `ConnectionSink`.
pub mod connection;

/// Health check HTTP endpoint.
pub mod health;

/// HTTP endpoint producers post domain events to.
pub mod ingest;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// In-memory `MarketDataStore`.
pub mod store;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// WebSocket transport for client subscriptions.
pub mod websocket;
