//! Domain Layer - Core market data types and subscription bookkeeping.
//!
//! This layer contains the pair identity, candle aggregation, event types
//! and the channel registry. Nothing here performs I/O.

/// Trading pair identity and validation.
pub mod pair;

/// OHLCV bucket specs and candle aggregation.
pub mod ohlcv;

/// Market data event types (trades, order books, candles).
pub mod streaming;

/// Subscription registry per channel.
pub mod subscription;
