//! Market Data Store Port (Driven Port)
//!
//! Historical market data. The event router records every trade and book
//! change it routes; the subscription service reads the store to send a
//! snapshot to each new subscriber, and the router reads it back to seed
//! candles. The REST layer that also queries it lives outside this crate.

use async_trait::async_trait;

use crate::domain::ohlcv::{Candle, TimeUnit};
use crate::domain::pair::{Address, PairKey};
use crate::domain::streaming::{OrderBookDelta, OrderBookSnapshot, Trade};

/// Selects which trades `query_trades` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeFilter {
    /// Trades on one pair.
    Pair(PairKey),
    /// Trades where the address was maker or taker.
    Address(Address),
}

/// Store query error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Nothing is recorded for the requested key.
    #[error("no data found for {0}")]
    NotFound(String),

    /// The backing store could not be reached.
    #[error("market data store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Stable client-facing error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unavailable(_) => "STORE_UNAVAILABLE",
        }
    }
}

/// Port for recording and querying historical market data.
///
/// This is a driven (secondary/outbound) port. The infrastructure layer
/// provides implementations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataStore: Send + Sync {
    /// Candles of width `duration × units` with open time in `[from, to]`,
    /// oldest first.
    async fn query_ohlcv(
        &self,
        pair: PairKey,
        duration: u32,
        units: TimeUnit,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, StoreError>;

    /// Current full order book for `pair`.
    ///
    /// Returns `StoreError::NotFound` when no book exists.
    async fn query_order_book(&self, pair: PairKey) -> Result<OrderBookSnapshot, StoreError>;

    /// Recent trades matching `filter`, newest first.
    async fn query_trades(&self, filter: TradeFilter) -> Result<Vec<Trade>, StoreError>;

    /// Append an executed trade.
    async fn record_trade(&self, trade: &Trade) -> Result<(), StoreError>;

    /// Replace the stored book of the snapshot's pair.
    async fn record_order_book(&self, snapshot: &OrderBookSnapshot) -> Result<(), StoreError>;

    /// Apply an incremental change to the stored book of the delta's pair,
    /// starting from an empty book if none is stored.
    async fn apply_order_book_delta(&self, delta: &OrderBookDelta) -> Result<(), StoreError>;
}
