//! Market Data Streaming Types
//!
//! Core domain types for the events the hub distributes: trades, order
//! book deltas and snapshots, and candle ticks. Every event carries the
//! `PairKey` it belongs to, which is what routing and registry lookup key
//! on.
//!
//! Producers submit events as `{"type": <kind>, "data": <event>}` JSON,
//! where `<kind>` is the snake-case variant name of `DomainEvent`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::ohlcv::Candle;
use crate::domain::pair::{Address, PairKey};

// =============================================================================
// Trades
// =============================================================================

/// Taker side of a trade or side of a resting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Bid side.
    Buy,
    /// Ask side.
    Sell,
}

/// An executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    /// Trade identifier.
    pub id: Uuid,
    /// Traded pair.
    pub pair: PairKey,
    /// Resting order owner.
    pub maker: Address,
    /// Aggressing order owner.
    pub taker: Address,
    /// Execution price in quote units.
    pub price: Decimal,
    /// Executed base amount.
    pub amount: Decimal,
    /// Taker side.
    pub side: Side,
    /// Execution time.
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    /// Whether `address` is either counterparty of this trade.
    #[must_use]
    pub fn involves(&self, address: &Address) -> bool {
        self.maker == *address || self.taker == *address
    }
}

// =============================================================================
// Order Book
// =============================================================================

/// A resting order as carried by the full-depth book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookOrder {
    /// Order identifier.
    pub id: Uuid,
    /// Book side.
    pub side: Side,
    /// Limit price.
    pub price: Decimal,
    /// Remaining amount. Zero marks a removed order in a delta.
    pub amount: Decimal,
    /// Order owner.
    pub maker: Address,
}

/// Aggregated amount at one price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Level price.
    pub price: Decimal,
    /// Total remaining amount at this price. Zero marks a removed level.
    pub amount: Decimal,
}

/// Incremental order book change.
///
/// `orders` is the full-fidelity payload; `bids`/`asks` are the touched
/// price levels with their new aggregate amounts, used for the lite view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookDelta {
    /// Book pair.
    pub pair: PairKey,
    /// Monotonic book sequence number.
    pub sequence: u64,
    /// Changed orders.
    pub orders: Vec<BookOrder>,
    /// Touched bid levels.
    pub bids: Vec<PriceLevel>,
    /// Touched ask levels.
    pub asks: Vec<PriceLevel>,
}

impl OrderBookDelta {
    /// Top-of-book view of this delta: touched levels nearest the spread,
    /// at most `depth` per side.
    #[must_use]
    pub fn to_lite(&self, depth: usize) -> LiteBook {
        let mut bids = self.bids.clone();
        let mut asks = self.asks.clone();
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        bids.truncate(depth);
        asks.truncate(depth);
        LiteBook {
            pair: self.pair,
            sequence: self.sequence,
            bids,
            asks,
        }
    }
}

/// Full order book at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    /// Book pair.
    pub pair: PairKey,
    /// Book sequence number the snapshot reflects.
    pub sequence: u64,
    /// Resting bids.
    pub bids: Vec<BookOrder>,
    /// Resting asks.
    pub asks: Vec<BookOrder>,
}

impl OrderBookSnapshot {
    /// A book with no resting orders.
    #[must_use]
    pub const fn empty(pair: PairKey) -> Self {
        Self {
            pair,
            sequence: 0,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    /// Apply the order changes of `delta` in place.
    ///
    /// Orders are matched by id and a zero amount removes the order. Deltas
    /// at or below the current sequence are ignored. Returns whether the
    /// book changed.
    pub fn apply_delta(&mut self, delta: &OrderBookDelta) -> bool {
        if delta.sequence <= self.sequence {
            return false;
        }

        for order in &delta.orders {
            let side = match order.side {
                Side::Buy => &mut self.bids,
                Side::Sell => &mut self.asks,
            };
            let resting = side.iter().position(|resting| resting.id == order.id);
            match (resting, order.amount.is_zero()) {
                (Some(index), true) => {
                    side.remove(index);
                }
                (Some(index), false) => side[index] = order.clone(),
                (None, false) => side.push(order.clone()),
                (None, true) => {}
            }
        }

        self.sequence = delta.sequence;
        true
    }

    /// Aggregate resting orders into price levels, keeping the best
    /// `depth` levels per side.
    #[must_use]
    pub fn to_lite(&self, depth: usize) -> LiteBook {
        LiteBook {
            pair: self.pair,
            sequence: self.sequence,
            bids: aggregate(&self.bids).into_iter().rev().take(depth).collect(),
            asks: aggregate(&self.asks).into_iter().take(depth).collect(),
        }
    }
}

/// Sum amounts per price, ascending by price.
fn aggregate(orders: &[BookOrder]) -> Vec<PriceLevel> {
    let mut levels: BTreeMap<Decimal, Decimal> = BTreeMap::new();
    for order in orders {
        *levels.entry(order.price).or_default() += order.amount;
    }
    levels
        .into_iter()
        .map(|(price, amount)| PriceLevel { price, amount })
        .collect()
}

/// Aggregated top-of-book payload sent on the lite channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiteBook {
    /// Book pair.
    pub pair: PairKey,
    /// Book sequence number.
    pub sequence: u64,
    /// Bid levels, best (highest) first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best (lowest) first.
    pub asks: Vec<PriceLevel>,
}

// =============================================================================
// Domain Events
// =============================================================================

/// An event produced by the matching or aggregation side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A trade executed.
    NewTrade(Trade),
    /// The book changed incrementally.
    OrderBookDelta(OrderBookDelta),
    /// The book was republished in full.
    OrderBookSnapshot(OrderBookSnapshot),
    /// A candle produced upstream changed.
    CandleTick(Candle),
}

impl DomainEvent {
    /// Pair the event belongs to.
    #[must_use]
    pub const fn pair(&self) -> &PairKey {
        match self {
            Self::NewTrade(trade) => &trade.pair,
            Self::OrderBookDelta(delta) => &delta.pair,
            Self::OrderBookSnapshot(snapshot) => &snapshot.pair,
            Self::CandleTick(candle) => &candle.pair,
        }
    }

    /// Event name used as a metrics label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NewTrade(_) => "new_trade",
            Self::OrderBookDelta(_) => "order_book_delta",
            Self::OrderBookSnapshot(_) => "order_book_snapshot",
            Self::CandleTick(_) => "candle_tick",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
