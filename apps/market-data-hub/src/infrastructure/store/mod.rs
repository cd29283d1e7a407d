//! In-Memory Market Data Store
//!
//! `MarketDataStore` implementation that keeps recorded trades and the
//! latest order book per pair in memory. Candles are computed from the
//! recorded trades at query time. Backs the hub when no external store is
//! configured, and the tests.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::{MarketDataStore, StoreError, TradeFilter};
use crate::domain::ohlcv::{BucketSpec, Candle, CandleAggregator, TimeUnit};
use crate::domain::pair::PairKey;
use crate::domain::streaming::{OrderBookDelta, OrderBookSnapshot, Trade};

/// Default number of trades returned by `query_trades`.
pub const DEFAULT_TRADE_LIMIT: usize = 100;

/// Default number of trades kept across all pairs.
pub const DEFAULT_RETAINED_TRADES: usize = 100_000;

/// In-memory market data store.
#[derive(Debug)]
pub struct InMemoryMarketStore {
    trades: RwLock<VecDeque<Trade>>,
    books: RwLock<HashMap<PairKey, OrderBookSnapshot>>,
    trade_limit: usize,
    retained_trades: usize,
}

impl Default for InMemoryMarketStore {
    fn default() -> Self {
        Self::new(DEFAULT_TRADE_LIMIT, DEFAULT_RETAINED_TRADES)
    }
}

impl InMemoryMarketStore {
    /// Create an empty store returning at most `trade_limit` trades per
    /// query and keeping the newest `retained_trades` trades.
    #[must_use]
    pub fn new(trade_limit: usize, retained_trades: usize) -> Self {
        Self {
            trades: RwLock::new(VecDeque::new()),
            books: RwLock::new(HashMap::new()),
            trade_limit,
            retained_trades: retained_trades.max(1),
        }
    }
}

#[async_trait]
impl MarketDataStore for InMemoryMarketStore {
    async fn query_ohlcv(
        &self,
        pair: PairKey,
        duration: u32,
        units: TimeUnit,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, StoreError> {
        let spec = BucketSpec::new(units, duration)
            .ok_or_else(|| StoreError::NotFound(format!("no {duration} {units} candles")))?;

        let mut window: Vec<(i64, Trade)> = self
            .trades
            .read()
            .iter()
            .filter(|trade| trade.pair == pair)
            .map(|trade| (trade.timestamp.timestamp(), trade.clone()))
            .filter(|(ts, _)| (from..=to).contains(&spec.align(*ts)))
            .collect();
        window.sort_by_key(|(ts, _)| *ts);

        let mut aggregator = CandleAggregator::new();
        let mut candles: BTreeMap<i64, Candle> = BTreeMap::new();
        for (ts, trade) in window {
            for candle in aggregator.apply_trade(pair, spec, trade.price, trade.amount, ts) {
                candles.insert(candle.open_time, candle);
            }
        }

        Ok(candles.into_values().collect())
    }

    async fn query_order_book(&self, pair: PairKey) -> Result<OrderBookSnapshot, StoreError> {
        self.books
            .read()
            .get(&pair)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("order book for {pair}")))
    }

    async fn query_trades(&self, filter: TradeFilter) -> Result<Vec<Trade>, StoreError> {
        let mut trades: Vec<Trade> = self
            .trades
            .read()
            .iter()
            .filter(|trade| match filter {
                TradeFilter::Pair(pair) => trade.pair == pair,
                TradeFilter::Address(address) => trade.involves(&address),
            })
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        trades.truncate(self.trade_limit);
        Ok(trades)
    }

    async fn record_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        let mut trades = self.trades.write();
        if trades.len() == self.retained_trades {
            trades.pop_front();
        }
        trades.push_back(trade.clone());
        Ok(())
    }

    async fn record_order_book(&self, snapshot: &OrderBookSnapshot) -> Result<(), StoreError> {
        self.books.write().insert(snapshot.pair, snapshot.clone());
        Ok(())
    }

    async fn apply_order_book_delta(&self, delta: &OrderBookDelta) -> Result<(), StoreError> {
        let mut books = self.books.write();
        let book = books
            .entry(delta.pair)
            .or_insert_with(|| OrderBookSnapshot::empty(delta.pair));
        if !book.apply_delta(delta) {
            tracing::debug!(
                pair = %delta.pair,
                sequence = delta.sequence,
                stored = book.sequence,
                "Ignoring stale order book delta"
            );
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
