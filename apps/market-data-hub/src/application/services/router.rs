//! Event Router
//!
//! Consumes domain events, records them in the market data store, and
//! pushes them to the socket managers whose subscribers asked for them.
//!
//! # Ordering
//!
//! Events are partitioned by a hash of their pair onto a fixed set of
//! worker queues. Each worker is the single consumer of its queue, so
//! events of one pair are routed in publish order; events of different
//! pairs may interleave.
//!
//! # Candles
//!
//! Each worker owns a `CandleAggregator` for the pairs hashed onto it.
//! A trade updates every OHLCV bucket spec that currently has subscribers
//! for its pair, and a periodic tick finalizes buckets whose time is up.
//! When a trade opens a bucket the worker has no candle for, the bucket is
//! rebuilt from the store so trades routed before the first subscriber
//! still count.

use std::hash::{BuildHasher, RandomState};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::socket_manager::SharedSocketHub;
use crate::application::ports::MarketDataStore;
use crate::domain::ohlcv::{BucketSpec, Candle, CandleAggregator};
use crate::domain::pair::PairKey;
use crate::domain::streaming::{DomainEvent, OrderBookDelta, OrderBookSnapshot, Trade};
use crate::domain::subscription::{ChannelKind, RegistryKey};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Event router configuration.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Number of worker partitions.
    pub partitions: usize,
    /// Capacity of each partition's queue.
    pub queue_capacity: usize,
    /// How often open candles are checked for a finished bucket.
    pub candle_tick_interval: Duration,
    /// Price levels per side in lite book payloads.
    pub lite_depth: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            queue_capacity: 4096,
            candle_tick_interval: Duration::from_secs(1),
            lite_depth: 20,
        }
    }
}

/// Event publishing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    /// The router's workers have stopped.
    #[error("event router is shut down")]
    Closed,
}

// =============================================================================
// Event Router
// =============================================================================

/// Publishing handle for the event router. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventRouter {
    senders: Arc<[mpsc::Sender<DomainEvent>]>,
    hasher: RandomState,
    running: Arc<AtomicUsize>,
}

impl EventRouter {
    /// Start one worker task per partition.
    ///
    /// Workers stop when `cancel` fires or every handle is dropped.
    #[must_use]
    pub fn spawn(
        hub: SharedSocketHub,
        store: Arc<dyn MarketDataStore>,
        config: &RouterConfig,
        cancel: &CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let partitions = config.partitions.max(1);
        let running = Arc::new(AtomicUsize::new(0));
        let mut senders = Vec::with_capacity(partitions);
        let mut handles = Vec::with_capacity(partitions);

        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            senders.push(tx);

            let worker = RouterWorker::new(Arc::clone(&hub), Arc::clone(&store), config.lite_depth);
            let guard = RunningGuard::new(Arc::clone(&running));
            let cancel = cancel.clone();
            let interval = config.candle_tick_interval;
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                worker.run(rx, interval, cancel).await;
                tracing::debug!(partition, "Router worker stopped");
            }));
        }

        tracing::info!(partitions, "Event router started");

        (
            Self {
                senders: senders.into(),
                hasher: RandomState::new(),
                running,
            },
            handles,
        )
    }

    /// Queue `event` on its pair's partition, waiting for space.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Closed` if the partition's worker has stopped.
    pub async fn publish(&self, event: DomainEvent) -> Result<(), RouterError> {
        let sender = self
            .senders
            .get(self.partition(event.pair()))
            .ok_or(RouterError::Closed)?;
        sender.send(event).await.map_err(|_| RouterError::Closed)
    }

    /// Partition index events of `pair` are routed through.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn partition(&self, pair: &PairKey) -> usize {
        (self.hasher.hash_one(pair) % self.senders.len() as u64) as usize
    }

    /// Whether every worker is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) == self.senders.len()
    }
}

/// Counts a worker as running for as long as it lives.
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// Router Worker
// =============================================================================

/// Routes the events of one partition.
pub struct RouterWorker {
    hub: SharedSocketHub,
    store: Arc<dyn MarketDataStore>,
    candles: CandleAggregator,
    lite_depth: usize,
}

impl std::fmt::Debug for RouterWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterWorker")
            .field("open_candles", &self.candles.len())
            .field("lite_depth", &self.lite_depth)
            .finish_non_exhaustive()
    }
}

impl RouterWorker {
    /// Create a worker recording into `store` and delivering through `hub`.
    #[must_use]
    pub fn new(hub: SharedSocketHub, store: Arc<dyn MarketDataStore>, lite_depth: usize) -> Self {
        Self {
            hub,
            store,
            candles: CandleAggregator::new(),
            lite_depth,
        }
    }

    /// Record one event and deliver it to every interested connection.
    ///
    /// Store failures are logged; delivery goes ahead regardless.
    pub async fn route(&mut self, event: &DomainEvent) {
        match event {
            DomainEvent::NewTrade(trade) => self.route_trade(trade).await,
            DomainEvent::OrderBookDelta(delta) => self.route_delta(delta).await,
            DomainEvent::OrderBookSnapshot(snapshot) => self.route_snapshot(snapshot).await,
            DomainEvent::CandleTick(candle) => self.route_candle(candle),
        }
    }

    /// Finalize candles whose bucket ended before `now` and publish them.
    ///
    /// Candles nobody subscribes to any more are discarded first.
    pub fn roll_candles(&mut self, now: i64) {
        let ohlcv = self.hub.manager(ChannelKind::Ohlcv);
        self.candles
            .retain(|pair, spec| ohlcv.subscriber_count(&RegistryKey::candles(*pair, *spec)) > 0);

        for candle in self.candles.roll(now) {
            self.route_candle(&candle);
        }
    }

    /// Number of candles this worker keeps open.
    #[must_use]
    pub fn open_candles(&self) -> usize {
        self.candles.len()
    }

    async fn route_trade(&mut self, trade: &Trade) {
        let recorded = match self.store.record_trade(trade).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    pair = %trade.pair,
                    trade_id = %trade.id,
                    error = %e,
                    "Failed to record trade"
                );
                false
            }
        };

        let hub = Arc::clone(&self.hub);
        hub.manager(ChannelKind::Trades).broadcast(&hub, trade.pair, trade);

        let ohlcv = hub.manager(ChannelKind::Ohlcv);
        let timestamp = trade.timestamp.timestamp();
        for spec in ohlcv.active_specs(&trade.pair) {
            let opens = self.candles.opens_bucket(&trade.pair, &spec, timestamp);
            let history = if recorded && opens {
                self.recorded_bucket(trade.pair, spec, timestamp).await
            } else {
                None
            };
            let ticks = match history {
                Some(candle) => self.candles.seed(candle),
                None => self
                    .candles
                    .apply_trade(trade.pair, spec, trade.price, trade.amount, timestamp),
            };
            for tick in ticks {
                ohlcv.broadcast_to(&hub, RegistryKey::candles(trade.pair, spec), &tick);
            }
        }
    }

    /// The stored candle of the bucket containing `timestamp`.
    ///
    /// Includes the trade being routed, since it is recorded first.
    async fn recorded_bucket(
        &self,
        pair: PairKey,
        spec: BucketSpec,
        timestamp: i64,
    ) -> Option<Candle> {
        let start = spec.align(timestamp);
        match self
            .store
            .query_ohlcv(pair, spec.duration(), spec.units(), start, start)
            .await
        {
            Ok(candles) => candles
                .into_iter()
                .find(|candle| candle.open_time == start && candle.trade_count > 0),
            Err(e) => {
                tracing::warn!(%pair, %spec, error = %e, "Candle history unavailable");
                None
            }
        }
    }

    async fn route_delta(&self, delta: &OrderBookDelta) {
        if let Err(e) = self.store.apply_order_book_delta(delta).await {
            tracing::warn!(
                pair = %delta.pair,
                sequence = delta.sequence,
                error = %e,
                "Failed to record order book delta"
            );
        }

        let hub = &self.hub;
        hub.manager(ChannelKind::OrderBookFull).broadcast(hub, delta.pair, delta);

        let lite = hub.manager(ChannelKind::OrderBookLite);
        if lite.subscriber_count(&RegistryKey::pair(delta.pair)) > 0 {
            lite.broadcast(hub, delta.pair, &delta.to_lite(self.lite_depth));
        }
    }

    async fn route_snapshot(&self, snapshot: &OrderBookSnapshot) {
        if let Err(e) = self.store.record_order_book(snapshot).await {
            tracing::warn!(
                pair = %snapshot.pair,
                sequence = snapshot.sequence,
                error = %e,
                "Failed to record order book snapshot"
            );
        }

        let hub = &self.hub;
        hub.manager(ChannelKind::OrderBookFull).broadcast(hub, snapshot.pair, snapshot);

        let lite = hub.manager(ChannelKind::OrderBookLite);
        if lite.subscriber_count(&RegistryKey::pair(snapshot.pair)) > 0 {
            lite.broadcast(hub, snapshot.pair, &snapshot.to_lite(self.lite_depth));
        }
    }

    fn route_candle(&self, candle: &Candle) {
        let hub = &self.hub;
        hub.manager(ChannelKind::Ohlcv)
            .broadcast_to(hub, RegistryKey::candles(candle.pair, candle.spec), candle);
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<DomainEvent>,
        tick_interval: Duration,
        cancel: CancellationToken,
    ) {
        let first_tick = tokio::time::Instant::now() + tick_interval;
        let mut ticker = tokio::time::interval_at(first_tick, tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let started = Instant::now();
                    self.route(&event).await;
                    metrics::record_event_routed(event.kind());
                    metrics::record_routing_duration(started.elapsed());
                }
                _ = ticker.tick() => self.roll_candles(Utc::now().timestamp()),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
