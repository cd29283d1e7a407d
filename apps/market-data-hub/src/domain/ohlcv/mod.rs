//! OHLCV Candle Types and Aggregation
//!
//! Candles are open-high-low-close-volume summaries of the trades that fall
//! inside one fixed-width time bucket. The bucket width is
//! `duration × unit`, and bucket boundaries are aligned to the Unix epoch
//! (hourly buckets start at the top of each hour, daily buckets at midnight
//! UTC, and so on).
//!
//! # Live keys vs. replay windows
//!
//! A subscription's `BucketSpec` (`units` + `duration`) selects the live
//! stream. The `from`/`to` fields of `OhlcvParams` only bound the one-time
//! historical replay sent at subscribe time.

use std::collections::HashMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::pair::PairKey;

/// Default bucket count per candle when a subscription omits `duration`.
pub const DEFAULT_DURATION: u32 = 24;

// =============================================================================
// Time Units
// =============================================================================

/// Unit of a candle bucket.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// One second.
    Second,
    /// One minute.
    Minute,
    /// One hour.
    #[default]
    Hour,
    /// One day.
    Day,
    /// One week.
    Week,
}

impl TimeUnit {
    /// Length of one unit in seconds.
    #[must_use]
    pub const fn seconds(self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 604_800,
        }
    }

    /// Canonical unit name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
        }
    }

    /// Parse a unit name, accepting the short aliases clients commonly send.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "sec" | "second" | "seconds" => Some(Self::Second),
            "min" | "minute" | "minutes" => Some(Self::Minute),
            "hour" | "hours" => Some(Self::Hour),
            "day" | "days" => Some(Self::Day),
            "week" | "weeks" => Some(Self::Week),
            _ => None,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Bucket Spec and Params
// =============================================================================

/// Width of a candle bucket. This is the live-delivery key for OHLCV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawBucketSpec")]
pub struct BucketSpec {
    units: TimeUnit,
    duration: u32,
}

#[derive(Deserialize)]
struct RawBucketSpec {
    units: TimeUnit,
    duration: u32,
}

impl TryFrom<RawBucketSpec> for BucketSpec {
    type Error = String;

    fn try_from(raw: RawBucketSpec) -> Result<Self, Self::Error> {
        Self::new(raw.units, raw.duration)
            .ok_or_else(|| format!("invalid bucket width: {} x {}", raw.duration, raw.units))
    }
}

impl Default for BucketSpec {
    fn default() -> Self {
        Self {
            units: TimeUnit::Hour,
            duration: DEFAULT_DURATION,
        }
    }
}

impl BucketSpec {
    /// Create a bucket spec.
    ///
    /// Returns `None` when `duration` is zero or the bucket width would
    /// overflow.
    #[must_use]
    pub fn new(units: TimeUnit, duration: u32) -> Option<Self> {
        if duration == 0 {
            return None;
        }
        units.seconds().checked_mul(i64::from(duration))?;
        Some(Self { units, duration })
    }

    /// Bucket unit.
    #[must_use]
    pub const fn units(&self) -> TimeUnit {
        self.units
    }

    /// Number of units per bucket.
    #[must_use]
    pub const fn duration(&self) -> u32 {
        self.duration
    }

    /// Bucket width in seconds.
    #[must_use]
    pub const fn width_secs(&self) -> i64 {
        self.units.seconds() * self.duration as i64
    }

    /// Start of the bucket containing `timestamp` (unix seconds).
    ///
    /// A timestamp exactly on a boundary belongs to the bucket that starts
    /// there.
    #[must_use]
    pub const fn align(&self, timestamp: i64) -> i64 {
        let width = self.width_secs();
        timestamp.div_euclid(width) * width
    }
}

impl fmt::Display for BucketSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.duration, self.units)
    }
}

/// Normalized OHLCV subscription parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OhlcvParams {
    /// Candle width.
    #[serde(flatten)]
    pub spec: BucketSpec,
    /// Inclusive replay start (unix seconds).
    pub from: i64,
    /// Inclusive replay end (unix seconds).
    pub to: i64,
}

// =============================================================================
// Candle
// =============================================================================

/// One OHLCV candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    /// Pair the candle belongs to.
    pub pair: PairKey,
    /// Candle width.
    #[serde(flatten)]
    pub spec: BucketSpec,
    /// Bucket start (unix seconds, inclusive).
    pub open_time: i64,
    /// Bucket end (unix seconds, inclusive).
    pub close_time: i64,
    /// First trade price.
    pub open: Decimal,
    /// Highest trade price.
    pub high: Decimal,
    /// Lowest trade price.
    pub low: Decimal,
    /// Last trade price.
    pub close: Decimal,
    /// Traded base amount.
    pub volume: Decimal,
    /// Number of trades.
    pub trade_count: u64,
    /// Whether the bucket has closed.
    pub finalized: bool,
}

impl Candle {
    fn from_trade(
        pair: PairKey,
        spec: BucketSpec,
        open_time: i64,
        price: Decimal,
        amount: Decimal,
    ) -> Self {
        Self {
            pair,
            spec,
            open_time,
            close_time: open_time + spec.width_secs() - 1,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: amount,
            trade_count: 1,
            finalized: false,
        }
    }

    /// A bucket with no trades yet, carrying the previous close forward.
    fn flat(pair: PairKey, spec: BucketSpec, open_time: i64, prev_close: Decimal) -> Self {
        Self {
            pair,
            spec,
            open_time,
            close_time: open_time + spec.width_secs() - 1,
            open: prev_close,
            high: prev_close,
            low: prev_close,
            close: prev_close,
            volume: Decimal::ZERO,
            trade_count: 0,
            finalized: false,
        }
    }

    fn apply(&mut self, price: Decimal, amount: Decimal) {
        if self.trade_count == 0 {
            self.open = price;
            self.high = price;
            self.low = price;
        } else {
            self.high = self.high.max(price);
            self.low = self.low.min(price);
        }
        self.close = price;
        self.volume += amount;
        self.trade_count += 1;
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// Maintains the open candle for each `(pair, spec)` and reports every
/// change as a candle tick.
///
/// The aggregator is single-owner: each event-router partition owns one and
/// only sees the pairs hashed onto it, so no locking is needed.
#[derive(Debug, Default)]
pub struct CandleAggregator {
    open: HashMap<(PairKey, BucketSpec), Candle>,
}

impl CandleAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a trade into the open candle for `(pair, spec)`.
    ///
    /// Returns the ticks to publish, oldest first: the finalized previous
    /// candle when the trade opens a new bucket, followed by the candle the
    /// trade landed in. Trades older than the open bucket are ignored.
    pub fn apply_trade(
        &mut self,
        pair: PairKey,
        spec: BucketSpec,
        price: Decimal,
        amount: Decimal,
        timestamp: i64,
    ) -> Vec<Candle> {
        let bucket_start = spec.align(timestamp);

        let Some(current) = self.open.get_mut(&(pair, spec)) else {
            let candle = Candle::from_trade(pair, spec, bucket_start, price, amount);
            self.open.insert((pair, spec), candle.clone());
            return vec![candle];
        };

        if bucket_start < current.open_time {
            tracing::debug!(
                pair = %pair,
                spec = %spec,
                timestamp,
                open_time = current.open_time,
                "Ignoring trade older than open candle"
            );
            return Vec::new();
        }

        if bucket_start == current.open_time {
            current.apply(price, amount);
            return vec![current.clone()];
        }

        let mut finalized = std::mem::replace(
            current,
            Candle::from_trade(pair, spec, bucket_start, price, amount),
        );
        finalized.finalized = true;
        vec![finalized, current.clone()]
    }

    /// Whether a trade at `timestamp` would open a new bucket for
    /// `(pair, spec)` instead of updating the open candle.
    #[must_use]
    pub fn opens_bucket(&self, pair: &PairKey, spec: &BucketSpec, timestamp: i64) -> bool {
        self.open
            .get(&(*pair, *spec))
            .is_none_or(|current| spec.align(timestamp) > current.open_time)
    }

    /// Install `candle` as the open candle of its `(pair, spec)`.
    ///
    /// For buckets whose earlier trades are known from history. Returns the
    /// ticks to publish as `apply_trade` does: the finalized previous candle
    /// if it belonged to an earlier bucket, then `candle`.
    pub fn seed(&mut self, mut candle: Candle) -> Vec<Candle> {
        candle.finalized = false;
        let mut ticks = Vec::with_capacity(2);
        if let Some(mut previous) = self
            .open
            .insert((candle.pair, candle.spec), candle.clone())
            .filter(|previous| previous.open_time < candle.open_time)
        {
            previous.finalized = true;
            ticks.push(previous);
        }
        ticks.push(candle);
        ticks
    }

    /// Close every candle whose bucket ended before `now`.
    ///
    /// Each closed candle is returned with `finalized = true` and replaced
    /// by a flat candle for the bucket containing `now`.
    pub fn roll(&mut self, now: i64) -> Vec<Candle> {
        let mut ticks = Vec::new();
        for ((pair, spec), current) in &mut self.open {
            let bucket_start = spec.align(now);
            if bucket_start <= current.open_time {
                continue;
            }
            let next = Candle::flat(*pair, *spec, bucket_start, current.close);
            let mut finalized = std::mem::replace(current, next);
            finalized.finalized = true;
            ticks.push(finalized);
        }
        ticks.sort_by(|a, b| (a.pair, a.spec).cmp(&(b.pair, b.spec)));
        ticks
    }

    /// Drop candles for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&PairKey, &BucketSpec) -> bool) {
        self.open.retain(|(pair, spec), _| keep(pair, spec));
    }

    /// Specs of `pair` that have an open candle.
    #[must_use]
    pub fn open_specs(&self, pair: &PairKey) -> Vec<BucketSpec> {
        self.open
            .keys()
            .filter(|(open_pair, _)| open_pair == pair)
            .map(|(_, spec)| *spec)
            .collect()
    }

    /// The open candle for `(pair, spec)`, if any.
    #[must_use]
    pub fn open_candle(&self, pair: &PairKey, spec: &BucketSpec) -> Option<&Candle> {
        self.open.get(&(*pair, *spec))
    }

    /// Number of open candles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Whether no candles are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
