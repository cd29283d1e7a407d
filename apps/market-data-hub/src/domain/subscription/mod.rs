//! Subscription Registry Types
//!
//! Domain types for tracking which connections want which market data
//! streams.
//!
//! # Design
//!
//! A `ChannelRegistry` maps a `RegistryKey` (pair, plus the bucket spec for
//! OHLCV) to the set of subscribed connections. It keeps two indexes:
//!
//! - `buckets`: pair → spec → connection id → connection handle, used by
//!   broadcast to reach exactly the subscribers of one key
//! - `memberships`: connection id → pair → spec, used by unsubscribe and
//!   connection teardown without scanning every bucket
//!
//! Both indexes are sharded `DashMap`s, so operations on different pairs do
//! not contend on a global lock. Mutations always lock `memberships` before
//! `buckets`; readers that need both copy one side out first.
//!
//! The total subscription count is kept in an atomic counter updated under
//! the membership entry lock, so reading it never touches the shards.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::domain::ohlcv::BucketSpec;
use crate::domain::pair::PairKey;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a client connection.
pub type ConnectionId = u64;

/// Data channel a subscription targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Aggregated top-of-book.
    OrderBookLite,
    /// Full order depth.
    OrderBookFull,
    /// Executed trades.
    Trades,
    /// Candles.
    Ohlcv,
}

impl ChannelKind {
    /// Get all channel kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::OrderBookLite,
            Self::OrderBookFull,
            Self::Trades,
            Self::Ohlcv,
        ]
    }

    /// Wire name of the channel.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OrderBookLite => "order_book_lite",
            Self::OrderBookFull => "order_book_full",
            Self::Trades => "trades",
            Self::Ohlcv => "ohlcv",
        }
    }

    /// Look up a channel by wire name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::all().iter().copied().find(|kind| kind.as_str() == raw)
    }

    /// Whether subscriptions on this channel carry bucket parameters.
    #[must_use]
    pub const fn is_parameterized(self) -> bool {
        matches!(self, Self::Ohlcv)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of one registry bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    /// Subscribed pair.
    pub pair: PairKey,
    /// Candle width, for OHLCV buckets only.
    pub spec: Option<BucketSpec>,
}

impl RegistryKey {
    /// Key for an unparameterized channel.
    #[must_use]
    pub const fn pair(pair: PairKey) -> Self {
        Self { pair, spec: None }
    }

    /// Key for an OHLCV bucket.
    #[must_use]
    pub const fn candles(pair: PairKey, spec: BucketSpec) -> Self {
        Self {
            pair,
            spec: Some(spec),
        }
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.spec {
            Some(spec) => write!(f, "{}@{spec}", self.pair),
            None => write!(f, "{}", self.pair),
        }
    }
}

/// Effect of a subscribe on the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// The connection was not subscribed to the pair before.
    Added,
    /// The connection moved from another bucket of the same pair.
    Replaced {
        /// Bucket the connection left.
        previous: RegistryKey,
    },
    /// The connection was already in this bucket.
    Unchanged,
}

/// Registry consistency error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A membership entry has no matching bucket entry.
    #[error("connection {connection} records {key} but is missing from its bucket")]
    OrphanedMembership {
        /// Connection id.
        connection: ConnectionId,
        /// Recorded key.
        key: RegistryKey,
    },
    /// A bucket entry has no matching membership entry.
    #[error("connection {connection} is in bucket {key} without a membership record")]
    MissingMembership {
        /// Connection id.
        connection: ConnectionId,
        /// Bucket key.
        key: RegistryKey,
    },
    /// An empty bucket was left behind.
    #[error("empty bucket left for {key}")]
    EmptyBucket {
        /// Bucket key.
        key: RegistryKey,
    },
}

// =============================================================================
// Statistics
// =============================================================================

/// Counts for one registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    /// Pairs with at least one subscriber.
    pub pair_count: usize,
    /// Non-empty buckets.
    pub bucket_count: usize,
    /// Connections with at least one subscription.
    pub connection_count: usize,
    /// Total subscriptions.
    pub subscription_count: usize,
}

// =============================================================================
// Channel Registry
// =============================================================================

type SpecBuckets<C> = HashMap<Option<BucketSpec>, HashMap<ConnectionId, C>>;

/// Thread-safe registry of subscriptions for one channel.
///
/// `C` is the per-connection handle stored in each bucket and cloned out on
/// lookup, typically an `Arc`.
pub struct ChannelRegistry<C> {
    buckets: DashMap<PairKey, SpecBuckets<C>>,
    memberships: DashMap<ConnectionId, HashMap<PairKey, Option<BucketSpec>>>,
    subscriptions: AtomicUsize,
}

impl<C> Default for ChannelRegistry<C> {
    fn default() -> Self {
        Self {
            buckets: DashMap::new(),
            memberships: DashMap::new(),
            subscriptions: AtomicUsize::new(0),
        }
    }
}

impl<C> fmt::Debug for ChannelRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}

impl<C> ChannelRegistry<C> {
    /// Total subscriptions across every bucket.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Acquire)
    }
}

impl<C: Clone> ChannelRegistry<C> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `connection` to `key`.
    ///
    /// A connection holds at most one bucket per pair: subscribing to a
    /// different spec of an already-subscribed pair moves it.
    pub fn insert(
        &self,
        connection: ConnectionId,
        key: RegistryKey,
        handle: C,
    ) -> SubscriptionChange {
        let mut membership = self.memberships.entry(connection).or_default();
        let previous = membership.insert(key.pair, key.spec);

        let change = match previous {
            None => {
                self.subscriptions.fetch_add(1, Ordering::AcqRel);
                SubscriptionChange::Added
            }
            Some(spec) if spec == key.spec => SubscriptionChange::Unchanged,
            Some(spec) => {
                let previous = RegistryKey {
                    pair: key.pair,
                    spec,
                };
                self.remove_from_bucket(connection, previous);
                SubscriptionChange::Replaced { previous }
            }
        };

        self.buckets
            .entry(key.pair)
            .or_default()
            .entry(key.spec)
            .or_default()
            .insert(connection, handle);
        drop(membership);

        change
    }

    /// Remove `connection`'s subscription to `pair`.
    ///
    /// Returns the key it was subscribed under, or `None` if it was not
    /// subscribed.
    pub fn remove(&self, connection: ConnectionId, pair: &PairKey) -> Option<RegistryKey> {
        let Entry::Occupied(mut membership) = self.memberships.entry(connection) else {
            return None;
        };
        let spec = membership.get_mut().remove(pair)?;
        self.subscriptions.fetch_sub(1, Ordering::AcqRel);
        let key = RegistryKey { pair: *pair, spec };
        self.remove_from_bucket(connection, key);
        if membership.get().is_empty() {
            membership.remove();
        }
        Some(key)
    }

    /// Remove every subscription held by `connection`.
    ///
    /// Returns the keys it was removed from.
    pub fn remove_connection(&self, connection: ConnectionId) -> Vec<RegistryKey> {
        let Entry::Occupied(membership) = self.memberships.entry(connection) else {
            return Vec::new();
        };
        let keys: Vec<RegistryKey> = membership
            .get()
            .iter()
            .map(|(pair, spec)| RegistryKey {
                pair: *pair,
                spec: *spec,
            })
            .collect();
        for key in &keys {
            self.remove_from_bucket(connection, *key);
        }
        self.subscriptions.fetch_sub(keys.len(), Ordering::AcqRel);
        membership.remove();
        keys
    }

    /// Snapshot of the handles subscribed to `key`.
    #[must_use]
    pub fn members(&self, key: &RegistryKey) -> Vec<C> {
        self.buckets
            .get(&key.pair)
            .and_then(|specs| specs.get(&key.spec).map(|conns| conns.values().cloned().collect()))
            .unwrap_or_default()
    }

    /// Number of connections subscribed to `key`.
    #[must_use]
    pub fn member_count(&self, key: &RegistryKey) -> usize {
        self.buckets
            .get(&key.pair)
            .and_then(|specs| specs.get(&key.spec).map(HashMap::len))
            .unwrap_or(0)
    }

    /// Whether `connection` is subscribed to exactly `key`.
    #[must_use]
    pub fn contains(&self, connection: ConnectionId, key: &RegistryKey) -> bool {
        self.subscription_of(connection, &key.pair) == Some(*key)
    }

    /// The key `connection` is subscribed under for `pair`, if any.
    #[must_use]
    pub fn subscription_of(&self, connection: ConnectionId, pair: &PairKey) -> Option<RegistryKey> {
        self.memberships
            .get(&connection)
            .and_then(|membership| membership.get(pair).copied())
            .map(|spec| RegistryKey { pair: *pair, spec })
    }

    /// Bucket specs of `pair` that have at least one subscriber.
    #[must_use]
    pub fn active_specs(&self, pair: &PairKey) -> Vec<BucketSpec> {
        self.buckets
            .get(pair)
            .map(|specs| specs.keys().filter_map(|spec| *spec).collect())
            .unwrap_or_default()
    }

    /// Current registry counts.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            pair_count: self.buckets.len(),
            connection_count: self.memberships.len(),
            subscription_count: self.subscription_count(),
            ..RegistryStats::default()
        };
        for specs in &self.buckets {
            stats.bucket_count += specs.len();
        }
        stats
    }

    /// Verify that both indexes agree and no empty bucket is left.
    ///
    /// Only meaningful while no mutation is in flight.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn check_invariants(&self) -> Result<(), RegistryError> {
        let recorded: Vec<(ConnectionId, RegistryKey)> = self
            .memberships
            .iter()
            .flat_map(|membership| {
                let connection = *membership.key();
                membership
                    .iter()
                    .map(|(pair, spec)| {
                        (
                            connection,
                            RegistryKey {
                                pair: *pair,
                                spec: *spec,
                            },
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut bucketed: Vec<(ConnectionId, RegistryKey)> = Vec::new();
        for specs in &self.buckets {
            let pair = *specs.key();
            if specs.is_empty() {
                return Err(RegistryError::EmptyBucket {
                    key: RegistryKey::pair(pair),
                });
            }
            for (spec, conns) in specs.iter() {
                let key = RegistryKey { pair, spec: *spec };
                if conns.is_empty() {
                    return Err(RegistryError::EmptyBucket { key });
                }
                bucketed.extend(conns.keys().map(|connection| (*connection, key)));
            }
        }

        for (connection, key) in &recorded {
            if !bucketed.contains(&(*connection, *key)) {
                return Err(RegistryError::OrphanedMembership {
                    connection: *connection,
                    key: *key,
                });
            }
        }
        for (connection, key) in &bucketed {
            if !recorded.contains(&(*connection, *key)) {
                return Err(RegistryError::MissingMembership {
                    connection: *connection,
                    key: *key,
                });
            }
        }
        Ok(())
    }

    /// Drop `connection` from one bucket, pruning emptied buckets.
    fn remove_from_bucket(&self, connection: ConnectionId, key: RegistryKey) {
        if let Some(mut specs) = self.buckets.get_mut(&key.pair) {
            if let Some(conns) = specs.get_mut(&key.spec) {
                conns.remove(&connection);
                if conns.is_empty() {
                    specs.remove(&key.spec);
                }
            }
        }
        self.buckets.remove_if(&key.pair, |_, specs| specs.is_empty());
    }
}

// =============================================================================
// Tests
// =============================================================================
