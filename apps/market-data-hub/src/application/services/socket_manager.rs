//! Socket Managers
//!
//! One `SocketManager` per channel kind owns that channel's
//! `ChannelRegistry` and is the only thing that writes to it. The
//! `SocketHub` groups the four managers; the process-wide instance is
//! created lazily by `SocketHub::global()`, and tests build isolated hubs
//! with `SocketHub::new()`.
//!
//! # Delivery
//!
//! Broadcast takes a snapshot of one bucket, encodes the payload once and
//! hands the shared frame to each connection's non-blocking sink. A
//! connection whose sink refuses the frame is dropped from every channel
//! and closed; the remaining recipients are unaffected.

use std::sync::{Arc, OnceLock};

use serde::Serialize;

use super::outbound::{self, MessageType};
use crate::application::ports::{OutboundFrame, SharedConnection};
use crate::domain::ohlcv::{BucketSpec, OhlcvParams};
use crate::domain::pair::PairKey;
use crate::domain::subscription::{
    ChannelKind, ChannelRegistry, ConnectionId, RegistryError, RegistryKey, RegistryStats,
    SubscriptionChange,
};
use crate::infrastructure::metrics;

/// Result of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Connections the frame was queued to.
    pub delivered: usize,
    /// Connections dropped because delivery failed.
    pub failed: usize,
}

// =============================================================================
// Socket Manager
// =============================================================================

/// Subscription registry and delivery for one channel.
#[derive(Debug)]
pub struct SocketManager {
    kind: ChannelKind,
    registry: ChannelRegistry<SharedConnection>,
}

impl SocketManager {
    /// Create a manager for `kind`.
    #[must_use]
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            registry: ChannelRegistry::new(),
        }
    }

    /// Channel this manager serves.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Registry key a subscription with `params` lands in.
    ///
    /// OHLCV subscriptions without params use the default bucket spec.
    #[must_use]
    pub fn key_for(&self, pair: PairKey, params: Option<&OhlcvParams>) -> RegistryKey {
        if self.kind.is_parameterized() {
            RegistryKey::candles(pair, params.map(|p| p.spec).unwrap_or_default())
        } else {
            RegistryKey::pair(pair)
        }
    }

    /// Subscribe `conn` to `pair`. Idempotent per connection and pair; a
    /// different bucket spec replaces the previous one.
    pub fn subscribe(
        &self,
        conn: &SharedConnection,
        pair: PairKey,
        params: Option<&OhlcvParams>,
    ) -> SubscriptionChange {
        let key = self.key_for(pair, params);
        let change = self.registry.insert(conn.id(), key, Arc::clone(conn));

        tracing::debug!(
            connection_id = conn.id(),
            channel = self.kind.as_str(),
            key = %key,
            change = ?change,
            "Subscribed"
        );
        self.publish_gauge();
        change
    }

    /// Remove `connection`'s subscription to `pair`. No-op if absent.
    pub fn unsubscribe(&self, connection: ConnectionId, pair: &PairKey) -> Option<RegistryKey> {
        let removed = self.registry.remove(connection, pair);
        if let Some(key) = removed {
            tracing::debug!(
                connection_id = connection,
                channel = self.kind.as_str(),
                key = %key,
                "Unsubscribed"
            );
            self.publish_gauge();
        }
        removed
    }

    /// Remove every subscription `connection` holds on this channel.
    pub fn unsubscribe_all(&self, connection: ConnectionId) -> usize {
        let removed = self.registry.remove_connection(connection).len();
        if removed > 0 {
            tracing::debug!(
                connection_id = connection,
                channel = self.kind.as_str(),
                removed,
                "Removed all subscriptions"
            );
            self.publish_gauge();
        }
        removed
    }

    /// Deliver `payload` as an update to every subscriber of `pair`.
    ///
    /// Only for unparameterized channels; OHLCV uses `broadcast_to`.
    pub fn broadcast<T: Serialize + ?Sized>(
        &self,
        hub: &SocketHub,
        pair: PairKey,
        payload: &T,
    ) -> BroadcastOutcome {
        self.broadcast_to(hub, RegistryKey::pair(pair), payload)
    }

    /// Deliver `payload` as an update to every subscriber of `key`.
    ///
    /// Failed recipients are removed from every channel of `hub` and closed.
    pub fn broadcast_to<T: Serialize + ?Sized>(
        &self,
        hub: &SocketHub,
        key: RegistryKey,
        payload: &T,
    ) -> BroadcastOutcome {
        let members = self.registry.members(&key);
        if members.is_empty() {
            return BroadcastOutcome::default();
        }

        let frame = match outbound::encode(self.kind.as_str(), MessageType::Update, payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(
                    channel = self.kind.as_str(),
                    key = %key,
                    error = %e,
                    "Failed to encode update"
                );
                return BroadcastOutcome::default();
            }
        };

        let mut outcome = BroadcastOutcome::default();
        for conn in members {
            match conn.try_deliver(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(
                        connection_id = conn.id(),
                        channel = self.kind.as_str(),
                        key = %key,
                        reason = e.as_str(),
                        "Delivery failed, dropping connection"
                    );
                    metrics::record_delivery_failed(self.kind);
                    hub.unsubscribe_all(conn.id());
                    conn.close();
                }
            }
        }

        if outcome.delivered > 0 {
            metrics::record_messages_delivered(self.kind, outcome.delivered as u64);
        }
        outcome
    }

    /// Send a `{code, message}` error to a single connection.
    ///
    /// Best effort, never fails the caller.
    pub fn send_error_message(&self, conn: &SharedConnection, code: &'static str, message: &str) {
        send_error(conn, self.kind.as_str(), code, message);
    }

    /// Bucket specs of `pair` that have subscribers.
    #[must_use]
    pub fn active_specs(&self, pair: &PairKey) -> Vec<BucketSpec> {
        self.registry.active_specs(pair)
    }

    /// Whether `connection` is subscribed under exactly `key`.
    #[must_use]
    pub fn is_subscribed(&self, connection: ConnectionId, key: &RegistryKey) -> bool {
        self.registry.contains(connection, key)
    }

    /// Number of subscribers of `key`.
    #[must_use]
    pub fn subscriber_count(&self, key: &RegistryKey) -> usize {
        self.registry.member_count(key)
    }

    /// Registry counts.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Verify registry consistency, logging any violation.
    ///
    /// # Errors
    ///
    /// Returns the violation found.
    pub fn check_invariants(&self) -> Result<(), RegistryError> {
        self.registry.check_invariants().inspect_err(|e| {
            tracing::error!(
                channel = self.kind.as_str(),
                error = %e,
                "Registry invariant violated"
            );
        })
    }

    fn publish_gauge(&self) {
        metrics::set_subscriptions(self.kind, self.registry.subscription_count());
    }
}

/// Send a `{code, message}` error frame on `channel` to one connection.
pub fn send_error(conn: &SharedConnection, channel: &str, code: &'static str, message: &str) {
    metrics::record_client_error(code);
    match outbound::encode_error(channel, code, message) {
        Ok(frame) => deliver_one(conn, frame, channel),
        Err(e) => {
            tracing::error!(connection_id = conn.id(), code, error = %e, "Failed to encode error");
        }
    }
}

fn deliver_one(conn: &SharedConnection, frame: OutboundFrame, channel: &str) {
    if let Err(e) = conn.try_deliver(frame) {
        tracing::warn!(
            connection_id = conn.id(),
            channel,
            reason = e.as_str(),
            "Direct send failed, closing connection"
        );
        conn.close();
    }
}

// =============================================================================
// Socket Hub
// =============================================================================

/// Per-channel subscription stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Lite order book channel.
    pub order_book_lite: RegistryStats,
    /// Full order book channel.
    pub order_book_full: RegistryStats,
    /// Trades channel.
    pub trades: RegistryStats,
    /// OHLCV channel.
    pub ohlcv: RegistryStats,
}

/// The four socket managers of a process.
#[derive(Debug)]
pub struct SocketHub {
    order_book_lite: SocketManager,
    order_book_full: SocketManager,
    trades: SocketManager,
    ohlcv: SocketManager,
}

/// Shared handle to a socket hub.
pub type SharedSocketHub = Arc<SocketHub>;

static GLOBAL_HUB: OnceLock<SharedSocketHub> = OnceLock::new();

impl Default for SocketHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketHub {
    /// Create an isolated hub with empty registries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            order_book_lite: SocketManager::new(ChannelKind::OrderBookLite),
            order_book_full: SocketManager::new(ChannelKind::OrderBookFull),
            trades: SocketManager::new(ChannelKind::Trades),
            ohlcv: SocketManager::new(ChannelKind::Ohlcv),
        }
    }

    /// The process-wide hub, created on first use.
    #[must_use]
    pub fn global() -> SharedSocketHub {
        Arc::clone(GLOBAL_HUB.get_or_init(|| Arc::new(Self::new())))
    }

    /// Manager for `kind`.
    #[must_use]
    pub const fn manager(&self, kind: ChannelKind) -> &SocketManager {
        match kind {
            ChannelKind::OrderBookLite => &self.order_book_lite,
            ChannelKind::OrderBookFull => &self.order_book_full,
            ChannelKind::Trades => &self.trades,
            ChannelKind::Ohlcv => &self.ohlcv,
        }
    }

    /// Remove `connection` from every channel.
    pub fn unsubscribe_all(&self, connection: ConnectionId) -> usize {
        ChannelKind::all()
            .iter()
            .map(|kind| self.manager(*kind).unsubscribe_all(connection))
            .sum()
    }

    /// Stats for every channel.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            order_book_lite: self.order_book_lite.stats(),
            order_book_full: self.order_book_full.stats(),
            trades: self.trades.stats(),
            ohlcv: self.ohlcv.stats(),
        }
    }

    /// Verify every registry.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn check_invariants(&self) -> Result<(), RegistryError> {
        for kind in ChannelKind::all() {
            self.manager(*kind).check_invariants()?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
