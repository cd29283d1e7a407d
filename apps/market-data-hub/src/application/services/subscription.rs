//! Subscription Service
//!
//! Handles one inbound payload for one channel: decode, apply to the
//! channel's socket manager, and on subscribe send the historical snapshot
//! (`INIT`) the new subscriber starts from.
//!
//! # Snapshot ordering
//!
//! The subscriber is registered before the store is queried, so no live
//! update is missed. Updates routed while the query runs are held back and
//! delivered right after `INIT`. Some of them may already be reflected in
//! the snapshot; clients drop book updates whose sequence is not above the
//! snapshot's and de-duplicate trades by id.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use super::decoder::{self, DecodeError, SubscriptionEvent, SubscriptionIntent};
use super::outbound::{self, MessageType};
use super::socket_manager::SharedSocketHub;
use crate::application::ports::{
    ConnectionSink, DeliveryError, MarketDataStore, OutboundFrame, SharedConnection, TradeFilter,
};
use crate::domain::subscription::{ChannelKind, ConnectionId};
use crate::infrastructure::metrics;

/// Live frames held per subscriber while its snapshot is loading.
pub const PENDING_FRAME_LIMIT: usize = 256;

/// Applies client subscription requests to a socket hub.
pub struct SubscriptionService {
    hub: SharedSocketHub,
    store: Arc<dyn MarketDataStore>,
    lite_depth: usize,
}

impl std::fmt::Debug for SubscriptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionService")
            .field("lite_depth", &self.lite_depth)
            .finish_non_exhaustive()
    }
}

impl SubscriptionService {
    /// Create a service over `hub`, replaying history from `store`.
    ///
    /// `lite_depth` is the number of price levels per side in lite book
    /// snapshots.
    #[must_use]
    pub fn new(hub: SharedSocketHub, store: Arc<dyn MarketDataStore>, lite_depth: usize) -> Self {
        Self {
            hub,
            store,
            lite_depth,
        }
    }

    /// The hub this service mutates.
    #[must_use]
    pub const fn hub(&self) -> &SharedSocketHub {
        &self.hub
    }

    /// Handle one raw payload received from `conn` on `channel`.
    ///
    /// Decode failures are replied to `conn` and leave the registry
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns the `DecodeError` that was replied, for the caller's logs.
    pub async fn handle_payload(
        &self,
        conn: &SharedConnection,
        channel: ChannelKind,
        raw: &str,
    ) -> Result<SubscriptionIntent, DecodeError> {
        let manager = self.hub.manager(channel);

        let intent = match decoder::decode(raw, channel, Utc::now().timestamp()) {
            Ok(intent) => intent,
            Err(e) => {
                tracing::debug!(
                    connection_id = conn.id(),
                    channel = channel.as_str(),
                    code = e.code(),
                    error = %e,
                    "Rejected payload"
                );
                manager.send_error_message(conn, e.code(), &e.to_string());
                return Err(e);
            }
        };

        match intent.event {
            SubscriptionEvent::Subscribe => {
                let gate = Arc::new(SnapshotGate::new(Arc::clone(conn)));
                let handle = Arc::clone(&gate) as SharedConnection;
                manager.subscribe(&handle, intent.pair, intent.params.as_ref());
                let snapshot = self.snapshot_frame(conn.id(), channel, &intent).await;
                gate.release(snapshot, channel.as_str());
            }
            SubscriptionEvent::Unsubscribe => {
                manager.unsubscribe(conn.id(), &intent.pair);
            }
        }

        Ok(intent)
    }

    /// Encode the `INIT` snapshot for a fresh subscription.
    ///
    /// Store failures become an error frame; the subscription stays.
    async fn snapshot_frame(
        &self,
        connection_id: ConnectionId,
        channel: ChannelKind,
        intent: &SubscriptionIntent,
    ) -> Option<OutboundFrame> {
        let name = channel.as_str();
        let pair = intent.pair;
        let encoded = match channel {
            ChannelKind::Trades => self
                .store
                .query_trades(TradeFilter::Pair(pair))
                .await
                .map(|trades| outbound::encode(name, MessageType::Init, &trades)),
            ChannelKind::OrderBookLite => self.store.query_order_book(pair).await.map(|book| {
                outbound::encode(name, MessageType::Init, &book.to_lite(self.lite_depth))
            }),
            ChannelKind::OrderBookFull => self
                .store
                .query_order_book(pair)
                .await
                .map(|book| outbound::encode(name, MessageType::Init, &book)),
            ChannelKind::Ohlcv => {
                let params = intent.params?;
                let spec = params.spec;
                self.store
                    .query_ohlcv(pair, spec.duration(), spec.units(), params.from, params.to)
                    .await
                    .map(|candles| outbound::encode(name, MessageType::Init, &candles))
            }
        };

        let frame = encoded.unwrap_or_else(|e| {
            tracing::warn!(
                connection_id,
                channel = name,
                pair = %pair,
                error = %e,
                "Snapshot query failed"
            );
            metrics::record_client_error(e.code());
            outbound::encode_error(name, e.code(), &e.to_string())
        });

        match frame {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!(
                    connection_id,
                    channel = name,
                    error = %e,
                    "Failed to encode snapshot"
                );
                None
            }
        }
    }
}

// =============================================================================
// Snapshot Gate
// =============================================================================

/// Registry handle for a subscriber whose snapshot is still loading.
///
/// Buffers live frames until `release`, then passes them straight through.
struct SnapshotGate {
    inner: SharedConnection,
    pending: Mutex<Option<Vec<OutboundFrame>>>,
}

impl SnapshotGate {
    fn new(inner: SharedConnection) -> Self {
        Self {
            inner,
            pending: Mutex::new(Some(Vec::new())),
        }
    }

    /// Deliver `first`, then everything buffered, and stop buffering.
    fn release(&self, first: Option<OutboundFrame>, channel: &str) {
        let mut pending = self.pending.lock();
        let frames = first.into_iter().chain(pending.take().unwrap_or_default());
        for frame in frames {
            if let Err(e) = self.inner.try_deliver(frame) {
                tracing::warn!(
                    connection_id = self.inner.id(),
                    channel,
                    reason = e.as_str(),
                    "Snapshot send failed, closing connection"
                );
                self.inner.close();
                break;
            }
        }
    }
}

impl ConnectionSink for SnapshotGate {
    fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    fn try_deliver(&self, frame: OutboundFrame) -> Result<(), DeliveryError> {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            None => self.inner.try_deliver(frame),
            Some(_) if self.inner.is_closed() => Err(DeliveryError::Closed),
            Some(frames) if frames.len() >= PENDING_FRAME_LIMIT => Err(DeliveryError::QueueFull),
            Some(frames) => {
                frames.push(frame);
                Ok(())
            }
        }
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use serde_json::{Value, json};
    use tokio::sync::{Notify, mpsc};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::application::ports::StoreError;
    use crate::application::ports::store::MockMarketDataStore;
    use crate::application::services::socket_manager::SocketHub;
    use crate::domain::ohlcv::{BucketSpec, Candle, TimeUnit};
    use crate::domain::pair::{Address, PairKey, parse_pair};
    use crate::domain::streaming::{BookOrder, OrderBookDelta, OrderBookSnapshot, Side, Trade};
    use crate::domain::subscription::RegistryKey;
    use crate::infrastructure::connection::ConnectionHandle;

    const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
    const DAI: &str = "0x6b175474e89094c44da98b954eedeac495271d0f";
    const ZERO: &str = "0x0000000000000000000000000000000000000000";

    fn pair() -> PairKey {
        parse_pair(WETH, DAI).unwrap()
    }

    fn payload(event: &str, base: &str, params: Option<Value>) -> String {
        let mut data = json!({"event": event, "pair": {"baseToken": base, "quoteToken": DAI}});
        if let Some(params) = params {
            data["params"] = params;
        }
        json!({"type": "subscription", "data": data}).to_string()
    }

    fn connect() -> (SharedConnection, mpsc::Receiver<OutboundFrame>) {
        let (handle, rx) = ConnectionHandle::new(1, 16, CancellationToken::new());
        (Arc::new(handle), rx)
    }

    fn next_frame(rx: &mut mpsc::Receiver<OutboundFrame>) -> Value {
        serde_json::from_str(rx.try_recv().unwrap().as_str()).unwrap()
    }

    fn service(store: MockMarketDataStore) -> SubscriptionService {
        SubscriptionService::new(Arc::new(SocketHub::new()), Arc::new(store), 2)
    }

    fn trade() -> Trade {
        Trade {
            id: Uuid::new_v4(),
            pair: pair(),
            maker: Address::new([1; 20]),
            taker: Address::new([2; 20]),
            price: Decimal::from_str("1850.5").unwrap(),
            amount: Decimal::ONE,
            side: Side::Buy,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn subscribe_trades_registers_and_sends_init() {
        let mut store = MockMarketDataStore::new();
        store
            .expect_query_trades()
            .withf(|filter| *filter == TradeFilter::Pair(pair()))
            .times(1)
            .returning(|_| Ok(vec![trade()]));
        let service = service(store);
        let (conn, mut rx) = connect();

        let intent = service
            .handle_payload(&conn, ChannelKind::Trades, &payload("subscribe", WETH, None))
            .await
            .unwrap();

        assert_eq!(intent.event, SubscriptionEvent::Subscribe);
        let trades = service.hub().manager(ChannelKind::Trades);
        assert!(trades.is_subscribed(1, &RegistryKey::pair(pair())));
        let frame = next_frame(&mut rx);
        assert_eq!(frame["payload"]["type"], "INIT");
        assert_eq!(frame["payload"]["data"][0]["price"], "1850.5");
    }

    /// Store whose book query waits until the test releases it.
    #[derive(Default)]
    struct SlowBookStore {
        querying: Notify,
        release: Notify,
    }

    #[async_trait]
    impl MarketDataStore for SlowBookStore {
        async fn query_ohlcv(
            &self,
            pair: PairKey,
            _duration: u32,
            _units: TimeUnit,
            _from: i64,
            _to: i64,
        ) -> Result<Vec<Candle>, StoreError> {
            Err(StoreError::NotFound(pair.to_string()))
        }

        async fn query_order_book(&self, pair: PairKey) -> Result<OrderBookSnapshot, StoreError> {
            self.querying.notify_one();
            self.release.notified().await;
            Ok(OrderBookSnapshot {
                pair,
                sequence: 1,
                bids: Vec::new(),
                asks: Vec::new(),
            })
        }

        async fn query_trades(&self, _filter: TradeFilter) -> Result<Vec<Trade>, StoreError> {
            Ok(Vec::new())
        }

        async fn record_trade(&self, _trade: &Trade) -> Result<(), StoreError> {
            Ok(())
        }

        async fn record_order_book(&self, _snapshot: &OrderBookSnapshot) -> Result<(), StoreError> {
            Ok(())
        }

        async fn apply_order_book_delta(&self, _delta: &OrderBookDelta) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn updates_during_snapshot_load_follow_init() {
        let hub = Arc::new(SocketHub::new());
        let store = Arc::new(SlowBookStore::default());
        let service = Arc::new(SubscriptionService::new(Arc::clone(&hub), store.clone(), 2));
        let (conn, mut rx) = connect();

        let subscribing = tokio::spawn({
            let service = Arc::clone(&service);
            let conn = Arc::clone(&conn);
            async move {
                let raw = payload("subscribe", WETH, None);
                service
                    .handle_payload(&conn, ChannelKind::OrderBookFull, &raw)
                    .await
            }
        });

        store.querying.notified().await;
        let delta = OrderBookDelta {
            pair: pair(),
            sequence: 2,
            orders: Vec::new(),
            bids: Vec::new(),
            asks: Vec::new(),
        };
        hub.manager(ChannelKind::OrderBookFull).broadcast(&hub, pair(), &delta);
        assert!(rx.try_recv().is_err());

        store.release.notify_one();
        subscribing.await.unwrap().unwrap();

        let init = next_frame(&mut rx);
        assert_eq!(init["payload"]["type"], "INIT");
        assert_eq!(init["payload"]["data"]["sequence"], 1);
        let update = next_frame(&mut rx);
        assert_eq!(update["payload"]["type"], "UPDATE");
        assert_eq!(update["payload"]["data"]["sequence"], 2);

        hub.manager(ChannelKind::OrderBookFull).broadcast(&hub, pair(), &delta);
        assert_eq!(next_frame(&mut rx)["payload"]["type"], "UPDATE");
    }

    #[tokio::test]
    async fn lite_snapshot_is_aggregated() {
        let mut store = MockMarketDataStore::new();
        store.expect_query_order_book().returning(|pair| {
            let order = |price: i64| BookOrder {
                id: Uuid::new_v4(),
                side: Side::Buy,
                price: Decimal::from(price),
                amount: Decimal::ONE,
                maker: Address::new([1; 20]),
            };
            Ok(OrderBookSnapshot {
                pair,
                sequence: 1,
                bids: vec![order(10), order(10), order(9), order(8)],
                asks: Vec::new(),
            })
        });
        let service = service(store);
        let (conn, mut rx) = connect();

        service
            .handle_payload(&conn, ChannelKind::OrderBookLite, &payload("subscribe", WETH, None))
            .await
            .unwrap();

        let frame = next_frame(&mut rx);
        let bids = frame["payload"]["data"]["bids"].as_array().unwrap();
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0]["amount"], "2");
    }

    #[tokio::test]
    async fn ohlcv_snapshot_uses_requested_window() {
        let mut store = MockMarketDataStore::new();
        store
            .expect_query_ohlcv()
            .withf(|_, duration, units, from, to| {
                *duration == 5 && *units == TimeUnit::Minute && *from == 100 && *to == 200
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(Vec::new()));
        let service = service(store);
        let (conn, mut rx) = connect();

        service
            .handle_payload(
                &conn,
                ChannelKind::Ohlcv,
                &payload(
                    "subscribe",
                    WETH,
                    Some(json!({"units": "min", "duration": 5, "from": 100, "to": 200})),
                ),
            )
            .await
            .unwrap();

        let key = RegistryKey::candles(pair(), BucketSpec::new(TimeUnit::Minute, 5).unwrap());
        assert!(service.hub().manager(ChannelKind::Ohlcv).is_subscribed(1, &key));
        assert_eq!(next_frame(&mut rx)["payload"]["data"], json!([]));
    }

    #[tokio::test]
    async fn missing_book_replies_not_found_and_keeps_subscription() {
        let mut store = MockMarketDataStore::new();
        store
            .expect_query_order_book()
            .returning(|pair| Err(StoreError::NotFound(pair.to_string())));
        let service = service(store);
        let (conn, mut rx) = connect();

        service
            .handle_payload(&conn, ChannelKind::OrderBookFull, &payload("subscribe", WETH, None))
            .await
            .unwrap();

        let frame = next_frame(&mut rx);
        assert_eq!(frame["payload"]["type"], "ERROR");
        assert_eq!(frame["payload"]["data"]["code"], "NOT_FOUND");
        assert_eq!(service.hub().stats().order_book_full.subscription_count, 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_without_store_access() {
        let mut store = MockMarketDataStore::new();
        store.expect_query_trades().times(1).returning(|_| Ok(Vec::new()));
        let service = service(store);
        let (conn, _rx) = connect();

        service
            .handle_payload(&conn, ChannelKind::Trades, &payload("subscribe", WETH, None))
            .await
            .unwrap();
        service
            .handle_payload(&conn, ChannelKind::Trades, &payload("unsubscribe", WETH, None))
            .await
            .unwrap();

        assert_eq!(service.hub().stats().trades.subscription_count, 0);
    }

    #[tokio::test]
    async fn ping_is_rejected_without_mutation() {
        let mut store = MockMarketDataStore::new();
        store.expect_query_trades().never();
        let service = service(store);
        let (conn, mut rx) = connect();

        let err = service
            .handle_payload(&conn, ChannelKind::Trades, r#"{"type":"ping"}"#)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "UNKNOWN_PAYLOAD_TYPE");
        assert_eq!(next_frame(&mut rx)["payload"]["data"]["code"], "UNKNOWN_PAYLOAD_TYPE");
        assert!(rx.try_recv().is_err());
        assert_eq!(service.hub().stats().trades.subscription_count, 0);
    }

    #[tokio::test]
    async fn zero_base_token_is_rejected_without_mutation() {
        let mut store = MockMarketDataStore::new();
        store.expect_query_ohlcv().never();
        let service = service(store);
        let (conn, mut rx) = connect();

        let err = service
            .handle_payload(&conn, ChannelKind::Ohlcv, &payload("subscribe", ZERO, None))
            .await
            .unwrap_err();

        assert!(matches!(err, DecodeError::InvalidPair(_)));
        assert_eq!(next_frame(&mut rx)["payload"]["data"]["code"], "INVALID_PAIR_BASE_TOKEN");
        assert_eq!(service.hub().stats().ohlcv.subscription_count, 0);
    }
}
