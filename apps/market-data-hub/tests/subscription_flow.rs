//! Subscription Flow Integration Tests
//!
//! Drives the subscription service and event router together: payloads in,
//! registry changes, snapshots and routed updates out.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use market_data_hub::application::ports::OutboundFrame;
use market_data_hub::domain::streaming::{BookOrder, Side};
use market_data_hub::{
    Address, BucketSpec, ChannelKind, ConnectionHandle, DomainEvent, EventRouter,
    InMemoryMarketStore, MarketDataStore, OrderBookSnapshot, PairKey, RegistryKey, RouterConfig,
    SharedConnection, SocketHub, SubscriptionService, TimeUnit, Trade, TradeFilter,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct Fixture {
    hub: Arc<SocketHub>,
    store: Arc<InMemoryMarketStore>,
    service: SubscriptionService,
}

impl Fixture {
    fn new() -> Self {
        let hub = Arc::new(SocketHub::new());
        let store = Arc::new(InMemoryMarketStore::default());
        let service = SubscriptionService::new(Arc::clone(&hub), store.clone(), 10);
        Self { hub, store, service }
    }

    /// Start a router recording into the fixture's store.
    fn spawn_router(&self, cancel: &CancellationToken) -> EventRouter {
        let config = RouterConfig::default();
        let (router, _handles) =
            EventRouter::spawn(Arc::clone(&self.hub), self.store.clone(), &config, cancel);
        router
    }

    async fn send(&self, conn: &SharedConnection, channel: ChannelKind, payload: &Value) {
        let _ = self
            .service
            .handle_payload(conn, channel, &payload.to_string())
            .await;
    }

    fn total_subscriptions(&self) -> usize {
        let stats = self.hub.stats();
        stats.order_book_lite.subscription_count
            + stats.order_book_full.subscription_count
            + stats.trades.subscription_count
            + stats.ohlcv.subscription_count
    }
}

fn address(n: u8) -> Address {
    Address::new([n; 20])
}

fn hex(n: u8) -> String {
    format!("0x{}", format!("{n:02x}").repeat(20))
}

fn pair(base: u8, quote: u8) -> PairKey {
    PairKey::new(address(base), address(quote)).unwrap()
}

fn connect(id: u64, capacity: usize) -> (SharedConnection, mpsc::Receiver<OutboundFrame>) {
    let (handle, rx) = ConnectionHandle::new(id, capacity, CancellationToken::new());
    (Arc::new(handle), rx)
}

fn subscription(event: &str, base: u8, quote: u8, params: Option<Value>) -> Value {
    let mut data = json!({
        "event": event,
        "pair": { "baseToken": hex(base), "quoteToken": hex(quote) },
    });
    if let Some(params) = params {
        data["params"] = params;
    }
    json!({ "type": "subscription", "data": data })
}

fn drain(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(frame.as_str()).unwrap());
    }
    frames
}

async fn next_frame(rx: &mut mpsc::Receiver<OutboundFrame>) -> Value {
    let frame = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    serde_json::from_str(frame.as_str()).unwrap()
}

fn trade(pair: PairKey, price: i64, ts: i64) -> Trade {
    Trade {
        id: Uuid::new_v4(),
        pair,
        maker: address(7),
        taker: address(8),
        price: Decimal::from(price),
        amount: Decimal::ONE,
        side: Side::Buy,
        timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
    }
}

fn order(side: Side, price: i64, amount: i64) -> BookOrder {
    BookOrder {
        id: Uuid::new_v4(),
        side,
        price: Decimal::from(price),
        amount: Decimal::from(amount),
        maker: address(7),
    }
}

// =============================================================================
// Client Input Errors
// =============================================================================

#[tokio::test]
async fn ping_payload_gets_one_error_and_no_mutation() {
    let fixture = Fixture::new();
    let (conn, mut rx) = connect(1, 8);

    fixture.send(&conn, ChannelKind::Trades, &json!({"type": "ping"})).await;

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["payload"]["type"], "ERROR");
    assert_eq!(frames[0]["payload"]["data"]["code"], "UNKNOWN_PAYLOAD_TYPE");
    assert_eq!(fixture.total_subscriptions(), 0);
}

#[tokio::test]
async fn zero_base_token_is_rejected_without_mutation() {
    let fixture = Fixture::new();
    let (conn, mut rx) = connect(1, 8);

    fixture
        .send(&conn, ChannelKind::OrderBookFull, &subscription("subscribe", 0, 2, None))
        .await;

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["channel"], "order_book_full");
    assert_eq!(frames[0]["payload"]["data"]["code"], "INVALID_PAIR_BASE_TOKEN");
    assert_eq!(fixture.total_subscriptions(), 0);
}

#[tokio::test]
async fn zero_quote_token_has_its_own_code() {
    let fixture = Fixture::new();
    let (conn, mut rx) = connect(1, 8);

    fixture
        .send(&conn, ChannelKind::Trades, &subscription("subscribe", 1, 0, None))
        .await;

    assert_eq!(drain(&mut rx)[0]["payload"]["data"]["code"], "INVALID_PAIR_QUOTE_TOKEN");
    assert_eq!(fixture.total_subscriptions(), 0);
}

// =============================================================================
// Registry Effects
// =============================================================================

#[tokio::test]
async fn repeated_subscribe_then_unsubscribe_leaves_nothing() {
    let fixture = Fixture::new();
    let (conn, _rx) = connect(1, 32);
    let trades = fixture.hub.manager(ChannelKind::Trades);

    fixture.send(&conn, ChannelKind::Trades, &subscription("subscribe", 1, 2, None)).await;
    fixture.send(&conn, ChannelKind::Trades, &subscription("subscribe", 1, 2, None)).await;
    assert_eq!(trades.subscriber_count(&RegistryKey::pair(pair(1, 2))), 1);

    fixture.send(&conn, ChannelKind::Trades, &subscription("unsubscribe", 1, 2, None)).await;
    assert!(!trades.is_subscribed(1, &RegistryKey::pair(pair(1, 2))));

    fixture.send(&conn, ChannelKind::Trades, &subscription("unsubscribe", 1, 2, None)).await;
    assert_eq!(fixture.total_subscriptions(), 0);
    fixture.hub.check_invariants().unwrap();
}

#[tokio::test]
async fn ohlcv_without_params_uses_daily_hour_buckets() {
    let fixture = Fixture::new();
    let (conn, _rx) = connect(1, 8);

    fixture.send(&conn, ChannelKind::Ohlcv, &subscription("subscribe", 1, 2, None)).await;

    let key = RegistryKey::candles(pair(1, 2), BucketSpec::new(TimeUnit::Hour, 24).unwrap());
    assert!(fixture.hub.manager(ChannelKind::Ohlcv).is_subscribed(1, &key));
}

#[tokio::test]
async fn ohlcv_with_only_to_keeps_default_width() {
    let fixture = Fixture::new();
    let (conn, _rx) = connect(1, 8);

    fixture
        .send(
            &conn,
            ChannelKind::Ohlcv,
            &subscription("subscribe", 1, 2, Some(json!({"to": 86_400}))),
        )
        .await;

    let key = RegistryKey::candles(pair(1, 2), BucketSpec::default());
    assert!(fixture.hub.manager(ChannelKind::Ohlcv).is_subscribed(1, &key));
}

#[tokio::test]
async fn resubscribe_with_new_width_moves_bucket() {
    let fixture = Fixture::new();
    let (conn, _rx) = connect(1, 8);
    let ohlcv = fixture.hub.manager(ChannelKind::Ohlcv);
    let hourly = Some(json!({"units": "hour", "duration": 1}));
    let daily = Some(json!({"units": "day", "duration": 1}));

    fixture.send(&conn, ChannelKind::Ohlcv, &subscription("subscribe", 1, 2, hourly)).await;
    fixture.send(&conn, ChannelKind::Ohlcv, &subscription("subscribe", 1, 2, daily)).await;

    let hour_key = RegistryKey::candles(pair(1, 2), BucketSpec::new(TimeUnit::Hour, 1).unwrap());
    let day_key = RegistryKey::candles(pair(1, 2), BucketSpec::new(TimeUnit::Day, 1).unwrap());
    assert!(!ohlcv.is_subscribed(1, &hour_key));
    assert!(ohlcv.is_subscribed(1, &day_key));
    assert_eq!(ohlcv.stats().subscription_count, 1);
}

// =============================================================================
// Snapshots
// =============================================================================

#[tokio::test]
async fn trades_subscribe_starts_with_recent_history() {
    let fixture = Fixture::new();
    fixture.store.record_trade(&trade(pair(1, 2), 10, 100)).await.unwrap();
    fixture.store.record_trade(&trade(pair(1, 3), 11, 200)).await.unwrap();
    let (conn, mut rx) = connect(1, 8);

    fixture.send(&conn, ChannelKind::Trades, &subscription("subscribe", 1, 2, None)).await;

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["payload"]["type"], "INIT");
    assert_eq!(frames[0]["payload"]["data"].as_array().unwrap().len(), 1);
    assert_eq!(frames[0]["payload"]["data"][0]["price"], "10");
}

#[tokio::test]
async fn lite_book_snapshot_is_aggregated() {
    let fixture = Fixture::new();
    fixture
        .store
        .record_order_book(&OrderBookSnapshot {
            pair: pair(1, 2),
            sequence: 4,
            bids: vec![order(Side::Buy, 99, 1), order(Side::Buy, 99, 2), order(Side::Buy, 98, 5)],
            asks: vec![order(Side::Sell, 101, 3)],
        })
        .await
        .unwrap();
    let (conn, mut rx) = connect(1, 8);

    fixture
        .send(&conn, ChannelKind::OrderBookLite, &subscription("subscribe", 1, 2, None))
        .await;

    let frames = drain(&mut rx);
    let data = &frames[0]["payload"]["data"];
    assert_eq!(frames[0]["payload"]["type"], "INIT");
    assert_eq!(data["bids"].as_array().unwrap().len(), 2);
    assert_eq!(data["bids"][0]["price"], "99");
    assert_eq!(data["bids"][0]["amount"], "3");
}

#[tokio::test]
async fn missing_book_is_reported_but_subscription_stays() {
    let fixture = Fixture::new();
    let (conn, mut rx) = connect(1, 8);

    fixture
        .send(&conn, ChannelKind::OrderBookFull, &subscription("subscribe", 1, 2, None))
        .await;

    let frames = drain(&mut rx);
    assert_eq!(frames[0]["payload"]["data"]["code"], "NOT_FOUND");
    assert!(
        fixture
            .hub
            .manager(ChannelKind::OrderBookFull)
            .is_subscribed(1, &RegistryKey::pair(pair(1, 2)))
    );
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test]
async fn trade_reaches_only_subscribers_of_its_pair() {
    let fixture = Fixture::new();
    let cancel = CancellationToken::new();
    let router = fixture.spawn_router(&cancel);
    let (a, mut rx_a) = connect(1, 8);
    let (b, mut rx_b) = connect(2, 8);

    fixture.send(&a, ChannelKind::Trades, &subscription("subscribe", 1, 2, None)).await;
    fixture.send(&b, ChannelKind::Trades, &subscription("subscribe", 1, 3, None)).await;
    drain(&mut rx_a);
    drain(&mut rx_b);

    router
        .publish(DomainEvent::NewTrade(trade(pair(1, 2), 42, 1_000)))
        .await
        .unwrap();

    let frame = next_frame(&mut rx_a).await;
    assert_eq!(frame["payload"]["type"], "UPDATE");
    assert_eq!(frame["payload"]["data"]["price"], "42");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_b).is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn shared_candle_bucket_ticks_each_subscriber_once() {
    let fixture = Fixture::new();
    let cancel = CancellationToken::new();
    let router = fixture.spawn_router(&cancel);
    let (a, mut rx_a) = connect(1, 8);
    let (b, mut rx_b) = connect(2, 8);

    let early = json!({"units": "minute", "duration": 5, "from": 0, "to": 600});
    let late = json!({"units": "min", "duration": 5, "from": 900, "to": 1_800});
    fixture.send(&a, ChannelKind::Ohlcv, &subscription("subscribe", 1, 2, Some(early))).await;
    fixture.send(&b, ChannelKind::Ohlcv, &subscription("subscribe", 1, 2, Some(late))).await;
    drain(&mut rx_a);
    drain(&mut rx_b);

    let ohlcv = fixture.hub.manager(ChannelKind::Ohlcv);
    assert_eq!(ohlcv.stats().bucket_count, 1);

    router
        .publish(DomainEvent::NewTrade(trade(pair(1, 2), 5, 1_234)))
        .await
        .unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        let frame = next_frame(rx).await;
        assert_eq!(frame["channel"], "ohlcv");
        assert_eq!(frame["payload"]["data"]["openTime"], 1_200);
        assert_eq!(frame["payload"]["data"]["tradeCount"], 1);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_b).is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn candle_counts_trades_routed_before_subscribing() {
    let fixture = Fixture::new();
    let cancel = CancellationToken::new();
    let router = fixture.spawn_router(&cancel);

    for (price, ts) in [(500, 1_210), (10, 1_220)] {
        router
            .publish(DomainEvent::NewTrade(trade(pair(1, 2), price, ts)))
            .await
            .unwrap();
    }
    timeout(RECV_TIMEOUT, async {
        loop {
            let recorded = fixture.store.query_trades(TradeFilter::Pair(pair(1, 2))).await;
            if recorded.is_ok_and(|trades| trades.len() == 2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let (conn, mut rx) = connect(1, 8);
    let params = json!({"units": "minute", "duration": 5, "from": 0, "to": 1_800});
    fixture.send(&conn, ChannelKind::Ohlcv, &subscription("subscribe", 1, 2, Some(params))).await;
    let init = next_frame(&mut rx).await;
    assert_eq!(init["payload"]["type"], "INIT");
    assert_eq!(init["payload"]["data"][0]["tradeCount"], 2);

    router
        .publish(DomainEvent::NewTrade(trade(pair(1, 2), 100, 1_230)))
        .await
        .unwrap();

    let tick = next_frame(&mut rx).await;
    let candle = &tick["payload"]["data"];
    assert_eq!(tick["payload"]["type"], "UPDATE");
    assert_eq!(candle["openTime"], 1_200);
    assert_eq!(candle["open"], "500");
    assert_eq!(candle["low"], "10");
    assert_eq!(candle["close"], "100");
    assert_eq!(candle["volume"], "3");
    assert_eq!(candle["tradeCount"], 3);

    cancel.cancel();
}

#[tokio::test]
async fn disconnect_removes_every_channel() {
    let fixture = Fixture::new();
    let (conn, mut rx) = connect(1, 32);

    for channel in ChannelKind::all() {
        fixture.send(&conn, *channel, &subscription("subscribe", 1, 2, None)).await;
    }
    assert_eq!(fixture.total_subscriptions(), 4);

    let removed = fixture.hub.unsubscribe_all(1);
    assert_eq!(removed, 4);
    drain(&mut rx);

    let cancel = CancellationToken::new();
    let router = fixture.spawn_router(&cancel);
    router
        .publish(DomainEvent::NewTrade(trade(pair(1, 2), 1, 10)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(drain(&mut rx).is_empty());
    fixture.hub.check_invariants().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn slow_consumer_is_dropped_from_all_channels() {
    let fixture = Fixture::new();
    let (slow, _slow_rx) = connect(1, 2);
    let (fast, mut fast_rx) = connect(2, 32);

    // INIT frames fill the slow consumer's queue.
    fixture.send(&slow, ChannelKind::Trades, &subscription("subscribe", 1, 2, None)).await;
    fixture.send(&slow, ChannelKind::Ohlcv, &subscription("subscribe", 1, 2, None)).await;
    fixture.send(&fast, ChannelKind::Trades, &subscription("subscribe", 1, 2, None)).await;
    drain(&mut fast_rx);

    let outcome = fixture
        .hub
        .manager(ChannelKind::Trades)
        .broadcast(&fixture.hub, pair(1, 2), &json!({"price": "1"}));

    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.failed, 1);
    assert!(slow.is_closed());
    assert_eq!(fixture.total_subscriptions(), 1);
    assert_eq!(drain(&mut fast_rx).len(), 1);
}
