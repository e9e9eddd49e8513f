//! Price Event Integration Tests
//!
//! Drives the full pipeline over the loopback transport: provider frames in,
//! price events out of the event bus.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio_test::assert_ok;

use market_stream::infrastructure::stream::{
    LoopbackAcceptor, LoopbackPeer, PolygonCodec, ReconnectConfig,
};
use market_stream::{
    AlertConditions, Credentials, EventBus, ListenOutcome, ListenerOptions, LoopbackConnector,
    PRICE_ALERT, PRICE_CHANGE, PRICE_UPDATE, PriceEvent, PriceStream, PriceStreamConfig,
    StreamClient, StreamClientConfig, WILDCARD,
};

const POLYGON_GREETING: [&str; 2] = [
    r#"[{"ev":"status","status":"connected","message":"Connected Successfully"}]"#,
    r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#,
];

struct Harness {
    client: Arc<StreamClient>,
    prices: Arc<PriceStream>,
    acceptor: LoopbackAcceptor,
    events: Arc<Mutex<Vec<String>>>,
}

fn harness(config: PriceStreamConfig) -> Harness {
    let (connector, acceptor) = LoopbackConnector::pair();
    connector.with_greeting(POLYGON_GREETING);

    let client = Arc::new(StreamClient::new(
        StreamClientConfig::new("ws://feed.test/stocks", Credentials::new("secret"))
            .with_reconnect(ReconnectConfig::disabled())
            .with_heartbeat(None),
        Arc::new(PolygonCodec::new()),
        connector,
    ));

    let bus = Arc::new(EventBus::<PriceEvent>::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.on(WILDCARD, ListenerOptions::default(), move |event| {
        sink.lock().push(event.name.clone());
        Ok(())
    });

    let prices = PriceStream::new(client.clone(), bus, config);

    Harness {
        client,
        prices,
        acceptor,
        events,
    }
}

fn trade(symbol: &str, price: &str, ts: u64) -> String {
    format!(r#"[{{"ev":"T","sym":"{symbol}","p":{price},"s":100,"t":{ts}}}]"#)
}

async fn connect(harness: &mut Harness) -> LoopbackPeer {
    harness.client.connect().await.unwrap();
    let mut peer = harness.acceptor.try_accept().unwrap();
    peer.drain();
    peer
}

#[tokio::test]
async fn price_move_above_threshold_emits_change() {
    let mut h = harness(PriceStreamConfig {
        min_change_percent: 1.0,
        ..PriceStreamConfig::default()
    });
    let mut peer = connect(&mut h).await;

    h.prices.start(["AAPL"]).await.unwrap();
    assert_eq!(
        peer.drain_texts(),
        vec![r#"{"action":"subscribe","params":"T.AAPL"}"#.to_string()]
    );

    peer.send_text(trade("AAPL", "150.00", 1_700_000_000_000));
    peer.send_text(trade("AAPL", "151.80", 1_700_000_001_000));

    let outcome = h.client.listen(Some(Duration::from_millis(50))).await.unwrap();
    assert_eq!(outcome, ListenOutcome::TimedOut);

    assert_eq!(
        *h.events.lock(),
        vec![PRICE_UPDATE, PRICE_UPDATE, PRICE_CHANGE]
    );
    assert_eq!(h.prices.last_price("AAPL"), Some(Decimal::new(15180, 2)));

    let stats = h.prices.stats();
    assert_eq!(stats.updates_received, 2);
    assert_eq!(stats.changes_detected, 1);
    assert_eq!(stats.spikes_detected, 0);
    assert_eq!(stats.stream.ticks_received, 2);
    assert_eq!(h.prices.get_history("AAPL", 10).len(), 2);
}

#[tokio::test]
async fn extreme_price_ratio_keeps_the_stream_running() {
    let mut h = harness(PriceStreamConfig::default());
    let peer = connect(&mut h).await;
    h.prices.start(["AAPL"]).await.unwrap();

    peer.send_text(trade("AAPL", "1e-20", 1_700_000_000_000));
    peer.send_text(trade("AAPL", "1000000000", 1_700_000_001_000));
    peer.send_text(trade("AAPL", "1000000001", 1_700_000_002_000));

    let outcome = h.client.listen(Some(Duration::from_millis(50))).await.unwrap();
    assert_eq!(outcome, ListenOutcome::TimedOut);

    let stats = h.prices.stats();
    assert_eq!(stats.updates_received, 3);
    assert_eq!(stats.spikes_detected, 1);
    assert_eq!(h.prices.last_price("AAPL"), Some(Decimal::new(1_000_000_001, 0)));
}

#[tokio::test]
async fn once_alert_fires_a_single_time() {
    let mut h = harness(PriceStreamConfig::default());
    let peer = connect(&mut h).await;
    h.prices.start(["MSFT"]).await.unwrap();
    h.prices
        .set_alert("msft", AlertConditions::new().above(Decimal::new(400, 0)).once());

    peer.send_text(trade("MSFT", "399.50", 1_700_000_000_000));
    peer.send_text(trade("MSFT", "401.00", 1_700_000_001_000));
    peer.send_text(trade("MSFT", "402.00", 1_700_000_002_000));
    h.client.listen(Some(Duration::from_millis(50))).await.unwrap();

    let alerts = h
        .events
        .lock()
        .iter()
        .filter(|name| *name == PRICE_ALERT)
        .count();
    assert_eq!(alerts, 1);
    assert!(h.prices.alerts().is_empty());
    assert_eq!(h.prices.stats().alerts_triggered, 1);
}

#[tokio::test]
async fn stop_unsubscribes_once_and_ignores_later_ticks() {
    let mut h = harness(PriceStreamConfig::default());
    let mut peer = connect(&mut h).await;
    h.prices.start(["AAPL", "TSLA"]).await.unwrap();
    peer.drain();

    assert_ok!(h.prices.stop().await);
    assert_ok!(h.prices.stop().await);

    assert_eq!(
        peer.drain_texts(),
        vec![r#"{"action":"unsubscribe","params":"T.AAPL,T.TSLA"}"#.to_string()]
    );
    assert!(h.client.subscriptions().is_empty());

    peer.send_text(trade("AAPL", "150.00", 1_700_000_000_000));
    h.client.listen(Some(Duration::from_millis(20))).await.unwrap();

    assert!(h.events.lock().is_empty());
    assert!(!h.prices.stats().running);
}

#[tokio::test]
async fn start_before_connect_replays_subscriptions() {
    let mut h = harness(PriceStreamConfig::default());
    h.prices.start(["nvda"]).await.unwrap();
    assert!(h.prices.is_running());

    h.client.connect().await.unwrap();
    let mut peer = h.acceptor.try_accept().unwrap();

    assert_eq!(
        peer.drain_texts(),
        vec![
            r#"{"action":"auth","params":"secret"}"#.to_string(),
            r#"{"action":"subscribe","params":"T.NVDA"}"#.to_string(),
        ]
    );
}
