//! Reconnection Integration Tests
//!
//! Connection loss, exponential backoff and shutdown, run on a paused clock
//! over the loopback transport.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use market_stream::infrastructure::stream::{LoopbackAcceptor, PolygonCodec, ReconnectConfig};
use market_stream::{
    ConnectionEvent, ConnectionState, Credentials, ListenOutcome, LoopbackConnector,
    StreamClient, StreamClientConfig, StreamError,
};

const POLYGON_GREETING: [&str; 2] = [
    r#"[{"ev":"status","status":"connected","message":"Connected Successfully"}]"#,
    r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#,
];

fn client(
    reconnect: ReconnectConfig,
) -> (Arc<StreamClient>, Arc<LoopbackConnector>, LoopbackAcceptor) {
    let (connector, acceptor) = LoopbackConnector::pair();
    connector.with_greeting(POLYGON_GREETING);
    let client = Arc::new(StreamClient::new(
        StreamClientConfig::new("ws://feed.test/stocks", Credentials::new("secret"))
            .with_reconnect(reconnect)
            .with_heartbeat(None),
        Arc::new(PolygonCodec::new()),
        connector.clone(),
    ));
    (client, connector, acceptor)
}

fn record_events(client: &StreamClient) -> Arc<Mutex<Vec<ConnectionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    client.on_connection(move |event| sink.lock().push(event.clone()));
    events
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_until_attempts_run_out() {
    let (client, connector, mut acceptor) = client(ReconnectConfig::default());
    let events = record_events(&client);

    client.connect().await.unwrap();
    let peer = acceptor.try_accept().unwrap();
    connector.refuse_connections(true);
    drop(peer);

    let result = client.listen(None).await;
    assert!(matches!(result, Err(StreamError::ExhaustedRetries { attempts: 5 })));

    let delays: Vec<Duration> = events
        .lock()
        .iter()
        .filter_map(|event| match event {
            ConnectionEvent::Reconnecting { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays, [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec());
    assert_eq!(
        events.lock().last(),
        Some(&ConnectionEvent::RetriesExhausted { attempts: 5 })
    );

    // One initial connect plus five retries, never a sixth.
    assert_eq!(connector.connect_attempts(), 6);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.stats().reconnect_attempts, 5);
}

#[tokio::test(start_paused = true)]
async fn listen_timeout_pauses_backoff_and_next_listen_resumes_it() {
    let (client, connector, mut acceptor) = client(ReconnectConfig::default());
    let events = record_events(&client);

    client.connect().await.unwrap();
    let peer = acceptor.try_accept().unwrap();
    connector.refuse_connections(true);
    drop(peer);

    let started = Instant::now();
    let outcome = client.listen(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(outcome, ListenOutcome::TimedOut);
    assert_eq!(started.elapsed(), Duration::from_secs(2));
    assert_eq!(client.state(), ConnectionState::Reconnecting);
    // The one-second attempt ran; the two-second one is still pending.
    assert_eq!(connector.connect_attempts(), 2);

    let result = client.listen(None).await;
    assert!(matches!(result, Err(StreamError::ExhaustedRetries { attempts: 5 })));
    assert_eq!(connector.connect_attempts(), 6);
    assert_eq!(started.elapsed(), Duration::from_secs(31));

    let delays: Vec<Duration> = events
        .lock()
        .iter()
        .filter_map(|event| match event {
            ConnectionEvent::Reconnecting { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays, [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec());
}

#[tokio::test(start_paused = true)]
async fn disconnect_discards_a_paused_backoff() {
    let (client, connector, mut acceptor) = client(ReconnectConfig::default());
    client.connect().await.unwrap();
    connector.refuse_connections(true);
    drop(acceptor.try_accept().unwrap());

    let outcome = client.listen(Some(Duration::from_millis(500))).await.unwrap();
    assert_eq!(outcome, ListenOutcome::TimedOut);
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        client.listen(Some(Duration::from_secs(5))).await,
        Err(StreamError::NotConnected)
    ));
    assert_eq!(connector.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_restores_subscriptions() {
    let (client, connector, mut acceptor) = client(ReconnectConfig::default());
    let events = record_events(&client);

    client.subscribe(["AAPL", "MSFT"]).await.unwrap();
    client.connect().await.unwrap();
    let first = acceptor.try_accept().unwrap();
    first.fail("connection reset by peer");

    let outcome = client.listen(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(outcome, ListenOutcome::TimedOut);
    assert!(client.is_connected());
    assert_eq!(connector.connect_attempts(), 2);

    let mut second = acceptor.try_accept().unwrap();
    assert_eq!(
        second.drain_texts(),
        vec![
            r#"{"action":"auth","params":"secret"}"#.to_string(),
            r#"{"action":"subscribe","params":"T.AAPL,T.MSFT"}"#.to_string(),
        ]
    );

    let stats = client.stats();
    assert_eq!(stats.reconnect_attempts, 1);
    assert_eq!(stats.reconnections, 1);

    let events = events.lock();
    assert!(matches!(
        events.as_slice(),
        [
            ConnectionEvent::Connected { .. },
            ConnectionEvent::Reconnecting { attempt: 1, .. },
            ConnectionEvent::Connected { .. },
        ]
    ));
}

#[tokio::test]
async fn close_without_reconnect_reports_loss() {
    let (client, connector, mut acceptor) = client(ReconnectConfig::disabled());
    let errors = Arc::new(Mutex::new(0_u32));
    let counter = Arc::clone(&errors);
    client.on_error(move |_| *counter.lock() += 1);

    client.connect().await.unwrap();
    drop(acceptor.try_accept().unwrap());

    let outcome = client.listen(None).await.unwrap();
    assert_eq!(outcome, ListenOutcome::ConnectionLost);
    assert_eq!(*errors.lock(), 1);
    assert_eq!(connector.connect_attempts(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_stops_a_running_listen() {
    let (client, _connector, mut acceptor) = client(ReconnectConfig::default());
    client.connect().await.unwrap();
    let _peer = acceptor.try_accept().unwrap();

    let listener = Arc::clone(&client);
    let handle = tokio::spawn(async move { listener.listen(None).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.disconnect().await;

    let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("listen did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, ListenOutcome::Stopped);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.stats().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let (client, connector, mut acceptor) = client(ReconnectConfig::default());
    client.connect().await.unwrap();
    drop(acceptor.try_accept().unwrap());

    let listener = Arc::clone(&client);
    let handle = tokio::spawn(async move { listener.listen(None).await });

    // Inside the first one-second backoff.
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.disconnect().await;

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome, ListenOutcome::Stopped);
    assert_eq!(connector.connect_attempts(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
