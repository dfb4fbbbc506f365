use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use candle_relay::{
    market::history::NoHistory,
    market::stomp::{StompCommand, StompFrame},
    Candle, ConnectionState, MarketContext, PipelineArgs, PipelineConfig, TracingObservabilitySink,
    WatchRenderSink,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

const BTC_DESTINATION: &str = "/topic/candle.BTCUSDT.1m";
const ETH_DESTINATION: &str = "/topic/candle.ETHUSDT.1m";

#[derive(Debug, Clone)]
enum BrokerControl {
    Publish { destination: String, body: String },
    SendError { message: String },
    DropConnections,
}

/// How the broker answers CONNECT on a given connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectReply {
    Connected,
    /// CONNECTED with this `heart-beat` header, then nothing is ever sent.
    ConnectedThenQuiet(&'static str),
    Error,
    Silent,
}

type ConnectPolicy = fn(usize) -> ConnectReply;

fn always_connected(_connection: usize) -> ConnectReply {
    ConnectReply::Connected
}

#[derive(Debug, Clone)]
struct LoggedFrame {
    connection: usize,
    frame: StompFrame,
}

struct MockBroker {
    ws_url: String,
    connections: Arc<AtomicUsize>,
    frames: Arc<Mutex<Vec<LoggedFrame>>>,
    control: broadcast::Sender<BrokerControl>,
    task: JoinHandle<()>,
}

impl MockBroker {
    async fn spawn() -> Self {
        Self::spawn_with(always_connected).await
    }

    async fn spawn_with(policy: ConnectPolicy) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener
            .local_addr()
            .expect("listener should expose address");
        let connections = Arc::new(AtomicUsize::new(0));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (control, _) = broadcast::channel(64);

        let accept_connections = Arc::clone(&connections);
        let accept_frames = Arc::clone(&frames);
        let accept_control = control.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = accept_connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(
                    stream,
                    connection,
                    policy(connection),
                    Arc::clone(&accept_frames),
                    accept_control.subscribe(),
                ));
            }
        });

        Self {
            ws_url: format!("ws://127.0.0.1:{}/ws", addr.port()),
            connections,
            frames,
            control,
            task,
        }
    }

    fn publish(&self, destination: &str, body: &str) {
        let _ = self.control.send(BrokerControl::Publish {
            destination: destination.to_string(),
            body: body.to_string(),
        });
    }

    fn send_error(&self, message: &str) {
        let _ = self.control.send(BrokerControl::SendError {
            message: message.to_string(),
        });
    }

    fn drop_connections(&self) {
        let _ = self.control.send(BrokerControl::DropConnections);
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn count_frames(&self, connection: usize, command: StompCommand, header: (&str, &str)) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|logged| {
                logged.connection == connection
                    && logged.frame.command == command
                    && logged.frame.header(header.0) == Some(header.1)
            })
            .count()
    }

    fn subscription_id(&self, connection: usize, destination: &str) -> Option<String> {
        self.frames
            .lock()
            .iter()
            .find(|logged| {
                logged.connection == connection
                    && logged.frame.command == StompCommand::Subscribe
                    && logged.frame.header("destination") == Some(destination)
            })
            .and_then(|logged| logged.frame.header("id").map(str::to_string))
    }

    fn saw_command(&self, command: StompCommand) -> bool {
        self.frames
            .lock()
            .iter()
            .any(|logged| logged.frame.command == command)
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    connection: usize,
    reply: ConnectReply,
    frames: Arc<Mutex<Vec<LoggedFrame>>>,
    mut control: broadcast::Receiver<BrokerControl>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    let mut subscriptions: HashMap<String, String> = HashMap::new();
    let mut message_id = 0_u64;

    loop {
        tokio::select! {
            incoming = ws.next() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                let bytes = match message {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(Some(frame)) = StompFrame::parse(&bytes) else {
                    continue;
                };
                frames.lock().push(LoggedFrame {
                    connection,
                    frame: frame.clone(),
                });

                match frame.command {
                    StompCommand::Connect => {
                        let answer = match reply {
                            ConnectReply::Connected => {
                                "CONNECTED\nversion:1.2\nheart-beat:0,0\nserver:mock\n\n\0".to_string()
                            }
                            ConnectReply::ConnectedThenQuiet(heartbeat) => {
                                format!("CONNECTED\nversion:1.2\nheart-beat:{heartbeat}\nserver:mock\n\n\0")
                            }
                            ConnectReply::Error => {
                                "ERROR\nmessage:access refused\n\n\0".to_string()
                            }
                            ConnectReply::Silent => continue,
                        };
                        if ws.send(Message::Text(answer)).await.is_err() {
                            break;
                        }
                    }
                    StompCommand::Subscribe => {
                        if let (Some(id), Some(destination)) = (frame.header("id"), frame.header("destination")) {
                            subscriptions.insert(destination.to_string(), id.to_string());
                        }
                    }
                    StompCommand::Unsubscribe => {
                        if let Some(id) = frame.header("id") {
                            subscriptions.retain(|_, subscribed| subscribed != id);
                        }
                    }
                    StompCommand::Disconnect => break,
                    _ => {}
                }
            }
            command = control.recv() => match command {
                Ok(BrokerControl::Publish { .. } | BrokerControl::SendError { .. })
                    if matches!(reply, ConnectReply::ConnectedThenQuiet(_)) => {}
                Ok(BrokerControl::SendError { message }) => {
                    let frame = format!("ERROR\nmessage:{message}\n\n\0");
                    if ws.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(BrokerControl::Publish { destination, body }) => {
                    let Some(id) = subscriptions.get(&destination) else {
                        continue;
                    };
                    message_id += 1;
                    let frame = format!(
                        "MESSAGE\ndestination:{destination}\nsubscription:{id}\nmessage-id:{message_id}\ncontent-type:application/json\n\n{body}\0"
                    );
                    if ws.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(BrokerControl::DropConnections) | Err(broadcast::error::RecvError::Closed) => {
                    let _ = ws.close(None).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}

fn test_args(ws_url: &str) -> PipelineArgs {
    PipelineArgs {
        ws_url: Some(ws_url.to_string()),
        disable_history: Some(true),
        heartbeat_ms: Some(0),
        reconnect_base_ms: Some(50),
        reconnect_cap_ms: Some(200),
        metrics_interval_ms: Some(100),
        connect_timeout_ms: Some(2_000),
        ..Default::default()
    }
}

fn start_context(broker: &MockBroker) -> MarketContext {
    start_context_with(test_args(&broker.ws_url))
}

fn start_context_with(args: PipelineArgs) -> MarketContext {
    let config: PipelineConfig = args.normalize().expect("test config should be valid");
    MarketContext::start(config, Arc::new(NoHistory), Arc::new(TracingObservabilitySink))
}

async fn wait_until(what: &str, condition: impl FnMut() -> bool) {
    wait_until_within(Duration::from_secs(5), what, condition).await;
}

async fn wait_until_within(limit: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let waited = timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn candle_body(symbol: &str, open_time_ms: i64, ohlc: [f64; 4]) -> String {
    format!(
        r#"{{"symbol":"{symbol}","interval":"1m","openTime":{open_time_ms},"open":{},"high":{},"low":{},"close":{}}}"#,
        ohlc[0], ohlc[1], ohlc[2], ohlc[3]
    )
}

#[tokio::test]
async fn transport_stays_idle_until_first_subscription() {
    let broker = MockBroker::spawn().await;
    let context = start_context(&broker);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(context.connection_state(), ConnectionState::Disconnected);

    let _btc = context
        .subscribe("btcusdt", "1m")
        .expect("subscribe should succeed");
    let mut state = context.watch_connection_state();
    // The watch guard must not outlive this statement: the driver publishes
    // every state change through the same channel.
    let connected = timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .is_ok_and(|changed| changed.is_ok());
    assert!(connected, "context should connect after subscribe");
    assert_eq!(context.active_topics().len(), 1);

    context.shutdown().await;
    assert_eq!(context.connection_state(), ConnectionState::Disconnected);
    assert!(context.active_topics().is_empty());
    wait_until("DISCONNECT frame", || broker.saw_command(StompCommand::Disconnect)).await;
}

#[tokio::test]
async fn chart_renders_live_candles_and_merges_same_bucket() {
    let broker = MockBroker::spawn().await;
    let context = start_context(&broker);
    let (sink, mut series) = WatchRenderSink::new();

    let chart = context
        .open_chart("btcusdt", "1m", Arc::new(sink))
        .expect("chart should open");
    wait_until("BTC subscription", || {
        broker.subscription_id(0, BTC_DESTINATION).is_some()
    })
    .await;

    broker.publish(
        BTC_DESTINATION,
        &candle_body("BTCUSDT", 1_700_000_040_000, [10.0, 12.0, 9.0, 11.0]),
    );
    let first = timeout(Duration::from_secs(5), series.wait_for(|series| !series.is_empty()))
        .await
        .expect("first candle should render")
        .expect("render channel should stay open")
        .clone();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].time, 1_700_000_040);

    broker.publish(
        BTC_DESTINATION,
        &candle_body("BTCUSDT", 1_700_000_040_000, [100.0, 101.0, 99.0, 100.0]),
    );
    let merged = timeout(
        Duration::from_secs(5),
        series.wait_for(|series| series.first().is_some_and(|candle| candle.high == 101.0)),
    )
    .await
    .expect("merged candle should render")
    .expect("render channel should stay open")
    .clone();
    assert_eq!(
        merged.as_slice(),
        &[Candle::new(1_700_000_040, 10.0, 101.0, 9.0, 100.0).with_symbol("BTCUSDT")]
    );

    let subscription_id = broker
        .subscription_id(0, BTC_DESTINATION)
        .expect("subscription id should be logged");
    chart.close().await;
    wait_until("UNSUBSCRIBE after chart close", || {
        broker.count_frames(0, StompCommand::Unsubscribe, ("id", subscription_id.as_str())) == 1
    })
    .await;
    assert!(context.active_topics().is_empty());

    context.shutdown().await;
}

#[tokio::test]
async fn listeners_never_see_other_symbols() {
    let broker = MockBroker::spawn().await;
    let context = start_context(&broker);
    let mut btc = context
        .subscribe("BTCUSDT", "1m")
        .expect("btc subscribe should succeed");
    let mut eth = context
        .subscribe("ETHUSDT", "1m")
        .expect("eth subscribe should succeed");
    wait_until("both subscriptions", || {
        broker.subscription_id(0, BTC_DESTINATION).is_some()
            && broker.subscription_id(0, ETH_DESTINATION).is_some()
    })
    .await;

    broker.publish(
        BTC_DESTINATION,
        &candle_body("ETHUSDT", 1_700_000_040_000, [1.0, 2.0, 0.5, 1.5]),
    );
    broker.publish(
        BTC_DESTINATION,
        &candle_body("BTCUSDT", 1_700_000_100_000, [1.0, 2.0, 0.5, 1.5]),
    );

    let received = timeout(Duration::from_secs(5), btc.recv())
        .await
        .expect("btc listener should receive")
        .expect("btc channel should stay open");
    assert_eq!(received.time, 1_700_000_100);
    assert_eq!(received.symbol.as_deref(), Some("BTCUSDT"));
    assert!(timeout(Duration::from_millis(150), eth.recv()).await.is_err());
    assert_eq!(context.metrics().cross_talk_dropped, 1);

    context.shutdown().await;
}

#[tokio::test]
async fn reconnect_replays_only_topics_with_listeners() {
    let broker = MockBroker::spawn().await;
    let context = start_context(&broker);
    let mut btc = context
        .subscribe("BTCUSDT", "1m")
        .expect("btc subscribe should succeed");
    let eth = context
        .subscribe("ETHUSDT", "1m")
        .expect("eth subscribe should succeed");
    wait_until("initial subscriptions", || {
        broker.subscription_id(0, BTC_DESTINATION).is_some()
            && broker.subscription_id(0, ETH_DESTINATION).is_some()
    })
    .await;

    let eth_id = broker
        .subscription_id(0, ETH_DESTINATION)
        .expect("eth subscription id should be logged");
    eth.unsubscribe();
    wait_until("ETH unsubscribe", || {
        broker.count_frames(0, StompCommand::Unsubscribe, ("id", eth_id.as_str())) == 1
    })
    .await;

    broker.drop_connections();
    wait_until("BTC replay on second connection", || {
        broker.subscription_id(1, BTC_DESTINATION).is_some()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        broker.count_frames(1, StompCommand::Subscribe, ("destination", BTC_DESTINATION)),
        1
    );
    assert_eq!(
        broker.count_frames(1, StompCommand::Subscribe, ("destination", ETH_DESTINATION)),
        0
    );
    assert_ne!(
        broker.subscription_id(1, BTC_DESTINATION),
        broker.subscription_id(0, BTC_DESTINATION)
    );
    assert_eq!(context.connection_state(), ConnectionState::Connected);
    assert!(context.metrics().reconnects >= 1);

    broker.publish(
        BTC_DESTINATION,
        &candle_body("BTCUSDT", 1_700_000_160_000, [1.0, 2.0, 0.5, 1.5]),
    );
    let received = timeout(Duration::from_secs(5), btc.recv())
        .await
        .expect("btc listener should resume after reconnect")
        .expect("btc channel should stay open");
    assert_eq!(received.time, 1_700_000_160);

    context.shutdown().await;
}

#[tokio::test]
async fn refused_connect_reconnects_and_replays() {
    let broker = MockBroker::spawn_with(|connection| {
        if connection == 0 {
            ConnectReply::Error
        } else {
            ConnectReply::Connected
        }
    })
    .await;
    let context = start_context(&broker);
    let _btc = context
        .subscribe("BTCUSDT", "1m")
        .expect("btc subscribe should succeed");

    wait_until("replay after refused CONNECT", || {
        broker.subscription_id(1, BTC_DESTINATION).is_some()
    })
    .await;
    assert_eq!(
        broker.count_frames(0, StompCommand::Subscribe, ("destination", BTC_DESTINATION)),
        0
    );
    assert_eq!(context.connection_state(), ConnectionState::Connected);
    assert!(context.metrics().reconnects >= 1);

    context.shutdown().await;
}

#[tokio::test]
async fn broker_error_mid_session_reconnects_and_resumes() {
    let broker = MockBroker::spawn().await;
    let context = start_context(&broker);
    let mut btc = context
        .subscribe("BTCUSDT", "1m")
        .expect("btc subscribe should succeed");
    wait_until("initial subscription", || {
        broker.subscription_id(0, BTC_DESTINATION).is_some()
    })
    .await;

    broker.send_error("session expired");
    wait_until("replay after ERROR frame", || {
        broker.subscription_id(1, BTC_DESTINATION).is_some()
    })
    .await;
    assert!(context.metrics().reconnects >= 1);

    broker.publish(
        BTC_DESTINATION,
        &candle_body("BTCUSDT", 1_700_000_220_000, [1.0, 2.0, 0.5, 1.5]),
    );
    let received = timeout(Duration::from_secs(5), btc.recv())
        .await
        .expect("btc listener should resume after broker error")
        .expect("btc channel should stay open");
    assert_eq!(received.time, 1_700_000_220);

    context.shutdown().await;
}

#[tokio::test]
async fn silent_broker_times_out_handshake() {
    let broker = MockBroker::spawn_with(|connection| {
        if connection == 0 {
            ConnectReply::Silent
        } else {
            ConnectReply::Connected
        }
    })
    .await;
    let context = start_context_with(PipelineArgs {
        connect_timeout_ms: Some(300),
        ..test_args(&broker.ws_url)
    });
    let _btc = context
        .subscribe("BTCUSDT", "1m")
        .expect("btc subscribe should succeed");

    wait_until("replay after handshake timeout", || {
        broker.subscription_id(1, BTC_DESTINATION).is_some()
    })
    .await;
    assert!(context.metrics().reconnects >= 1);

    context.shutdown().await;
}

#[tokio::test]
async fn quiet_link_is_dropped_after_heartbeat_grace() {
    let broker = MockBroker::spawn_with(|connection| {
        if connection == 0 {
            ConnectReply::ConnectedThenQuiet("1000,0")
        } else {
            ConnectReply::Connected
        }
    })
    .await;
    let context = start_context_with(PipelineArgs {
        heartbeat_ms: Some(1_000),
        ..test_args(&broker.ws_url)
    });
    let _btc = context
        .subscribe("BTCUSDT", "1m")
        .expect("btc subscribe should succeed");
    wait_until("initial subscription", || {
        broker.subscription_id(0, BTC_DESTINATION).is_some()
    })
    .await;

    // Grace is three negotiated periods.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(context.connection_state(), ConnectionState::Connected);

    wait_until_within(Duration::from_secs(10), "replay after liveness expiry", || {
        broker.subscription_id(1, BTC_DESTINATION).is_some()
    })
    .await;
    assert!(context.metrics().reconnects >= 1);

    context.shutdown().await;
}

#[tokio::test]
async fn failed_first_connect_waits_in_reconnecting() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let port = listener
        .local_addr()
        .expect("listener should expose address")
        .port();
    drop(listener);

    let context = start_context_with(PipelineArgs {
        reconnect_base_ms: Some(10_000),
        reconnect_cap_ms: Some(10_000),
        ..test_args(&format!("ws://127.0.0.1:{port}/ws"))
    });
    let _btc = context
        .subscribe("BTCUSDT", "1m")
        .expect("btc subscribe should succeed");

    let mut state = context.watch_connection_state();
    let reconnecting = timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == ConnectionState::Reconnecting),
    )
    .await
    .is_ok_and(|changed| changed.is_ok());
    assert!(reconnecting, "refused socket should move to RECONNECTING");

    context.ensure_connected();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(context.connection_state(), ConnectionState::Reconnecting);
    assert_eq!(context.metrics().reconnects, 0);

    context.shutdown().await;
    assert_eq!(context.connection_state(), ConnectionState::Disconnected);
}
