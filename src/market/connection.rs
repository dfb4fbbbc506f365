//! Shared transport connection.
//!
//! One driver task owns the websocket, speaks STOMP over it, replays every
//! registered topic after each successful connect and dispatches decoded
//! candles into the topic registry. Everything outside the driver talks to it
//! through [`ConnectionCommand`]s.

use crate::error::PipelineError;
use crate::market::codec::{self, Payload};
use crate::market::metrics::PipelineMetrics;
use crate::market::stomp::{
    connect_frame, disconnect_frame, subscribe_frame, unsubscribe_frame, StompCommand, StompFrame,
    HEARTBEAT_EOL,
};
use crate::market::topics::{SharedTopicRegistry, TopicRegistry};
use crate::market::types::{Candle, ConnectionState, PipelineConfig, RawUpdate, Topic};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Missed heart-beat periods tolerated before the link is declared dead.
const HEARTBEAT_GRACE_FACTOR: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    EnsureConnected,
    TopicAdded { key: String },
    TopicRemoved { key: String, subscription_id: String },
}

/// Exponential backoff: `base, 2*base, 4*base, ...` capped, no jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let cap = cap.max(base);
        Self {
            base,
            cap,
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let doubled = self.current.as_millis().saturating_mul(2);
        let bounded = doubled.min(self.cap.as_millis()) as u64;
        self.current = Duration::from_millis(bounded);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Transport lifecycle without any I/O.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: Backoff,
    retries: u32,
}

impl ConnectionMachine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff,
            retries: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive retries since the last successful connect.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Starts connecting when idle. A no-op in every other state, including
    /// RECONNECTING where a retry is already scheduled.
    pub fn ensure_connected(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.retries = 0;
        self.backoff.reset();
    }

    /// Any close or error while active schedules a retry. Returns the delay
    /// before the next CONNECTING, or `None` when the manager is idle.
    pub fn on_connection_lost(&mut self) -> Option<Duration> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        self.state = ConnectionState::Reconnecting;
        Some(self.backoff.next_delay())
    }

    pub fn on_retry_due(&mut self) -> bool {
        if self.state != ConnectionState::Reconnecting {
            return false;
        }
        self.state = ConnectionState::Connecting;
        self.retries = self.retries.saturating_add(1);
        true
    }

    pub fn on_shutdown(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.retries = 0;
        self.backoff.reset();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub key: String,
    pub subscription_id: String,
    pub destination: String,
}

/// One SUBSCRIBE per topic that has listeners and is not yet subscribed in
/// this session. Topics without listeners produce nothing.
pub fn plan_replay(registry: &mut TopicRegistry) -> Vec<SubscribeRequest> {
    registry
        .topics()
        .into_iter()
        .filter_map(|topic| {
            let key = topic.key();
            let subscription_id = registry.mark_transport_subscribed(&key)?;
            Some(SubscribeRequest {
                destination: topic.destination(),
                key,
                subscription_id,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Routing {
    Deliver { key: String, candle: Candle },
    CrossTalk { key: String, symbol: String },
    Unroutable,
}

/// Resolves a decoded MESSAGE to a registered topic: destination header first,
/// then the subscription id, then the symbol/interval embedded in the body.
pub fn route_message(registry: &TopicRegistry, frame: &StompFrame, update: RawUpdate) -> Routing {
    let from_destination = frame
        .header("destination")
        .and_then(Topic::from_destination)
        .map(|topic| topic.key());
    let from_subscription = || {
        frame
            .header("subscription")
            .and_then(|id| registry.key_for_subscription(id))
    };
    let from_body = || {
        let symbol = update.symbol()?;
        let interval = update.interval.as_deref()?;
        Topic::parse(symbol, interval).ok().map(|topic| topic.key())
    };

    let Some(key) = from_destination
        .filter(|key| registry.topic(key).is_some())
        .or_else(from_subscription)
        .or_else(from_body)
    else {
        return Routing::Unroutable;
    };
    let Some(topic) = registry.topic(&key) else {
        return Routing::Unroutable;
    };

    if let Some(symbol) = update.symbol() {
        if !topic.matches_symbol(symbol) {
            return Routing::CrossTalk {
                key,
                symbol: symbol.to_string(),
            };
        }
    }

    let mut candle = update.candle;
    if candle.symbol.is_none() {
        candle.symbol = Some(topic.symbol.clone());
    }
    Routing::Deliver { key, candle }
}

/// Applies the STOMP heart-beat negotiation rules to our `cx,cy` and the
/// server's `sx,sy`. Returns `(send_every_ms, expect_every_ms)`, 0 meaning off.
pub fn negotiate_heartbeat(ours_ms: u64, server_header: Option<&str>) -> (u64, u64) {
    let (server_send, server_expect) = server_header
        .and_then(|value| value.split_once(','))
        .and_then(|(send, expect)| {
            Some((send.trim().parse::<u64>().ok()?, expect.trim().parse::<u64>().ok()?))
        })
        .unwrap_or((0, 0));

    let outgoing = if ours_ms == 0 || server_expect == 0 {
        0
    } else {
        ours_ms.max(server_expect)
    };
    let incoming = if ours_ms == 0 || server_send == 0 {
        0
    } else {
        ours_ms.max(server_send)
    };
    (outgoing, incoming)
}

/// `host` header value for CONNECT: the authority part of the websocket URL.
pub fn stomp_host(ws_url: &str) -> &str {
    let without_scheme = ws_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(ws_url);
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme);
    authority.rsplit('@').next().unwrap_or(authority)
}

pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    state: watch::Receiver<ConnectionState>,
    cancel_token: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Spawns the driver task. Must be called inside a Tokio runtime.
    pub fn spawn(
        config: &PipelineConfig,
        registry: SharedTopicRegistry,
        metrics: Arc<PipelineMetrics>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (state_sender, state_receiver) = watch::channel(ConnectionState::Disconnected);
        let machine = ConnectionMachine::new(Backoff::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_cap_ms),
        ));

        let driver = ConnectionDriver {
            ws_url: config.ws_url.clone(),
            heartbeat_ms: config.heartbeat_ms,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            registry,
            metrics,
            machine,
            state: state_sender,
            commands: command_receiver,
            cancel_token: cancel_token.clone(),
        };
        let handle = tokio::spawn(driver.run());

        Self {
            commands: command_sender,
            state: state_receiver,
            cancel_token,
            driver: Mutex::new(Some(handle)),
        }
    }

    pub fn ensure_connected(&self) {
        let _ = self.commands.send(ConnectionCommand::EnsureConnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn command_sender(&self) -> &mpsc::UnboundedSender<ConnectionCommand> {
        &self.commands
    }

    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(error = %error, "connection driver ended abnormally");
            }
        }
    }
}

enum SessionOutcome {
    Shutdown,
    Lost,
}

enum InboundDirective {
    Continue,
    Lost,
}

struct ConnectionDriver {
    ws_url: String,
    heartbeat_ms: u64,
    connect_timeout: Duration,
    registry: SharedTopicRegistry,
    metrics: Arc<PipelineMetrics>,
    machine: ConnectionMachine,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    cancel_token: CancellationToken,
}

impl ConnectionDriver {
    async fn run(mut self) {
        if self.wait_for_demand().await {
            loop {
                match self.run_session().await {
                    SessionOutcome::Shutdown => break,
                    SessionOutcome::Lost => {
                        self.registry.lock().reset_transport_subscriptions();
                        let Some(delay) = self.machine.on_connection_lost() else {
                            break;
                        };
                        self.publish_state();
                        tracing::warn!(
                            delay_ms = delay.as_millis() as u64,
                            retries = self.machine.retries(),
                            "connection lost, reconnect scheduled"
                        );
                        if !self.wait_backoff(delay).await {
                            break;
                        }
                        if self.machine.on_retry_due() {
                            self.metrics.record_reconnect();
                            self.publish_state();
                        }
                    }
                }
            }
        }

        self.registry.lock().reset_transport_subscriptions();
        self.machine.on_shutdown();
        self.publish_state();
        tracing::info!("connection driver stopped");
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = previous.as_str(), to = state.as_str(), "connection state changed");
        }
    }

    /// Idles in DISCONNECTED until someone asks for the transport.
    async fn wait_for_demand(&mut self) -> bool {
        loop {
            let command = tokio::select! {
                _ = self.cancel_token.cancelled() => return false,
                command = self.commands.recv() => command,
            };
            match command {
                None => return false,
                Some(ConnectionCommand::EnsureConnected) => {
                    if self.machine.ensure_connected() {
                        self.publish_state();
                        return true;
                    }
                }
                // Nothing to send without a session; replay covers it later.
                Some(_) => {}
            }
        }
    }

    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let command = tokio::select! {
                _ = self.cancel_token.cancelled() => return false,
                _ = &mut sleep => return true,
                command = self.commands.recv() => command,
            };
            if command.is_none() {
                return false;
            }
        }
    }

    async fn run_session(&mut self) -> SessionOutcome {
        let connected = tokio::select! {
            _ = self.cancel_token.cancelled() => return SessionOutcome::Shutdown,
            connected = within(self.connect_timeout, "websocket connect", open_websocket(&self.ws_url)) => connected,
        };
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(ws_url = %self.ws_url, error = %error, "failed to open websocket");
                return SessionOutcome::Lost;
            }
        };

        let handshake = tokio::select! {
            _ = self.cancel_token.cancelled() => {
                let _ = stream.close(None).await;
                return SessionOutcome::Shutdown;
            }
            handshake = within(self.connect_timeout, "stomp handshake", self.stomp_handshake(&mut stream)) => handshake,
        };
        let (send_every_ms, expect_every_ms) = match handshake {
            Ok(heartbeat) => heartbeat,
            Err(error) => {
                tracing::warn!(error = %error, "stomp handshake failed");
                let _ = stream.close(None).await;
                return SessionOutcome::Lost;
            }
        };

        self.machine.on_connected();
        self.publish_state();

        let mut session_ids = HashSet::new();
        let replay = plan_replay(&mut self.registry.lock());
        tracing::info!(topics = replay.len(), "replaying topic subscriptions");
        for request in replay {
            if let Err(error) = send_frame(
                &mut stream,
                &subscribe_frame(&request.subscription_id, &request.destination),
            )
            .await
            {
                tracing::warn!(topic = %request.key, error = %error, "failed to replay subscription");
                return SessionOutcome::Lost;
            }
            session_ids.insert(request.subscription_id);
        }

        let mut heartbeat = heartbeat_ticker(send_every_ms);
        let stale_after = (expect_every_ms > 0)
            .then(|| Duration::from_millis(expect_every_ms) * HEARTBEAT_GRACE_FACTOR);
        let mut liveness = heartbeat_ticker(expect_every_ms);
        let mut last_received = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    let _ = send_frame(&mut stream, &disconnect_frame()).await;
                    let _ = stream.close(None).await;
                    return SessionOutcome::Shutdown;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = stream.close(None).await;
                        return SessionOutcome::Shutdown;
                    };
                    if let Err(error) = self.apply_command(&mut stream, &mut session_ids, command).await {
                        tracing::warn!(error = %error, "failed to send subscription change");
                        return SessionOutcome::Lost;
                    }
                }
                _ = next_tick(&mut heartbeat) => {
                    if let Err(error) = stream.send(Message::Text(HEARTBEAT_EOL.to_string())).await {
                        tracing::warn!(error = %error, "failed to send heart-beat");
                        return SessionOutcome::Lost;
                    }
                }
                _ = next_tick(&mut liveness) => {
                    if stale_after.is_some_and(|limit| last_received.elapsed() > limit) {
                        tracing::warn!("no inbound traffic within heart-beat grace, dropping connection");
                        let _ = stream.close(None).await;
                        return SessionOutcome::Lost;
                    }
                }
                message = stream.next() => {
                    last_received = Instant::now();
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let InboundDirective::Lost = self.handle_inbound(text.as_bytes()) {
                                return SessionOutcome::Lost;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            if let InboundDirective::Lost = self.handle_inbound(&bytes) {
                                return SessionOutcome::Lost;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if stream.send(Message::Pong(payload)).await.is_err() {
                                return SessionOutcome::Lost;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("websocket closed by server");
                            return SessionOutcome::Lost;
                        }
                        Some(Err(error)) => {
                            tracing::warn!(error = %error, "websocket error");
                            return SessionOutcome::Lost;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    async fn stomp_handshake(&self, stream: &mut WsStream) -> Result<(u64, u64), PipelineError> {
        let connect = connect_frame(stomp_host(&self.ws_url), self.heartbeat_ms);
        send_frame(stream, &connect).await?;

        while let Some(message) = stream.next().await {
            let bytes = match message? {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => break,
                _ => continue,
            };
            let Some(frame) = StompFrame::parse(&bytes)? else {
                continue;
            };
            match frame.command {
                StompCommand::Connected => {
                    tracing::info!(
                        version = frame.header("version").unwrap_or("1.0"),
                        server = frame.header("server").unwrap_or("unknown"),
                        "stomp session established"
                    );
                    return Ok(negotiate_heartbeat(self.heartbeat_ms, frame.header("heart-beat")));
                }
                StompCommand::Error => {
                    return Err(PipelineError::Stomp(
                        frame.header("message").unwrap_or("broker rejected CONNECT").to_string(),
                    ));
                }
                _ => {}
            }
        }
        Err(PipelineError::Closed("websocket closed during stomp handshake".to_string()))
    }

    async fn apply_command(
        &mut self,
        stream: &mut WsStream,
        session_ids: &mut HashSet<String>,
        command: ConnectionCommand,
    ) -> Result<(), PipelineError> {
        match command {
            ConnectionCommand::EnsureConnected => Ok(()),
            ConnectionCommand::TopicAdded { key } => {
                let request = {
                    let mut registry = self.registry.lock();
                    let destination = registry.topic(&key).map(Topic::destination);
                    destination.and_then(|destination| {
                        registry
                            .mark_transport_subscribed(&key)
                            .map(|subscription_id| (subscription_id, destination))
                    })
                };
                let Some((subscription_id, destination)) = request else {
                    return Ok(());
                };
                send_frame(stream, &subscribe_frame(&subscription_id, &destination)).await?;
                tracing::debug!(topic = %key, subscription_id = %subscription_id, "subscribed");
                session_ids.insert(subscription_id);
                Ok(())
            }
            ConnectionCommand::TopicRemoved {
                key,
                subscription_id,
            } => {
                // Ids from an earlier session are already gone on the broker side.
                if !session_ids.remove(&subscription_id) {
                    return Ok(());
                }
                send_frame(stream, &unsubscribe_frame(&subscription_id)).await?;
                tracing::debug!(topic = %key, subscription_id = %subscription_id, "unsubscribed");
                Ok(())
            }
        }
    }

    fn handle_inbound(&self, bytes: &[u8]) -> InboundDirective {
        let frame = match StompFrame::parse(bytes) {
            Ok(Some(frame)) => frame,
            Ok(None) => return InboundDirective::Continue,
            Err(error) => {
                self.metrics.record_decode_failure();
                tracing::debug!(error = %error, "dropping unparseable stomp frame");
                return InboundDirective::Continue;
            }
        };

        match frame.command {
            StompCommand::Message => {
                self.dispatch_message(&frame);
                InboundDirective::Continue
            }
            StompCommand::Error => {
                tracing::warn!(
                    message = frame.header("message").unwrap_or(""),
                    "broker sent ERROR frame"
                );
                InboundDirective::Lost
            }
            _ => InboundDirective::Continue,
        }
    }

    fn dispatch_message(&self, frame: &StompFrame) {
        let binary_body = frame
            .header("content-type")
            .is_some_and(|content_type| {
                content_type.contains("msgpack") || content_type.contains("octet-stream")
            });
        let payload = match frame.body_text() {
            Some(text) if !binary_body => Payload::Text(text),
            _ => Payload::Binary(&frame.body),
        };
        let Some(update) = codec::decode(payload) else {
            self.metrics.record_decode_failure();
            tracing::debug!(
                destination = frame.header("destination").unwrap_or(""),
                "dropping undecodable candle payload"
            );
            return;
        };

        let registry = self.registry.lock();
        match route_message(&registry, frame, update) {
            Routing::Deliver { key, candle } => {
                self.metrics.record_message();
                registry.dispatch(&key, candle);
            }
            Routing::CrossTalk { key, symbol } => {
                self.metrics.record_cross_talk();
                tracing::debug!(topic = %key, symbol = %symbol, "dropping cross-talk update");
            }
            Routing::Unroutable => {
                tracing::debug!(
                    destination = frame.header("destination").unwrap_or(""),
                    "dropping update for unknown topic"
                );
            }
        }
    }
}

async fn open_websocket(ws_url: &str) -> Result<WsStream, PipelineError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };
    let (stream, _response) = connect_async_with_config(ws_url, Some(ws_config), true).await?;
    Ok(stream)
}

async fn within<T>(
    limit: Duration,
    what: &str,
    operation: impl std::future::Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| PipelineError::Timeout(format!("{what} exceeded {} ms", limit.as_millis())))?
}

async fn send_frame(stream: &mut WsStream, frame: &StompFrame) -> Result<(), PipelineError> {
    stream.send(Message::Text(frame.encode_text())).await?;
    Ok(())
}

fn heartbeat_ticker(every_ms: u64) -> Option<Interval> {
    (every_ms > 0).then(|| {
        let period = Duration::from_millis(every_ms);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    })
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
