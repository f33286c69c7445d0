//! Telemetry stream connection
//!
//! One background task per live connection runs the whole state machine:
//! connect, pump frames, fall back to attempt-scaled reconnects, and give up
//! after the configured number of attempts. Transport failures never reach
//! the caller; they only show up as state transitions on the watch channel
//! and as `connection` events on the bus.

use crate::config::TelemetryConfig;
use crate::error::{ProtocolError, TransportError};
use crate::events::{ConnectionStatus, Event, EventBus, Subscription, Topic};
use crate::telemetry::policy::ReconnectPolicy;
use crate::telemetry::protocol::{self, InboundMessage, OutboundMessage};
use crate::telemetry::transport::{Channel, Connector, WsConnector};
use crate::utils::sos::SignalOfStop;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Attempt budget exhausted; only a manual `connect()` resumes.
    Failed,
}

impl ConnectionState {
    pub fn description(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Failed => "Failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub url: String,
    pub policy: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
}

impl ConnectionOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::from_config(&TelemetryConfig::default())
        }
    }

    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            url: config.url.clone(),
            policy: ReconnectPolicy::from_config(config),
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

#[derive(Default)]
struct WorkerSlot {
    /// Bumped on every manual connect/disconnect; a task whose generation is
    /// stale may no longer touch the state.
    generation: u64,
    sos: Option<SignalOfStop>,
}

struct Shared {
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    bus: EventBus,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    worker: Mutex<WorkerSlot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Persistent, self-healing message stream to the telemetry gateway.
pub struct StreamConnection {
    shared: Arc<Shared>,
}

impl StreamConnection {
    /// WebSocket connection with a private event bus.
    pub fn new(options: ConnectionOptions) -> Self {
        Self::with_connector(options, Arc::new(WsConnector), EventBus::new())
    }

    pub fn with_connector(options: ConnectionOptions, connector: Arc<dyn Connector>, bus: EventBus) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                options,
                connector,
                bus,
                state,
                attempts: AtomicU32::new(0),
                outbound: Mutex::new(None),
                worker: Mutex::new(WorkerSlot::default()),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn url(&self) -> &str {
        &self.shared.options.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(topic, listener)
    }

    /// Starts connecting in the background. No-op while connected or already
    /// connecting; skips a pending backoff delay; restarts with a fresh attempt
    /// budget after a failure.
    pub fn connect(&self) {
        let (generation, sos) = {
            let mut slot = lock(&self.shared.worker);
            let state = self.state();
            match state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    debug!("connect() ignored, connection is {}", state);
                    return;
                }
                ConnectionState::Reconnecting => {
                    info!("Manual connect, skipping pending reconnect delay");
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    self.shared.attempts.store(0, Ordering::SeqCst);
                }
            }

            if let Some(previous) = slot.sos.take() {
                previous.cancel();
            }
            slot.generation += 1;
            let sos = SignalOfStop::new();
            slot.sos = Some(sos.clone());
            self.shared.state.send_replace(ConnectionState::Connecting);
            (slot.generation, sos)
        };

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.run(generation, sos).await });
    }

    /// Closes the stream and cancels any pending reconnect. No automatic
    /// reconnect follows.
    pub fn disconnect(&self) {
        let previous = {
            let mut slot = lock(&self.shared.worker);
            slot.generation += 1;
            if let Some(sos) = slot.sos.take() {
                sos.cancel();
            }
            lock(&self.shared.outbound).take();
            self.shared.state.send_replace(ConnectionState::Disconnected)
        };

        if !matches!(previous, ConnectionState::Disconnected | ConnectionState::Failed) {
            info!("Disconnected from {}", self.shared.options.url);
            self.shared
                .bus
                .publish(&Event::Connection(ConnectionStatus::Disconnected));
        }
    }

    /// Sends `message` if connected; otherwise the message is dropped.
    pub fn send(&self, message: &OutboundMessage) {
        match message.to_text() {
            Ok(text) => self.shared.send_text(text),
            Err(e) => warn!("Cannot encode outbound message: {}", e),
        }
    }

    pub fn ping(&self) {
        self.send(&OutboundMessage::Ping);
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        let mut slot = lock(&self.shared.worker);
        slot.generation += 1;
        if let Some(sos) = slot.sos.take() {
            sos.cancel();
        }
    }
}

impl Shared {
    fn send_text(&self, text: String) {
        if !self.state.borrow().is_connected() {
            debug!("Dropping outbound message while {}", *self.state.borrow());
            return;
        }
        if let Some(tx) = lock(&self.outbound).as_ref() {
            let _ = tx.send(text);
        }
    }

    /// Applies `state` unless a newer connect/disconnect superseded this
    /// task, then publishes `status`. Listeners run after the lock is gone.
    fn transition(&self, generation: u64, state: ConnectionState, status: Option<ConnectionStatus>) -> bool {
        {
            let slot = lock(&self.worker);
            if slot.generation != generation {
                return false;
            }
            self.state.send_replace(state);
        }
        if let Some(status) = status {
            self.bus.publish(&Event::Connection(status));
        }
        true
    }

    async fn run(self: Arc<Self>, generation: u64, sos: SignalOfStop) {
        let url = self.options.url.clone();

        loop {
            if sos.cancelled() || !self.transition(generation, ConnectionState::Connecting, None) {
                return;
            }

            info!("Connecting to {}", url);
            let attempt = sos
                .select(tokio::time::timeout(
                    self.options.connect_timeout,
                    self.connector.connect(&url),
                ))
                .await;

            match attempt {
                None => return,
                Some(Ok(Ok(channel))) => {
                    self.pump(generation, &sos, channel).await;
                    if sos.cancelled() {
                        return;
                    }
                }
                Some(Ok(Err(e))) => {
                    warn!("Connection to {} failed: {}", url, e);
                    self.bus.publish(&Event::Error(e.to_string()));
                }
                Some(Err(_)) => {
                    warn!("Connection to {} timed out after {:?}", url, self.options.connect_timeout);
                    self.bus.publish(&Event::Error(TransportError::Timeout.to_string()));
                }
            }

            lock(&self.outbound).take();
            if !self.transition(
                generation,
                ConnectionState::Disconnected,
                Some(ConnectionStatus::Disconnected),
            ) {
                return;
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let Some(delay) = self.options.policy.delay_for(attempt) else {
                error!(
                    "Max reconnection attempts ({}) reached for {}",
                    self.options.policy.max_attempts, url
                );
                self.transition(generation, ConnectionState::Failed, Some(ConnectionStatus::Failed));
                return;
            };

            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            if !self.transition(generation, ConnectionState::Reconnecting, None) {
                return;
            }
            if sos.select(tokio::time::sleep(delay)).await.is_none() {
                return;
            }
        }
    }

    /// Moves frames until the channel closes or the task is cancelled.
    async fn pump(&self, generation: u64, sos: &SignalOfStop, channel: Channel) {
        let Channel { mut sink, mut stream } = channel;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        *lock(&self.outbound) = Some(out_tx);
        self.attempts.store(0, Ordering::SeqCst);
        if !self.transition(generation, ConnectionState::Connected, Some(ConnectionStatus::Connected)) {
            let _ = sink.close().await;
            return;
        }
        info!("Connected to {}", self.options.url);

        let mut heartbeat = self
            .options
            .heartbeat_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                _ = sos.wait_cancellation() => {
                    let _ = sink.close().await;
                    break;
                }
                Some(text) = out_rx.recv() => {
                    if let Err(e) = sink.send(text).await {
                        warn!("Send failed: {}", e);
                        self.bus.publish(&Event::Error(e.to_string()));
                        break;
                    }
                }
                _ = next_tick(&mut heartbeat) => {
                    if let Ok(ping) = OutboundMessage::Ping.to_text()
                        && let Err(e) = sink.send(ping).await
                    {
                        warn!("Heartbeat failed: {}", e);
                        self.bus.publish(&Event::Error(e.to_string()));
                        break;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(TransportError::Closed)) | None => {
                        info!("Gateway closed the stream");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Stream error: {}", e);
                        self.bus.publish(&Event::Error(e.to_string()));
                        break;
                    }
                },
            }
        }

        lock(&self.outbound).take();
    }

    fn dispatch(&self, text: &str) {
        match protocol::decode(text) {
            Ok(InboundMessage::ConnectionEstablished { message }) => {
                info!("Gateway acknowledged connection: {}", message.as_deref().unwrap_or("-"));
            }
            Ok(InboundMessage::SensorUpdate(update)) => {
                debug!(
                    "sensor_update from {} ({} sensors)",
                    update.baseboard_id,
                    update.sensors.len()
                );
                self.bus.publish(&Event::SensorUpdate(update));
            }
            Ok(InboundMessage::BaseboardStatus(status)) => {
                debug!("baseboard_status {} -> {}", status.baseboard_id, status.status);
                self.bus.publish(&Event::BaseboardStatus(status));
            }
            Ok(InboundMessage::Pong { timestamp }) => {
                self.bus.publish(&Event::Pong { timestamp });
            }
            Err(ProtocolError::UnknownType(kind)) => {
                debug!("Ignoring unknown message type '{}'", kind);
            }
            Err(e) => warn!("Dropping frame: {}", e),
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeConnector;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            heartbeat_interval: None,
            ..ConnectionOptions::new("ws://gateway.test/ws/sensors/")
        }
    }

    fn record(conn: &StreamConnection, topic: Topic) -> (Subscription, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = conn.subscribe(topic, move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, rx)
    }

    async fn wait_state(conn: &StreamConnection, wanted: ConnectionState) {
        let mut rx = conn.watch_state();
        rx.wait_for(|s| *s == wanted).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_spacing_then_failed() {
        let (connector, _sessions) = FakeConnector::refusing();
        let conn = StreamConnection::with_connector(options(), connector.clone(), EventBus::new());
        let (_sub, mut events) = record(&conn, Topic::Connection);

        conn.connect();
        wait_state(&conn, ConnectionState::Failed).await;

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 6);
        let gaps: Vec<u128> = attempts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        assert_eq!(gaps, vec![1000, 2000, 3000, 4000, 5000]);

        let mut statuses = Vec::new();
        while let Ok(Event::Connection(status)) = events.try_recv() {
            statuses.push(status);
        }
        assert_eq!(statuses.len(), 7);
        assert_eq!(statuses.last(), Some(&ConnectionStatus::Failed));

        // nothing happens on its own after giving up
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts().len(), 6);
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_after_failure() {
        let (connector, mut sessions) = FakeConnector::refusing();
        let conn = StreamConnection::with_connector(options(), connector.clone(), EventBus::new());

        conn.connect();
        wait_state(&conn, ConnectionState::Failed).await;

        connector.set_accepting(true);
        conn.connect();
        wait_state(&conn, ConnectionState::Connected).await;
        assert!(sessions.recv().await.is_some());
        assert_eq!(conn.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (connector, mut sessions) = FakeConnector::accepting();
        let conn = StreamConnection::with_connector(options(), connector.clone(), EventBus::new());

        conn.connect();
        conn.connect();
        wait_state(&conn, ConnectionState::Connected).await;
        conn.connect();

        let _server = sessions.recv().await.unwrap();
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_recognized_types_only() {
        let (connector, mut sessions) = FakeConnector::accepting();
        let conn = StreamConnection::with_connector(options(), connector, EventBus::new());
        let (_s1, mut updates) = record(&conn, Topic::SensorUpdate);
        let (_s2, mut statuses) = record(&conn, Topic::BaseboardStatus);
        let (_s3, mut pongs) = record(&conn, Topic::Pong);

        conn.connect();
        let server = sessions.recv().await.unwrap();
        wait_state(&conn, ConnectionState::Connected).await;

        server.push(r#"{"type":"connection_established","message":"Connected to XIOT sensor stream"}"#);
        server.push(r#"{"type":"firmware_notice","data":{}}"#);
        server.push("{broken");
        server.push(
            r#"{"type":"sensor_update","data":{"baseboard_id":"A","sensors":[
                {"i2c_address":"0x10","name":"Temp","value":10.0,"unit":"C","status":"active"}],"timestamp":0}}"#,
        );
        server.push(r#"{"type":"baseboard_status","data":{"baseboard_id":"A","status":"online"}}"#);
        server.push(r#"{"type":"pong"}"#);

        let Event::SensorUpdate(update) = updates.recv().await.unwrap() else {
            panic!("expected sensor update");
        };
        assert_eq!(update.baseboard_id, "A");
        assert!(matches!(statuses.recv().await, Some(Event::BaseboardStatus(_))));
        assert!(matches!(pongs.recv().await, Some(Event::Pong { timestamp: None })));
        assert!(updates.try_recv().is_err());
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let (connector, mut sessions) = FakeConnector::accepting();
        let conn = StreamConnection::with_connector(options(), connector, EventBus::new());

        conn.ping();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.connect();
        let mut server = sessions.recv().await.unwrap();
        wait_state(&conn, ConnectionState::Connected).await;
        assert!(server.outbound.try_recv().is_err());

        conn.ping();
        assert_eq!(server.outbound.recv().await.as_deref(), Some(r#"{"type":"ping"}"#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_drop_reconnects_and_resets_attempts() {
        let (connector, mut sessions) = FakeConnector::accepting();
        let conn = StreamConnection::with_connector(options(), connector.clone(), EventBus::new());
        let (_sub, mut events) = record(&conn, Topic::Connection);

        conn.connect();
        let first = sessions.recv().await.unwrap();
        assert_eq!(events.recv().await, Some(Event::Connection(ConnectionStatus::Connected)));

        drop(first);
        assert_eq!(events.recv().await, Some(Event::Connection(ConnectionStatus::Disconnected)));
        assert_eq!(conn.reconnect_attempts(), 1);

        let _second = sessions.recv().await.unwrap();
        assert_eq!(events.recv().await, Some(Event::Connection(ConnectionStatus::Connected)));
        assert_eq!(conn.reconnect_attempts(), 0);

        let attempts = connector.attempts();
        assert_eq!((attempts[1] - attempts[0]).as_millis(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_reconnecting() {
        let (connector, mut sessions) = FakeConnector::accepting();
        let conn = StreamConnection::with_connector(options(), connector.clone(), EventBus::new());
        let (_sub, mut events) = record(&conn, Topic::Connection);

        conn.connect();
        let _server = sessions.recv().await.unwrap();
        wait_state(&conn, ConnectionState::Connected).await;

        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts().len(), 1);

        let mut statuses = Vec::new();
        while let Ok(Event::Connection(status)) = events.try_recv() {
            statuses.push(status);
        }
        assert_eq!(statuses, vec![ConnectionStatus::Connected, ConnectionStatus::Disconnected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_while_connected() {
        let (connector, mut sessions) = FakeConnector::accepting();
        let opts = ConnectionOptions {
            heartbeat_interval: Some(Duration::from_secs(30)),
            ..options()
        };
        let conn = StreamConnection::with_connector(opts, connector, EventBus::new());

        conn.connect();
        let mut server = sessions.recv().await.unwrap();
        let started = Instant::now();

        assert_eq!(server.outbound.recv().await.as_deref(), Some(r#"{"type":"ping"}"#));
        assert_eq!(started.elapsed().as_secs(), 30);
    }
}
