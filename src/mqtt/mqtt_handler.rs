//! Connection lifecycle for the broker session.
//!
//! [`ConnectionManager`] owns the transport handle and the [`ConnectionState`].
//! State only changes in response to transport events (or an explicit
//! `disconnect()`):
//!
//! ```text
//!                 connect()
//! Disconnected ─────────────► Connecting ──ConnAck──► Connected
//!      ▲                          │                       │
//!      │◄──────── error ──────────┘                       │
//!      │◄──────────────── close / offline ────────────────┘
//!      │
//!      └──error── Reconnecting ◄── reconnect attempt (any state)
//! ```
//!
//! Each `connect()` starts a new session with its own generation number.
//! Events carry the generation of the session that produced them; anything
//! from an older generation is dropped, so a late ConnAck can never revive a
//! session that was explicitly disconnected.
//!
//! The rumqttc event loop of a session runs in its own task as an
//! [`MqttSession`] state machine (`Configured ──► Running ──► Closed`).

use super::config::MqttConfig;
use super::error::TransportError;
use super::message_manager::MQTTMessage;
use super::topics::TopicName;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode, Transport as MqttTransport,
};
use serde::Serialize;
use statum::{machine, state};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Generation number of a broker session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle and data events reported by a transport session.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Error(String),
    Closed,
    Offline,
    /// A new connection attempt is about to start. Fires once per attempt.
    Reconnect { at: DateTime<Local> },
}

/// Outbound half of a transport. All calls are non-blocking requests; their
/// outcome on the wire is never awaited.
pub trait Transport: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
    fn close(&self) -> Result<(), TransportError>;
}

impl Transport for AsyncClient {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        Ok(self.try_subscribe(topic, QoS::AtMostOnce)?)
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        Ok(self.try_publish(topic, QoS::AtMostOnce, false, payload)?)
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(self.try_disconnect()?)
    }
}

/// Raw counters behind the connection metrics.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionCounters {
    pub state: ConnectionState,
    /// Start of the most recent successful `connect()` call
    pub connected_since: Option<Instant>,
    pub reconnect_count: u64,
    pub last_reconnect: Option<DateTime<Local>>,
}

#[derive(Default)]
struct ConnectionInner {
    state: ConnectionState,
    generation: u64,
    transport: Option<Arc<dyn Transport>>,
    cancel: Option<CancellationToken>,
    connected_since: Option<Instant>,
    reconnect_count: u64,
    last_reconnect: Option<DateTime<Local>>,
}

pub struct ConnectionManager {
    config: MqttConfig,
    inner: Mutex<ConnectionInner>,
    status_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::Sender<MQTTMessage>,
}

impl ConnectionManager {
    /// Messages of the current session are forwarded into `inbound_tx`.
    pub fn new(config: MqttConfig, inbound_tx: mpsc::Sender<MQTTMessage>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            inner: Mutex::new(ConnectionInner::default()),
            status_tx,
            inbound_tx,
        })
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    /// Opens a new broker session and returns immediately; the outcome shows
    /// up as state transitions. A session that cannot even be built leaves the
    /// manager in `Disconnected` and is only logged.
    pub fn connect(self: &Arc<Self>) {
        info!("Connecting to MQTT broker at {}", self.config.url());

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                self.fail_connect(TransportError::NoRuntime(e.to_string()));
                return;
            }
        };

        let options = match build_options(&self.config) {
            Ok(options) => options,
            Err(e) => {
                self.fail_connect(e);
                return;
            }
        };

        let (client, eventloop) = AsyncClient::new(options, self.config.channel_capacity);
        let (session_id, cancel) = self.attach(Arc::new(client));

        let session = MqttSession::create(
            session_id,
            eventloop,
            self.clone(),
            cancel,
            self.config.reconnect_interval(),
            self.config.connect_timeout(),
        );
        runtime.spawn(async move {
            let session = session.start().run_until_cancelled().await;
            debug!("Session {} task finished", session.id());
        });
    }

    /// Installs `transport` as the current session and moves to `Connecting`.
    /// Any previous session is cancelled and closed first.
    ///
    /// `connect()` calls this with the rumqttc client; other transports can be
    /// driven by feeding their events to [`ConnectionManager::apply_event`].
    pub fn attach(&self, transport: Arc<dyn Transport>) -> (SessionId, CancellationToken) {
        let mut inner = self.inner.lock();
        Self::release(&mut inner);

        inner.generation += 1;
        let cancel = CancellationToken::new();
        inner.transport = Some(transport);
        inner.cancel = Some(cancel.clone());
        inner.connected_since = Some(Instant::now());
        self.set_state(&mut inner, ConnectionState::Connecting);

        let session_id = SessionId(inner.generation);
        debug!("Started session {}", session_id);
        (session_id, cancel)
    }

    /// Closes the current session, if any, and forces `Disconnected`.
    /// Safe to call at any time, any number of times.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        // Bump the generation so late events of the old session are ignored.
        inner.generation += 1;
        if Self::release(&mut inner) {
            info!("Disconnected from MQTT broker");
        }
        self.set_state(&mut inner, ConnectionState::Disconnected);
    }

    /// Applies an event and forwards a resulting message to the inbound channel.
    pub async fn apply_event(&self, session: SessionId, event: TransportEvent) {
        if let Some(message) = self.handle_event(session, event) {
            if let Err(e) = self.inbound_tx.send(message).await {
                warn!("Inbound channel closed, dropping message: {}", e);
            }
        }
    }

    /// Runs one transport event through the state machine. Returns the
    /// message to route when the event carried one for the current session.
    pub fn handle_event(&self, session: SessionId, event: TransportEvent) -> Option<MQTTMessage> {
        let mut inner = self.inner.lock();
        if session.0 != inner.generation {
            debug!("Ignoring {:?} from stale session {}", event, session);
            return None;
        }

        match event {
            TransportEvent::Connected => {
                info!("MQTT connected");
                self.set_state(&mut inner, ConnectionState::Connected);
                if let Some(transport) = inner.transport.clone() {
                    subscribe_all(transport.as_ref());
                }
                None
            }
            TransportEvent::Message { topic, payload } => {
                Some(MQTTMessage::from_bytes(topic, &payload))
            }
            TransportEvent::Error(e) => {
                error!("MQTT error: {}", e);
                self.set_state(&mut inner, ConnectionState::Disconnected);
                None
            }
            TransportEvent::Closed | TransportEvent::Offline => {
                info!("MQTT connection closed");
                self.set_state(&mut inner, ConnectionState::Disconnected);
                None
            }
            TransportEvent::Reconnect { at } => {
                inner.reconnect_count += 1;
                inner.last_reconnect = Some(at);
                info!("MQTT reconnecting (attempt {})", inner.reconnect_count);
                self.set_state(&mut inner, ConnectionState::Reconnecting);
                None
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Transport of the current session, if one is attached
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.lock().transport.clone()
    }

    pub fn counters(&self) -> ConnectionCounters {
        let inner = self.inner.lock();
        ConnectionCounters {
            state: inner.state,
            connected_since: inner.connected_since,
            reconnect_count: inner.reconnect_count,
            last_reconnect: inner.last_reconnect,
        }
    }

    /// Receiver that is notified on every state transition
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionState> {
        self.status_tx.subscribe()
    }

    fn fail_connect(&self, e: TransportError) {
        error!("Failed to connect to MQTT broker: {}", e);
        let mut inner = self.inner.lock();
        inner.generation += 1;
        Self::release(&mut inner);
        self.set_state(&mut inner, ConnectionState::Disconnected);
    }

    /// Cancels the session task and closes the transport. Returns whether a
    /// session was attached.
    fn release(inner: &mut ConnectionInner) -> bool {
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        match inner.transport.take() {
            Some(transport) => {
                if let Err(e) = transport.close() {
                    warn!("Failed to close MQTT transport: {}", e);
                }
                true
            }
            None => false,
        }
    }

    fn set_state(&self, inner: &mut ConnectionInner, state: ConnectionState) {
        if inner.state != state {
            debug!("Connection state {} -> {}", inner.state, state);
            inner.state = state;
        }
        self.status_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

/// One subscribe request per topic; a failed request does not stop the rest.
fn subscribe_all(transport: &dyn Transport) {
    for topic in TopicName::subscriptions() {
        match transport.subscribe(topic) {
            Ok(_) => debug!("Subscribed to {}", topic),
            Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
        }
    }
}

fn build_options(config: &MqttConfig) -> Result<MqttOptions, TransportError> {
    let client_id = config.client_id();
    let mut options = match config.scheme.as_str() {
        "wss" | "ws" => MqttOptions::new(client_id, config.url(), config.port),
        "mqtts" | "ssl" | "mqtt" | "tcp" => {
            MqttOptions::new(client_id, config.host.clone(), config.port)
        }
        other => {
            return Err(TransportError::InvalidAddress(format!(
                "unsupported scheme {:?}",
                other
            )))
        }
    };

    match config.scheme.as_str() {
        "wss" => {
            options.set_transport(MqttTransport::wss_with_default_config());
        }
        "ws" => {
            options.set_transport(MqttTransport::Ws);
        }
        "mqtts" | "ssl" => {
            options.set_transport(MqttTransport::tls_with_default_config());
        }
        _ => {}
    }

    options
        .set_clean_session(true)
        .set_keep_alive(config.keep_alive());
    if let Some(username) = &config.username {
        options.set_credentials(
            username.clone(),
            config.password.clone().unwrap_or_default(),
        );
    }
    Ok(options)
}

/// Lifecycle of one session's event loop task
#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Configured, // Event loop built, not yet polled
    Running,    // Polling the broker
    Closed,     // Cancelled, event loop dropped on exit
}

#[machine]
pub struct MqttSession<S: SessionState> {
    id: SessionId,
    eventloop: EventLoop,
    manager: Arc<ConnectionManager>,
    cancel: CancellationToken,
    reconnect_interval: Duration,
    connect_timeout: Duration,
}

impl<S: SessionState> MqttSession<S> {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl MqttSession<Configured> {
    pub fn create(
        id: SessionId,
        eventloop: EventLoop,
        manager: Arc<ConnectionManager>,
        cancel: CancellationToken,
        reconnect_interval: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self::new(
            id,
            eventloop,
            manager,
            cancel,
            reconnect_interval,
            connect_timeout,
        )
    }

    pub fn start(self) -> MqttSession<Running> {
        debug!("Starting event loop for session {}", self.id);
        self.transition()
    }
}

impl MqttSession<Running> {
    /// Polls the broker until the session is cancelled.
    ///
    /// rumqttc reconnects on the next poll after an error, so a failed poll
    /// is followed by the retry pause and a `Reconnect` event.
    pub async fn run_until_cancelled(mut self) -> MqttSession<Closed> {
        let cancel = self.cancel.clone();
        let mut awaiting_connack = true;

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.poll_next(awaiting_connack) => polled,
            };

            match polled {
                Ok(event) => {
                    let Some(event) = translate(event) else {
                        continue;
                    };
                    if event == TransportEvent::Connected {
                        awaiting_connack = false;
                    }
                    self.manager.apply_event(self.id, event).await;
                }
                Err(e) => {
                    let event = if awaiting_connack {
                        TransportEvent::Error(e)
                    } else {
                        warn!("MQTT connection lost: {}", e);
                        TransportEvent::Offline
                    };
                    self.manager.apply_event(self.id, event).await;
                    awaiting_connack = true;

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = time::sleep(self.reconnect_interval) => {}
                    }
                    let reconnect = TransportEvent::Reconnect { at: Local::now() };
                    self.manager.apply_event(self.id, reconnect).await;
                }
            }
        }

        info!("Session {} closed", self.id);
        self.transition()
    }

    async fn poll_next(&mut self, awaiting_connack: bool) -> Result<Event, String> {
        if !awaiting_connack {
            return self.eventloop.poll().await.map_err(|e| e.to_string());
        }
        match time::timeout(self.connect_timeout, self.eventloop.poll()).await {
            Ok(polled) => polled.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "connect timed out after {}s",
                self.connect_timeout.as_secs()
            )),
        }
    }
}

fn translate(event: Event) -> Option<TransportEvent> {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            if ack.code == ConnectReturnCode::Success {
                Some(TransportEvent::Connected)
            } else {
                Some(TransportEvent::Error(format!(
                    "broker refused connection: {:?}",
                    ack.code
                )))
            }
        }
        Event::Incoming(Packet::Publish(publish)) => Some(TransportEvent::Message {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
        }),
        Event::Incoming(Packet::SubAck(ack)) => {
            if ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure))
            {
                error!("Broker rejected subscription (packet {})", ack.pkid);
            }
            None
        }
        Event::Incoming(Packet::Disconnect) => Some(TransportEvent::Closed),
        _ => None,
    }
}
