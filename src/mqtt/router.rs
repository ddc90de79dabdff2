//! Topic dispatch and gated publishing.
//!
//! The handler table maps a wire topic to exactly one [`Handler`].
//! Registering a handler for a topic that already has one replaces it: the
//! last registration wins and there is no fan-out per topic. Consumers that
//! need several listeners fan out above the router, or use the message
//! monitor, which sees every dispatched message regardless of handlers.

use super::message_manager::{encode_outbound, MQTTMessage, Payload};
use super::mqtt_handler::ConnectionManager;
use crate::projection::{SignalKind, SignalValue};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const MONITOR_CAPACITY: usize = 256;

pub type SignalCallback = Box<dyn Fn(SignalValue) + Send + Sync>;
pub type RawCallback = Box<dyn Fn(&Payload) + Send + Sync>;

pub enum Handler {
    /// Payload is decoded as `kind` first; undecodable payloads never reach
    /// the callback.
    Signal {
        kind: SignalKind,
        callback: SignalCallback,
    },
    Raw(RawCallback),
}

impl Handler {
    pub fn signal<F>(kind: SignalKind, callback: F) -> Self
    where
        F: Fn(SignalValue) + Send + Sync + 'static,
    {
        Handler::Signal {
            kind,
            callback: Box::new(callback),
        }
    }

    pub fn raw<F>(callback: F) -> Self
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        Handler::Raw(Box::new(callback))
    }

    fn invoke(&self, topic: &str, payload: &Payload) {
        match self {
            Handler::Signal { kind, callback } => match kind.decode(payload) {
                Ok(value) => callback(value),
                Err(e) => debug!("Dropping message on {}: {}", topic, e),
            },
            Handler::Raw(callback) => callback(payload),
        }
    }
}

pub struct MessageRouter {
    handlers: RwLock<HashMap<String, Handler>>,
    connection: Arc<ConnectionManager>,
    monitor: broadcast::Sender<MQTTMessage>,
}

impl MessageRouter {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        let (monitor, _) = broadcast::channel(MONITOR_CAPACITY);
        Self {
            handlers: RwLock::new(HashMap::new()),
            connection,
            monitor,
        }
    }

    /// Registers `handler` for `topic`, replacing any previous handler.
    pub fn on_message(&self, topic: impl Into<String>, handler: Handler) {
        let topic = topic.into();
        if self.handlers.write().insert(topic.clone(), handler).is_some() {
            debug!("Replaced handler for {}", topic);
        }
    }

    #[cfg(test)]
    pub(crate) fn has_handler(&self, topic: &str) -> bool {
        self.handlers.read().contains_key(topic)
    }

    /// Decodes the message and calls the handler registered for its topic.
    /// Messages on topics without a handler are dropped silently.
    ///
    /// Handlers run under the table's read lock and must not register
    /// handlers themselves.
    pub fn dispatch(&self, message: MQTTMessage) {
        let payload = message.payload();
        match self.handlers.read().get(&message.topic) {
            Some(handler) => handler.invoke(&message.topic, &payload),
            None => debug!("No handler for {}", message.topic),
        }
        // Err only means nobody is watching the monitor
        let _ = self.monitor.send(message);
    }

    /// Publishes `value` if the connection is up. Offline publishes are
    /// dropped with a warning; nothing is queued or retried.
    pub fn publish(&self, topic: &str, value: Value) {
        if !self.connection.is_connected() {
            warn!("MQTT not connected, dropping message for {}", topic);
            return;
        }
        let Some(transport) = self.connection.transport() else {
            warn!("No MQTT transport, dropping message for {}", topic);
            return;
        };

        let text = encode_outbound(&value);
        match transport.publish(topic, text.clone().into_bytes()) {
            Ok(_) => info!("Published to {}: {}", topic, text),
            Err(e) => error!("Failed to publish to {}: {}", topic, e),
        }
    }

    /// Every dispatched message, after its handler ran
    pub fn subscribe_monitor(&self) -> broadcast::Receiver<MQTTMessage> {
        self.monitor.subscribe()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::MqttConfig;
    use crate::mqtt::mqtt_handler::tests::RecordingTransport;
    use crate::mqtt::mqtt_handler::TransportEvent;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn router() -> (MessageRouter, mpsc::Receiver<MQTTMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let connection = ConnectionManager::new(MqttConfig::default(), tx);
        (MessageRouter::new(connection), rx)
    }

    #[test]
    fn last_registration_wins() {
        let (router, _rx) = router();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        router.on_message(
            "/t",
            Handler::raw(move |_| first.lock().push("first")),
        );
        let second = seen.clone();
        router.on_message(
            "/t",
            Handler::raw(move |_| second.lock().push("second")),
        );

        router.dispatch(MQTTMessage::from_bytes("/t", b"1"));
        assert_eq!(*seen.lock(), vec!["second"]);
    }

    #[test]
    fn unhandled_topics_are_dropped() {
        let (router, _rx) = router();
        assert!(!router.has_handler("/sala/123/alerta"));
        router.dispatch(MQTTMessage::from_bytes("/sala/123/alerta", b"fuego"));
    }

    #[test]
    fn signal_handler_skips_undecodable_payloads() {
        let (router, _rx) = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.on_message(
            "/sala/123/tempActual",
            Handler::signal(SignalKind::Numeric, move |value| sink.lock().push(value)),
        );

        router.dispatch(MQTTMessage::from_bytes("/sala/123/tempActual", b"caliente"));
        router.dispatch(MQTTMessage::from_bytes("/sala/123/tempActual", b"24.5"));
        assert_eq!(*seen.lock(), vec![SignalValue::Numeric(24.5)]);
    }

    #[test]
    fn monitor_sees_every_message() {
        let (router, _rx) = router();
        let mut monitor = router.subscribe_monitor();
        router.dispatch(MQTTMessage::from_bytes("/sala/123/alerta", b"x"));
        assert_eq!(monitor.try_recv().unwrap().topic, "/sala/123/alerta");
    }

    #[test]
    fn publish_offline_never_reaches_transport() {
        let (router, _rx) = router();
        let transport = Arc::new(RecordingTransport::default());
        router.connection().attach(transport.clone());

        // Connecting is not connected
        router.publish("/sala/123/setTempMax", json!("25"));
        assert!(transport.published.lock().is_empty());
    }

    #[test]
    fn publish_when_connected_sends_text() {
        let (router, _rx) = router();
        let transport = Arc::new(RecordingTransport::default());
        let (session, _) = router.connection().attach(transport.clone());
        router
            .connection()
            .handle_event(session, TransportEvent::Connected);

        router.publish("/sala/123/multimedia", json!("https://example.org/a.mp4"));
        router.publish("/sala/123/humActual", json!(65));
        assert_eq!(
            *transport.published.lock(),
            vec![
                (
                    "/sala/123/multimedia".to_string(),
                    "https://example.org/a.mp4".to_string()
                ),
                ("/sala/123/humActual".to_string(), "65".to_string()),
            ]
        );
    }
}
