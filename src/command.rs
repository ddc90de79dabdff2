//! Outbound commands to the installation.
//!
//! All commands go through [`MessageRouter::publish`], so they are dropped
//! (with a warning) while the broker is offline. Nothing is batched or
//! diffed here; callers publish exactly the fields they want to change.

use crate::mqtt::router::MessageRouter;
use crate::mqtt::topics::TopicName;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ArtworkAction {
    #[serde(rename = "iniciar")]
    Start,
    #[serde(rename = "detener")]
    Stop,
}

impl fmt::Display for ArtworkAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArtworkAction::Start => f.write_str("iniciar"),
            ArtworkAction::Stop => f.write_str("detener"),
        }
    }
}

/// Control payload as the installation expects it on the wire.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ControlCommand {
    #[serde(rename = "accion")]
    pub action: ArtworkAction,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl ControlCommand {
    pub fn now(action: ArtworkAction) -> Self {
        Self {
            action,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThresholdKind {
    TempMin,
    TempMax,
    HumMin,
    HumMax,
}

impl ThresholdKind {
    pub fn topic_name(self) -> TopicName {
        match self {
            ThresholdKind::TempMin => TopicName::TempMin,
            ThresholdKind::TempMax => TopicName::TempMax,
            ThresholdKind::HumMin => TopicName::HumMin,
            ThresholdKind::HumMax => TopicName::HumMax,
        }
    }
}

pub struct CommandEmitter {
    router: Arc<MessageRouter>,
}

impl CommandEmitter {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self { router }
    }

    /// Publishes `{"accion": ..., "timestamp": ...}` on the control topic.
    pub fn control_artwork(&self, action: ArtworkAction) {
        let command = ControlCommand::now(action);
        match serde_json::to_value(&command) {
            Ok(payload) => {
                info!("Sending artwork command: {}", action);
                self.router
                    .publish(TopicName::ArtworkControl.topic(), payload);
            }
            Err(e) => error!("Failed to encode artwork command: {}", e),
        }
    }

    pub fn start(&self) {
        self.control_artwork(ArtworkAction::Start);
    }

    pub fn stop(&self) {
        self.control_artwork(ArtworkAction::Stop);
    }

    /// Publishes `raw` unchanged on the threshold topic of `kind`.
    pub fn publish_threshold(&self, kind: ThresholdKind, raw: &str) {
        self.router
            .publish(kind.topic_name().topic(), Value::String(raw.to_string()));
    }

    /// Publishes `value` as numeric text (`25`, `25.5`).
    pub fn set_threshold(&self, kind: ThresholdKind, value: f64) {
        self.publish_threshold(kind, &value.to_string());
    }

    pub fn set_media_link(&self, url: &str) {
        self.router
            .publish(TopicName::MediaLink.topic(), Value::String(url.to_string()));
    }

    /// Fixed set of readings for exercising a fresh broker setup end to end.
    pub fn publish_sample_readings(&self) {
        self.router.publish(TopicName::Temperature.topic(), json!(24.5));
        self.router.publish(TopicName::Humidity.topic(), json!(65));
        self.router.publish(TopicName::Presence.topic(), json!(true));
        self.router.publish(TopicName::ArtworkState.topic(), json!(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::MqttConfig;
    use crate::mqtt::mqtt_handler::tests::RecordingTransport;
    use crate::mqtt::mqtt_handler::{ConnectionManager, TransportEvent};
    use tokio::sync::mpsc;

    fn connected() -> (CommandEmitter, Arc<RecordingTransport>) {
        let (tx, _rx) = mpsc::channel(1);
        let connection = ConnectionManager::new(MqttConfig::default(), tx);
        let transport = Arc::new(RecordingTransport::default());
        let (session, _) = connection.attach(transport.clone());
        connection.handle_event(session, TransportEvent::Connected);
        let router = Arc::new(MessageRouter::new(connection));
        (CommandEmitter::new(router), transport)
    }

    #[test]
    fn control_payload_shape() {
        let (emitter, transport) = connected();
        emitter.start();
        emitter.stop();

        let published = transport.published.lock();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "/sala/123/comando");

        let start: Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(start["accion"], "iniciar");
        assert!(start["timestamp"].as_i64().unwrap() > 0);
        let stop: Value = serde_json::from_str(&published[1].1).unwrap();
        assert_eq!(stop["accion"], "detener");
    }

    #[test]
    fn thresholds_are_plain_numbers() {
        let (emitter, transport) = connected();
        emitter.set_threshold(ThresholdKind::TempMax, 25.0);
        emitter.set_threshold(ThresholdKind::HumMin, 40.5);
        emitter.publish_threshold(ThresholdKind::HumMax, "70");

        assert_eq!(
            *transport.published.lock(),
            vec![
                ("/sala/123/setTempMax".to_string(), "25".to_string()),
                ("/sala/123/setHumMin".to_string(), "40.5".to_string()),
                ("/sala/123/setHumMax".to_string(), "70".to_string()),
            ]
        );
    }

    #[test]
    fn sample_readings() {
        let (emitter, transport) = connected();
        emitter.publish_sample_readings();
        let published = transport.published.lock();
        assert_eq!(
            published[0],
            ("/sala/123/tempActual".to_string(), "24.5".to_string())
        );
        assert_eq!(published[3].1, "false");
    }

    #[test]
    fn nothing_sent_while_offline() {
        let (tx, _rx) = mpsc::channel(1);
        let connection = ConnectionManager::new(MqttConfig::default(), tx);
        let transport = Arc::new(RecordingTransport::default());
        connection.attach(transport.clone());
        let emitter = CommandEmitter::new(Arc::new(MessageRouter::new(connection)));

        emitter.start();
        emitter.set_media_link("https://example.org");
        assert!(transport.published.lock().is_empty());
    }
}
