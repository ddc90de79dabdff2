//! Applies decoded signal values to the shared [`Snapshot`].
//!
//! The snapshot lives in a `watch` channel: any number of readers can borrow
//! or await it while the single dispatch task writes. A value that equals the
//! stored one (exact comparison, also for floats) is not written and wakes
//! nobody; a different value wakes the watch receivers and emits one
//! [`SignalChange`] on the broadcast channel.

use super::{Signal, SignalChange, SignalValue, Snapshot};
use crate::mqtt::router::{Handler, MessageRouter};
use chrono::Local;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const CHANGE_CAPACITY: usize = 64;

pub struct StateProjector {
    snapshot_tx: watch::Sender<Snapshot>,
    changes_tx: broadcast::Sender<SignalChange>,
}

impl Default for StateProjector {
    fn default() -> Self {
        Self::new()
    }
}

impl StateProjector {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Snapshot::default());
        let (changes_tx, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            snapshot_tx,
            changes_tx,
        }
    }

    /// Registers one handler per projected signal on `router`.
    pub fn install(self: &Arc<Self>, router: &MessageRouter) {
        for signal in Signal::ALL {
            let projector = Arc::clone(self);
            router.on_message(
                signal.topic(),
                Handler::signal(signal.kind(), move |value| {
                    projector.apply(signal, value);
                }),
            );
        }
        debug!("Installed {} signal handlers", Signal::ALL.len());
    }

    /// Writes `value` if it differs from the stored one. Returns whether the
    /// snapshot changed.
    pub(crate) fn apply(&self, signal: Signal, value: SignalValue) -> bool {
        if value.kind() != signal.kind() {
            warn!("Ignoring {:?} value for {:?}", value.kind(), signal);
            return false;
        }

        let now = Local::now();
        let mut change = None;
        self.snapshot_tx.send_if_modified(|snapshot| {
            snapshot.last_updated.insert(signal, now);
            let previous = snapshot.value(signal);
            if previous == value {
                return false;
            }
            if !snapshot.set(signal, value.clone()) {
                return false;
            }
            change = Some(SignalChange {
                signal,
                previous,
                current: value,
                at: now,
            });
            true
        });

        match change {
            Some(change) => {
                info!("{:?} changed: {} -> {}", signal, change.previous, change.current);
                // Err only means no change subscribers
                let _ = self.changes_tx.send(change);
                true
            }
            None => false,
        }
    }

    /// Mirrors the broker connection into the snapshot.
    pub(crate) fn set_online(&self, online: bool) {
        self.snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.mqtt_online == online {
                return false;
            }
            snapshot.mqtt_online = online;
            true
        });
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<SignalChange> {
        self.changes_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::MqttConfig;
    use crate::mqtt::message_manager::MQTTMessage;
    use crate::mqtt::mqtt_handler::ConnectionManager;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::sync::mpsc;

    fn installed() -> (Arc<StateProjector>, MessageRouter) {
        let (tx, _rx) = mpsc::channel(1);
        let router = MessageRouter::new(ConnectionManager::new(MqttConfig::default(), tx));
        let projector = Arc::new(StateProjector::new());
        projector.install(&router);
        (projector, router)
    }

    fn send(router: &MessageRouter, topic: &str, payload: &str) {
        router.dispatch(MQTTMessage::from_bytes(topic, payload.as_bytes()));
    }

    #[test]
    fn sensor_readings_round_trip() {
        let (projector, router) = installed();
        send(&router, "/sala/123/tempActual", "24.5");
        send(&router, "/sala/123/humActual", "61");
        send(&router, "/sala/123/presencia", "ON");
        send(&router, "/sala/123/multimedia", "https://example.org/obra.mp4");

        let snapshot = projector.snapshot();
        assert_eq!(snapshot.temperature, 24.5);
        assert_eq!(snapshot.humidity, 61.0);
        assert!(snapshot.presence);
        assert_eq!(snapshot.media_link, "https://example.org/obra.mp4");
    }

    #[test]
    fn presence_off_in_any_case() {
        let (projector, router) = installed();
        for off in ["off", "OFF", "Off", "oFf"] {
            send(&router, "/sala/123/presencia", "ON");
            assert!(projector.snapshot().presence);
            send(&router, "/sala/123/presencia", off);
            assert!(!projector.snapshot().presence, "{off} should clear presence");
        }
    }

    #[test]
    fn malformed_numbers_never_change_state() {
        let (projector, router) = installed();
        let topics = [
            "/sala/123/tempActual",
            "/sala/123/humActual",
            "/sala/123/setTempMin",
            "/sala/123/setTempMax",
            "/sala/123/setHumMin",
            "/sala/123/setHumMax",
        ];
        let before = projector.snapshot();
        for topic in topics {
            for payload in ["", "abc", "NaN", "true", "{\"v\":1}", "C12", "inf", "Infinity"] {
                send(&router, topic, payload);
            }
        }
        let after = projector.snapshot();
        assert_eq!(after.temperature, before.temperature);
        assert_eq!(after.humidity, before.humidity);
        assert_eq!(after.temp_min, before.temp_min);
        assert_eq!(after.temp_max, before.temp_max);
        assert_eq!(after.hum_min, before.hum_min);
        assert_eq!(after.hum_max, before.hum_max);
        assert!(after.last_updated.is_empty());
    }

    #[test]
    fn readings_with_units_keep_leading_number() {
        let (projector, router) = installed();
        send(&router, "/sala/123/tempActual", "24.5C");
        assert_eq!(projector.snapshot().temperature, 24.5);
        send(&router, "/sala/123/tempActual", "26 °C");
        assert_eq!(projector.snapshot().temperature, 26.0);
        send(&router, "/sala/123/tempActual", "12,5");
        assert_eq!(projector.snapshot().temperature, 12.0);
        send(&router, "/sala/123/humActual", " 58% ");
        assert_eq!(projector.snapshot().humidity, 58.0);
    }

    #[test]
    fn one_notification_per_distinct_value() {
        let (projector, router) = installed();
        let mut changes = projector.subscribe_changes();

        send(&router, "/sala/123/setTempMax", "25");
        send(&router, "/sala/123/setTempMax", "25");
        send(&router, "/sala/123/setTempMax", "25.0");
        send(&router, "/sala/123/setTempMax", "26");

        let first = changes.try_recv().unwrap();
        assert_eq!(first.signal, Signal::TempMax);
        assert_eq!(first.previous, SignalValue::Numeric(30.0));
        assert_eq!(first.current, SignalValue::Numeric(25.0));
        assert_eq!(
            changes.try_recv().unwrap().current,
            SignalValue::Numeric(26.0)
        );
        assert_eq!(changes.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn repeated_value_does_not_wake_watchers() {
        let (projector, router) = installed();
        let mut watcher = projector.subscribe();

        send(&router, "/sala/123/presencia", "true");
        assert!(watcher.has_changed().unwrap());
        watcher.borrow_and_update();

        send(&router, "/sala/123/presencia", "ON");
        assert!(!watcher.has_changed().unwrap());
        assert!(projector
            .snapshot()
            .last_updated
            .contains_key(&Signal::Presence));
    }

    #[test]
    fn artwork_state_read_from_control_topic() {
        let (projector, router) = installed();
        send(&router, "/sala/123/comando", "ON");
        assert!(projector.snapshot().artwork_active);
        // An echoed operator command is not an "ON" state report
        send(&router, "/sala/123/comando", r#"{"accion":"iniciar","timestamp":1}"#);
        assert!(!projector.snapshot().artwork_active);
    }

    #[test]
    fn consumer_alert_scenario() {
        let (projector, router) = installed();
        send(&router, "/sala/123/tempActual", "26.0");
        send(&router, "/sala/123/setTempMax", "25");
        let snapshot = projector.snapshot();
        assert!(snapshot.temperature > snapshot.temp_max);
        assert!(snapshot.alerts().temperature);
    }

    #[test]
    fn online_flag_is_deduplicated() {
        let projector = StateProjector::new();
        let mut watcher = projector.subscribe();
        projector.set_online(false);
        assert!(!watcher.has_changed().unwrap());
        projector.set_online(true);
        assert!(watcher.has_changed().unwrap());
        assert!(projector.snapshot().mqtt_online);
    }
}
