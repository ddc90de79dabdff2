//! Human-readable connection health, derived on demand from the
//! [`ConnectionManager`] counters.

use super::mqtt_handler::{ConnectionManager, ConnectionState};
use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionMetrics {
    pub status: ConnectionState,
    #[serde(serialize_with = "serialize_uptime")]
    pub uptime: Duration,
    /// Reconnect attempts, not successful reconnections
    pub reconnect_count: u64,
    pub last_reconnect: Option<DateTime<Local>>,
    pub is_connected: bool,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self {
            status: ConnectionState::Disconnected,
            uptime: Duration::ZERO,
            reconnect_count: 0,
            last_reconnect: None,
            is_connected: false,
        }
    }
}

impl ConnectionMetrics {
    pub fn uptime_display(&self) -> String {
        format_uptime(self.uptime)
    }

    pub fn last_reconnect_display(&self) -> Option<String> {
        self.last_reconnect
            .map(|at| at.format("%H:%M:%S").to_string())
    }
}

impl fmt::Display for ConnectionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "status={} uptime={} reconnects={}",
            self.status,
            self.uptime_display(),
            self.reconnect_count
        )?;
        if let Some(last) = self.last_reconnect_display() {
            write!(f, " last_reconnect={}", last)?;
        }
        Ok(())
    }
}

/// `HH:MM:SS`; the hour field keeps growing past 99.
pub fn format_uptime(uptime: Duration) -> String {
    let seconds = uptime.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

fn serialize_uptime<S: Serializer>(uptime: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_uptime(*uptime))
}

pub struct MetricsCollector {
    connection: Arc<ConnectionManager>,
}

impl MetricsCollector {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    pub fn collect(&self) -> ConnectionMetrics {
        self.collect_at(Instant::now())
    }

    /// Metrics as of `now`. Uptime runs from the most recent successful
    /// `connect()`; reconnect attempts do not reset it.
    pub fn collect_at(&self, now: Instant) -> ConnectionMetrics {
        let counters = self.connection.counters();
        let uptime = counters
            .connected_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or(Duration::ZERO);

        ConnectionMetrics {
            status: counters.state,
            uptime,
            reconnect_count: counters.reconnect_count,
            last_reconnect: counters.last_reconnect,
            is_connected: counters.state == ConnectionState::Connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::MqttConfig;
    use crate::mqtt::mqtt_handler::tests::RecordingTransport;
    use crate::mqtt::mqtt_handler::TransportEvent;
    use tokio::sync::mpsc;

    fn collector() -> (MetricsCollector, Arc<ConnectionManager>) {
        let (tx, _rx) = mpsc::channel(1);
        let connection = ConnectionManager::new(MqttConfig::default(), tx);
        (MetricsCollector::new(connection.clone()), connection)
    }

    #[test]
    fn uptime_format() {
        assert_eq!(format_uptime(Duration::ZERO), "00:00:00");
        assert_eq!(format_uptime(Duration::from_millis(59_999)), "00:00:59");
        assert_eq!(format_uptime(Duration::from_secs(3_725)), "01:02:05");
        assert_eq!(format_uptime(Duration::from_secs(100 * 3600 + 1)), "100:00:01");
    }

    #[test]
    fn zero_before_any_connect() {
        let (collector, _) = collector();
        let metrics = collector.collect();
        assert_eq!(metrics, ConnectionMetrics::default());
        assert_eq!(metrics.uptime_display(), "00:00:00");
        assert_eq!(metrics.last_reconnect_display(), None);
    }

    #[test]
    fn uptime_grows_and_survives_reconnect_attempts() {
        let (collector, connection) = collector();
        let (session, _) = connection.attach(Arc::new(RecordingTransport::default()));
        let since = connection.counters().connected_since.unwrap();

        let early = collector.collect_at(since + Duration::from_secs(10));
        connection.handle_event(session, TransportEvent::Reconnect { at: Local::now() });
        let late = collector.collect_at(since + Duration::from_secs(70));

        assert_eq!(early.uptime_display(), "00:00:10");
        assert_eq!(late.uptime_display(), "00:01:10");
        assert_eq!(late.status, ConnectionState::Reconnecting);
    }

    #[test]
    fn three_reconnects_reported() {
        let (collector, connection) = collector();
        let (session, _) = connection.attach(Arc::new(RecordingTransport::default()));
        let mut third = None;
        for _ in 0..3 {
            let at = Local::now();
            connection.handle_event(session, TransportEvent::Reconnect { at });
            third = Some(at);
        }

        let metrics = collector.collect();
        assert_eq!(metrics.reconnect_count, 3);
        assert_eq!(metrics.last_reconnect, third);
        assert!(!metrics.is_connected);
    }

    #[test]
    fn status_mirrors_connection() {
        let (collector, connection) = collector();
        let (session, _) = connection.attach(Arc::new(RecordingTransport::default()));
        assert_eq!(collector.collect().status, ConnectionState::Connecting);
        connection.handle_event(session, TransportEvent::Connected);
        let metrics = collector.collect();
        assert_eq!(metrics.status, ConnectionState::Connected);
        assert!(metrics.is_connected);
    }

    #[test]
    fn serializes_uptime_as_clock() {
        let metrics = ConnectionMetrics {
            uptime: Duration::from_secs(61),
            ..ConnectionMetrics::default()
        };
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["uptime"], "00:01:01");
        assert_eq!(json["status"], "disconnected");
    }
}
