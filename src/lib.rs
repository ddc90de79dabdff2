//! Telemetry and control core for a single-room interactive art installation.
//!
//! Sensor readings and installation state arrive over MQTT, are projected
//! into a [`projection::Snapshot`] that any number of consumers can read or
//! await, and start/stop and threshold commands go back out on the same
//! broker session. [`installation::Installation`] is the entry point.

pub mod command;
pub mod installation;
pub mod mqtt;
pub mod projection;

pub use command::{ArtworkAction, CommandEmitter, ThresholdKind};
pub use installation::Installation;
pub use mqtt::{ConnectionMetrics, ConnectionState, MqttConfig};
pub use projection::{Signal, SignalChange, SignalValue, Snapshot};
