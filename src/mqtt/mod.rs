//! # MQTT Integration Module
//!
//! Messaging client for the room: a long-lived broker session with automatic
//! reconnect, a topic dispatch table and gated publishing.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker address, credentials, timing
//! ├── topics.rs           - Logical name → wire topic table
//! ├── message_manager.rs  - Inbound message and payload decoding
//! ├── mqtt_handler.rs     - Connection state machine and session task
//! ├── router.rs           - Topic → handler dispatch, publish gating
//! ├── metrics.rs          - Connection health derived from counters
//! └── error.rs            - Transport and configuration errors
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! rumqttc EventLoop ──► MqttSession ──► ConnectionManager ──[mpsc]──► MessageRouter ──► handlers
//!                                              ▲                             │
//!                                              └────────── publish ──────────┘
//! ```
//!
//! Failures never leave this module as errors. Connect failures, lost
//! connections and offline publishes are logged and show up as
//! [`mqtt_handler::ConnectionState`] and in the metrics.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod metrics;
pub mod mqtt_handler;
pub mod router;
pub mod topics;

pub use config::MqttConfig;
pub use error::{ConfigError, TransportError};
pub use message_manager::{MQTTMessage, Payload};
pub use metrics::{ConnectionMetrics, MetricsCollector};
pub use mqtt_handler::{ConnectionManager, ConnectionState, SessionId, Transport, TransportEvent};
pub use router::{Handler, MessageRouter};
pub use topics::TopicName;
