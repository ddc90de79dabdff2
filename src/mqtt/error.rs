//! Error types for the MQTT layer

use std::num::ParseIntError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the transport handle or of building a session.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The rumqttc request queue rejected the request
    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// Broker address could not be turned into transport options
    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),

    /// No tokio runtime is available to drive the session
    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    /// Request refused by a non-rumqttc transport
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid broker port {value:?}: {source}")]
    InvalidPort {
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
