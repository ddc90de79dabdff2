//! Broker configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file in the
//! user's config directory, then environment variables. Every field is
//! optional; a missing file simply leaves the defaults in place.

use super::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_DIR: &str = "sala-monitor";
const CONFIG_FILE: &str = "mqtt.toml";
const DEFAULT_CLIENT_PREFIX: &str = "immersive-art";
const MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Environment variables, most specific first.
const HOST_VARS: [&str; 2] = ["SALA_MQTT_HOST", "NEXT_PUBLIC_MQTT_HOST"];
const PORT_VARS: [&str; 2] = ["SALA_MQTT_PORT", "NEXT_PUBLIC_MQTT_PORT"];
const USERNAME_VARS: [&str; 2] = ["SALA_MQTT_USERNAME", "NEXT_PUBLIC_MQTT_USERNAME"];
const PASSWORD_VARS: [&str; 2] = ["SALA_MQTT_PASSWORD", "NEXT_PUBLIC_MQTT_PASSWORD"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// `wss`, `ws`, `mqtts` or `mqtt`
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// WebSocket base path, ignored for plain MQTT schemes
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Leading part of the generated client identifier
    pub client_prefix: String,
    /// Pause between a lost connection and the next attempt
    pub reconnect_interval_secs: u64,
    /// Upper bound for a single connect attempt
    pub connect_timeout_secs: u64,
    pub keep_alive_secs: u64,
    /// Capacity of the rumqttc request queue and the inbound message channel
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            scheme: "wss".to_string(),
            host: "broker.hivemq.com".to_string(),
            port: 8884, // WebSocket over TLS
            path: "/mqtt".to_string(),
            username: None,
            password: None,
            client_prefix: DEFAULT_CLIENT_PREFIX.to_string(),
            reconnect_interval_secs: 5,
            connect_timeout_secs: 30,
            keep_alive_secs: 60,
            channel_capacity: 100,
        }
    }
}

impl MqttConfig {
    /// Loads defaults, the config file (if present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                debug!("No config file at {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        info!("MQTT broker configured as {}", config.url());
        Ok(config)
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides host, port and credentials from `lookup`, which maps a
    /// variable name to its value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(*key))
                .find(|value| !value.is_empty())
        };

        if let Some(host) = first(&HOST_VARS) {
            self.host = host;
        }
        if let Some(port) = first(&PORT_VARS) {
            self.port = port
                .trim()
                .parse()
                .map_err(|source| ConfigError::InvalidPort {
                    value: port.clone(),
                    source,
                })?;
        }
        if let Some(username) = first(&USERNAME_VARS) {
            self.username = Some(username);
        }
        if let Some(password) = first(&PASSWORD_VARS) {
            self.password = Some(password);
        }
        Ok(())
    }

    /// Broker URL, e.g. `wss://broker.hivemq.com:8884/mqtt`
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }

    /// Fresh client identifier: prefix, epoch millis and a random suffix, so
    /// concurrent clients on the same broker never collide. The broker client
    /// rejects ids with leading whitespace, so the prefix is trimmed.
    pub fn client_id(&self) -> String {
        let prefix = match self.client_prefix.trim() {
            "" => DEFAULT_CLIENT_PREFIX,
            prefix => prefix,
        };
        format!(
            "{}-{}-{:08x}",
            prefix,
            chrono::Utc::now().timestamp_millis(),
            rand::random::<u32>()
        )
    }

    /// Never shorter than one second.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs).max(MIN_RECONNECT_INTERVAL)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}
