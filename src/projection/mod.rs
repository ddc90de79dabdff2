//! Installation state as seen by consumers.
//!
//! Every projected [`Signal`] is bound to one wire topic and one decode
//! [`SignalKind`]. The [`Snapshot`] aggregates the current value of all
//! signals plus the broker online flag; it is only ever written by the
//! [`projector::StateProjector`].

pub mod projector;

pub use projector::StateProjector;

use crate::mqtt::message_manager::Payload;
use crate::mqtt::topics::TopicName;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("not a number: {0:?}")]
    NotNumeric(String),

    #[error("non-finite number: {0}")]
    NonFinite(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SignalKind {
    Numeric,
    Boolean,
    Text,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalValue {
    Numeric(f64),
    Boolean(bool),
    Text(String),
}

impl SignalValue {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalValue::Numeric(_) => SignalKind::Numeric,
            SignalValue::Boolean(_) => SignalKind::Boolean,
            SignalValue::Text(_) => SignalKind::Text,
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignalValue::Numeric(value) => write!(f, "{}", value),
            SignalValue::Boolean(true) => f.write_str("ON"),
            SignalValue::Boolean(false) => f.write_str("OFF"),
            SignalValue::Text(text) => write!(f, "{:?}", text),
        }
    }
}

impl SignalKind {
    /// Coerces a decoded payload into a value of this kind.
    ///
    /// - `Numeric`: a JSON number or the longest float prefix of a string
    ///   (`"24.5C"` is 24.5, `"12,5"` is 12). NaN and infinities are rejected.
    /// - `Boolean`: a JSON boolean, or a string equal to `ON` or `true`
    ///   ignoring case. Everything else is `false`, never an error.
    /// - `Text`: strings verbatim, other payloads in their text form.
    pub fn decode(self, payload: &Payload) -> Result<SignalValue, DecodeError> {
        match self {
            SignalKind::Numeric => {
                let value = match payload {
                    Payload::Number(value) => *value,
                    Payload::Text(text) => float_prefix(text)
                        .ok_or_else(|| DecodeError::NotNumeric(text.clone()))?,
                    other => return Err(DecodeError::NotNumeric(other.to_text())),
                };
                if !value.is_finite() {
                    return Err(DecodeError::NonFinite(value));
                }
                Ok(SignalValue::Numeric(value))
            }
            SignalKind::Boolean => {
                let value = match payload {
                    Payload::Bool(value) => *value,
                    Payload::Text(text) => {
                        text.eq_ignore_ascii_case("on") || text.eq_ignore_ascii_case("true")
                    }
                    _ => false,
                };
                Ok(SignalValue::Boolean(value))
            }
            SignalKind::Text => Ok(SignalValue::Text(payload.to_text())),
        }
    }
}

/// Longest leading float literal of `text`, after leading whitespace.
///
/// Accepts an optional sign, digits with an optional fraction, an optional
/// exponent, or `Infinity`. Trailing garbage is ignored.
fn float_prefix(text: &str) -> Option<f64> {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    if text[end..].starts_with("Infinity") {
        return text[..end + "Infinity".len()].parse().ok();
    }

    let digits = |from: usize| {
        bytes[from..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };
    let integer = digits(end);
    end += integer;
    let mut fraction = 0;
    if bytes.get(end) == Some(&b'.') {
        fraction = digits(end + 1);
        if integer > 0 || fraction > 0 {
            end += 1 + fraction;
        }
    }
    if integer == 0 && fraction == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exponent = end + 1;
        if matches!(bytes.get(exponent), Some(b'+' | b'-')) {
            exponent += 1;
        }
        let count = digits(exponent);
        if count > 0 {
            end = exponent + count;
        }
    }
    text[..end].parse().ok()
}

/// Projected signals. The alert topic is subscribed but not projected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Temperature,
    Humidity,
    TempMin,
    TempMax,
    HumMin,
    HumMax,
    Presence,
    ArtworkActive,
    MediaLink,
}

/// Per-topic decode table
const SIGNALS: [(Signal, TopicName, SignalKind); 9] = [
    (Signal::Temperature, TopicName::Temperature, SignalKind::Numeric),
    (Signal::Humidity, TopicName::Humidity, SignalKind::Numeric),
    (Signal::TempMin, TopicName::TempMin, SignalKind::Numeric),
    (Signal::TempMax, TopicName::TempMax, SignalKind::Numeric),
    (Signal::HumMin, TopicName::HumMin, SignalKind::Numeric),
    (Signal::HumMax, TopicName::HumMax, SignalKind::Numeric),
    (Signal::Presence, TopicName::Presence, SignalKind::Boolean),
    (Signal::ArtworkActive, TopicName::ArtworkState, SignalKind::Boolean),
    (Signal::MediaLink, TopicName::MediaLink, SignalKind::Text),
];

impl Signal {
    pub const ALL: [Signal; 9] = [
        Signal::Temperature,
        Signal::Humidity,
        Signal::TempMin,
        Signal::TempMax,
        Signal::HumMin,
        Signal::HumMax,
        Signal::Presence,
        Signal::ArtworkActive,
        Signal::MediaLink,
    ];

    fn entry(self) -> (Signal, TopicName, SignalKind) {
        SIGNALS[self as usize]
    }

    pub fn topic_name(self) -> TopicName {
        self.entry().1
    }

    pub fn topic(self) -> &'static str {
        self.topic_name().topic()
    }

    pub fn kind(self) -> SignalKind {
        self.entry().2
    }

    pub fn from_topic(topic: &str) -> Option<Signal> {
        SIGNALS
            .iter()
            .find(|(_, name, _)| name.topic() == topic)
            .map(|(signal, _, _)| *signal)
    }
}

/// Current value of every signal plus the broker online flag.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub temp_min: f64,
    pub temp_max: f64,
    pub hum_min: f64,
    pub hum_max: f64,
    pub presence: bool,
    pub artwork_active: bool,
    pub mqtt_online: bool,
    pub media_link: String,
    /// Time of the last successfully decoded message per signal, including
    /// messages that repeated the stored value
    pub last_updated: BTreeMap<Signal, DateTime<Local>>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            temperature: 22.5,
            humidity: 55.0,
            temp_min: 18.0,
            temp_max: 30.0,
            hum_min: 40.0,
            hum_max: 70.0,
            presence: false,
            artwork_active: false,
            mqtt_online: false,
            media_link: String::new(),
            last_updated: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    pub fn value(&self, signal: Signal) -> SignalValue {
        match signal {
            Signal::Temperature => SignalValue::Numeric(self.temperature),
            Signal::Humidity => SignalValue::Numeric(self.humidity),
            Signal::TempMin => SignalValue::Numeric(self.temp_min),
            Signal::TempMax => SignalValue::Numeric(self.temp_max),
            Signal::HumMin => SignalValue::Numeric(self.hum_min),
            Signal::HumMax => SignalValue::Numeric(self.hum_max),
            Signal::Presence => SignalValue::Boolean(self.presence),
            Signal::ArtworkActive => SignalValue::Boolean(self.artwork_active),
            Signal::MediaLink => SignalValue::Text(self.media_link.clone()),
        }
    }

    /// Stores `value`; returns false when its kind does not fit the signal.
    fn set(&mut self, signal: Signal, value: SignalValue) -> bool {
        match (signal, value) {
            (Signal::Temperature, SignalValue::Numeric(v)) => self.temperature = v,
            (Signal::Humidity, SignalValue::Numeric(v)) => self.humidity = v,
            (Signal::TempMin, SignalValue::Numeric(v)) => self.temp_min = v,
            (Signal::TempMax, SignalValue::Numeric(v)) => self.temp_max = v,
            (Signal::HumMin, SignalValue::Numeric(v)) => self.hum_min = v,
            (Signal::HumMax, SignalValue::Numeric(v)) => self.hum_max = v,
            (Signal::Presence, SignalValue::Boolean(v)) => self.presence = v,
            (Signal::ArtworkActive, SignalValue::Boolean(v)) => self.artwork_active = v,
            (Signal::MediaLink, SignalValue::Text(v)) => self.media_link = v,
            _ => return false,
        }
        true
    }

    /// Readings outside their configured `[min, max]` range.
    pub fn alerts(&self) -> Alerts {
        Alerts {
            temperature: self.temperature < self.temp_min || self.temperature > self.temp_max,
            humidity: self.humidity < self.hum_min || self.humidity > self.hum_max,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Alerts {
    pub temperature: bool,
    pub humidity: bool,
}

impl Alerts {
    pub fn any(&self) -> bool {
        self.temperature || self.humidity
    }
}

/// Notification for one field that took a new value.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SignalChange {
    pub signal: Signal,
    pub previous: SignalValue,
    pub current: SignalValue,
    pub at: DateTime<Local>,
}
