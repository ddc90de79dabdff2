use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

const PREVIEW_CHARS: usize = 10;

/// One inbound message as it left the transport, already UTF-8 decoded.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MQTTMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(PREVIEW_CHARS).collect();
        write!(f, "{} - {}", self.timestamp, preview)
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: String, content: String) -> Self {
        MQTTMessage {
            topic,
            content,
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    /// Invalid UTF-8 sequences are replaced, never rejected.
    pub fn from_bytes(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self::from_topic(topic.into(), String::from_utf8_lossy(payload).into_owned())
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.timestamp, self.topic, self.content)
    }

    pub fn payload(&self) -> Payload {
        Payload::parse(&self.content)
    }
}

/// Structured reading of a message body.
///
/// The body is tried as JSON first; anything that is not valid JSON is kept
/// as the raw text.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Number(f64),
    Bool(bool),
    /// `null`, arrays and objects
    Json(Value),
    Text(String),
}

impl Payload {
    pub fn parse(content: &str) -> Self {
        match serde_json::from_str::<Value>(content) {
            Ok(Value::Number(number)) => match number.as_f64() {
                Some(value) => Payload::Number(value),
                None => Payload::Text(content.to_string()),
            },
            Ok(Value::Bool(value)) => Payload::Bool(value),
            Ok(Value::String(text)) => Payload::Text(text),
            Ok(other) => Payload::Json(other),
            Err(_) => Payload::Text(content.to_string()),
        }
    }

    /// Text form of the payload: strings verbatim, everything else rendered.
    pub fn to_text(&self) -> String {
        match self {
            Payload::Number(value) => value.to_string(),
            Payload::Bool(value) => value.to_string(),
            Payload::Json(value) => value.to_string(),
            Payload::Text(text) => text.clone(),
        }
    }
}

/// Wire form of an outbound value: strings are sent as they are, everything
/// else as JSON text.
pub fn encode_outbound(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
