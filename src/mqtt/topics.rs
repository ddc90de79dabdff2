//! Wire topics of the room.
//!
//! Every topic lives under the single `/sala/123` namespace. The table is
//! constant for the lifetime of the process, so a reconnect always subscribes
//! to exactly the same set.

use std::fmt;

/// Logical names of the topics the installation talks on.
///
/// `ArtworkState` and `ArtworkControl` share `/sala/123/comando`: the
/// installation reports its state on the same channel the operator commands
/// it on. Inbound traffic on that topic is always read as `ArtworkState`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicName {
    Temperature,
    Humidity,
    Presence,
    ArtworkState,
    ArtworkControl,
    ArtworkAlert,
    TempMin,
    TempMax,
    HumMin,
    HumMax,
    MediaLink,
}

impl TopicName {
    pub const ALL: [TopicName; 11] = [
        TopicName::Temperature,
        TopicName::Humidity,
        TopicName::Presence,
        TopicName::ArtworkState,
        TopicName::ArtworkControl,
        TopicName::ArtworkAlert,
        TopicName::TempMin,
        TopicName::TempMax,
        TopicName::HumMin,
        TopicName::HumMax,
        TopicName::MediaLink,
    ];

    pub const fn topic(self) -> &'static str {
        match self {
            TopicName::Temperature => "/sala/123/tempActual",
            TopicName::Humidity => "/sala/123/humActual",
            TopicName::Presence => "/sala/123/presencia",
            TopicName::ArtworkState => "/sala/123/comando",
            TopicName::ArtworkControl => "/sala/123/comando",
            TopicName::ArtworkAlert => "/sala/123/alerta",
            TopicName::TempMin => "/sala/123/setTempMin",
            TopicName::TempMax => "/sala/123/setTempMax",
            TopicName::HumMin => "/sala/123/setHumMin",
            TopicName::HumMax => "/sala/123/setHumMax",
            TopicName::MediaLink => "/sala/123/multimedia",
        }
    }

    /// Resolves a wire topic back to its logical name. The shared control
    /// topic resolves to [`TopicName::ArtworkState`].
    pub fn from_topic(topic: &str) -> Option<TopicName> {
        Self::ALL.into_iter().find(|name| name.topic() == topic)
    }

    /// Distinct wire topics to subscribe after every successful connect,
    /// in table order.
    pub fn subscriptions() -> Vec<&'static str> {
        let mut topics: Vec<&'static str> = Vec::with_capacity(Self::ALL.len());
        for name in Self::ALL {
            if !topics.contains(&name.topic()) {
                topics.push(name.topic());
            }
        }
        topics
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.topic())
    }
}
