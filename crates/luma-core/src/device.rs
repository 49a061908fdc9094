//! Static device records from the inventory

use serde::{Deserialize, Serialize};

/// How `device.set` attributes are encoded onto the command topic.
///
/// This is a per-device policy flag in the inventory rather than something
/// inferred from vendor strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandEncoding {
    /// All attributes in one JSON document published to `command_topic`.
    #[default]
    Json,
    /// One publish per attribute to `<command_topic>/<attr>/set` with a
    /// scalar string body.
    PerAttribute,
}

/// MQTT topic bindings for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttTopics {
    pub state_topic: String,
    pub command_topic: String,
    /// Companion topic carrying binary snapshots, when the device has one.
    /// May contain `+` wildcards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_topic: Option<String>,
}

/// A device as declared in `devices/devices.yaml`.
///
/// The record is static; the live attribute snapshot is held by the
/// device registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    pub mqtt: MqttTopics,
    #[serde(default)]
    pub encoding: CommandEncoding,
}

impl Device {
    /// True when `topic` matches this device's state or snapshot binding.
    /// Both bindings may contain MQTT `+` wildcards.
    pub fn owns_topic(&self, topic: &str) -> bool {
        if topic_matches(&self.mqtt.state_topic, topic) {
            return true;
        }
        self.mqtt
            .snapshot_topic
            .as_deref()
            .is_some_and(|filter| topic_matches(filter, topic))
    }
}

/// MQTT topic filter match supporting `+` and a trailing `#`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (None, None) => return true,
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            _ => return false,
        }
    }
}
