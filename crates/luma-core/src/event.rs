//! The canonical event record

use crate::Value;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Where an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// A device attribute changed (decoded bus payload).
    Device,
    /// A raw bus message on a subscribed topic.
    Bus,
    /// A clock-driven event from the scheduler.
    Time,
    /// A script-created timer fired.
    Timer,
    /// A persisted state key was written.
    State,
    /// A device action was invoked from a script.
    Action,
}

impl EventSource {
    /// The lowercase token scripts see in `event.source`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Device => "device",
            EventSource::Bus => "bus",
            EventSource::Time => "time",
            EventSource::Timer => "timer",
            EventSource::State => "state",
            EventSource::Action => "action",
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event flowing through the system, immutable once produced.
#[derive(Debug, Clone)]
pub struct Event {
    pub source: EventSource,
    /// Free-form type token; semantics depend on `source`
    /// (`state_change`, `snapshot`, a time pattern, an action name).
    pub event_type: String,
    /// Device id, set for device and action events.
    pub device: Option<String>,
    /// Attribute name, set when a specific attribute is the subject.
    pub attribute: Option<String>,
    /// Raw topic, set for bus events and bus-derived device events.
    pub topic: Option<String>,
    pub data: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(source: EventSource, event_type: impl Into<String>) -> Self {
        Self {
            source,
            event_type: event_type.into(),
            device: None,
            attribute: None,
            topic: None,
            data: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_data(mut self, data: HashMap<String, Value>) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_tokens() {
        assert_eq!(EventSource::Device.as_str(), "device");
        assert_eq!(EventSource::Time.to_string(), "time");
        assert_eq!(EventSource::Action.as_str(), "action");
    }

    #[test]
    fn test_builder() {
        let event = Event::new(EventSource::Device, "state_change")
            .with_device("porch")
            .with_attribute("state")
            .with_topic("zigbee2mqtt/Porch")
            .with_data(HashMap::from([("state".to_string(), Value::from("ON"))]));

        assert_eq!(event.device.as_deref(), Some("porch"));
        assert_eq!(event.attribute.as_deref(), Some("state"));
        assert_eq!(event.topic.as_deref(), Some("zigbee2mqtt/Porch"));
        assert_eq!(event.data.get("state"), Some(&Value::from("ON")));
    }
}
