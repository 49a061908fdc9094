//! Inbound payload decoding and event synthesis
//!
//! Pure functions, kept free of the MQTT session so the pipeline is
//! testable without a broker.

use luma_core::{Event, EventSource, Value};
use std::collections::HashMap;

/// Keys that never become event subjects; their values still ride along
/// in `data` of sibling events.
const HOUSEKEEPING_KEYS: &[&str] = &["linkquality", "last_seen"];

/// JPEG start-of-image marker.
const JPEG_MAGIC: [u8; 2] = [0xFF, 0xD8];

/// Non-magic payloads above this size are dropped unparsed.
const MAX_OPAQUE_PAYLOAD: usize = 10_000;

/// What an inbound device payload turned out to be.
#[derive(Debug, PartialEq)]
pub(crate) enum Decoded {
    /// Binary snapshot; `object_type` parsed from the topic.
    Snapshot { object_type: String, bytes: Vec<u8> },
    /// A flat attribute map.
    State(HashMap<String, Value>),
    /// Undecodable; drop with a debug log.
    Ignore,
}

pub(crate) fn decode_payload(topic: &str, payload: &[u8]) -> Decoded {
    if payload.len() > 2 && payload[..2] == JPEG_MAGIC {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() >= 4 && parts[parts.len() - 1] == "snapshot" {
            return Decoded::Snapshot {
                object_type: parts[parts.len() - 2].to_string(),
                bytes: payload.to_vec(),
            };
        }
        return Decoded::Ignore;
    }

    if payload.len() > MAX_OPAQUE_PAYLOAD {
        return Decoded::Ignore;
    }

    if let Some(attrs) = Value::object_from_json_slice(payload) {
        return Decoded::State(attrs);
    }

    // Scalar values on nested per-attribute topics:
    // <vendor>/<name>/<attribute>/state with a bare string payload.
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() >= 3 && parts[parts.len() - 1] == "state" {
        if let Ok(text) = std::str::from_utf8(payload) {
            let attribute = parts[parts.len() - 2];
            return Decoded::State(HashMap::from([(
                attribute.to_string(),
                Value::Str(text.to_string()),
            )]));
        }
    }

    Decoded::Ignore
}

/// One event per non-housekeeping payload key. Every event carries the
/// full payload in `data` so handlers can see co-changed siblings.
pub(crate) fn events_for_state(
    device: &str,
    topic: &str,
    attrs: &HashMap<String, Value>,
) -> Vec<Event> {
    let mut subjects: Vec<&String> = attrs
        .keys()
        .filter(|key| !HOUSEKEEPING_KEYS.contains(&key.as_str()))
        .collect();
    subjects.sort();

    subjects
        .into_iter()
        .map(|attribute| {
            Event::new(EventSource::Device, "state_change")
                .with_device(device)
                .with_attribute(attribute)
                .with_topic(topic)
                .with_data(attrs.clone())
        })
        .collect()
}

pub(crate) fn snapshot_event(
    device: &str,
    topic: &str,
    object_type: String,
    bytes: Vec<u8>,
) -> Event {
    let size = bytes.len();
    Event::new(EventSource::Device, "snapshot")
        .with_device(device)
        .with_attribute(object_type.clone())
        .with_topic(topic)
        .with_data(HashMap::from([
            ("object_type".to_string(), Value::Str(object_type)),
            ("size".to_string(), Value::Int(size as i64)),
            ("snapshot".to_string(), Value::Bytes(bytes)),
        ]))
}

/// A raw bus message for the `events/bus/` tree: JSON when it parses,
/// otherwise the payload wrapped verbatim.
pub(crate) fn bus_event(topic: &str, payload: &[u8]) -> Event {
    let data = Value::object_from_json_slice(payload).unwrap_or_else(|| {
        HashMap::from([(
            "payload".to_string(),
            Value::Str(String::from_utf8_lossy(payload).into_owned()),
        )])
    });
    Event::new(EventSource::Bus, "message")
        .with_topic(topic)
        .with_data(data)
}

/// An empty payload on a discovery config topic
/// (`homeassistant/<component>/[<node>/]<object>/config`) removes the
/// dynamic device named by the object id.
pub(crate) fn discovery_removal(topic: &str, payload: &[u8]) -> Option<String> {
    if !payload.is_empty() {
        return None;
    }
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.first() != Some(&"homeassistant") || parts.last() != Some(&"config") {
        return None;
    }
    if parts.len() == 4 || parts.len() == 5 {
        return Some(parts[parts.len() - 2].to_string());
    }
    None
}
