//! Device registry
//!
//! Holds the static device inventory and the last-known attribute snapshot
//! for every device. `set` translates semantic attribute writes into bus
//! publishes; the snapshot itself only mutates when the bus echoes the
//! change back through `update_snapshot`.

use dashmap::DashMap;
use luma_core::{CommandEncoding, Device, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised by registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device not found: {id}")]
    UnknownDevice { id: String },

    #[error("bus is not connected")]
    NotConnected,

    #[error("publish timed out for {topic}")]
    Timeout { topic: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bus adapter not attached yet")]
    NoBus,
}

/// Outbound command publishing, implemented by the bus adapter.
///
/// Kept as a trait so the registry (and everything above it) is testable
/// without a broker.
pub trait CommandBus: Send + Sync {
    /// Publish `payload` to `topic` QoS 0, non-retained. Blocks up to the
    /// adapter's publish timeout.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> RegistryResult<()>;
}

/// The device registry.
pub struct DeviceRegistry {
    devices: DashMap<String, Device>,
    snapshots: DashMap<String, HashMap<String, Value>>,
    bus: OnceLock<Arc<dyn CommandBus>>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<Device>) -> Self {
        let registry = Self {
            devices: DashMap::new(),
            snapshots: DashMap::new(),
            bus: OnceLock::new(),
        };
        for device in devices {
            registry.insert(device);
        }
        registry
    }

    /// Attach the outbound bus. Called once during wiring.
    pub fn attach_bus(&self, bus: Arc<dyn CommandBus>) {
        if self.bus.set(bus).is_err() {
            warn!("Command bus attached twice, keeping the first");
        }
    }

    /// Register a device (startup inventory or a dynamic platform).
    pub fn insert(&self, device: Device) {
        self.snapshots.entry(device.id.clone()).or_default();
        self.devices.insert(device.id.clone(), device);
    }

    /// Remove a device and its snapshot. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.snapshots.remove(id);
        self.devices.remove(id).is_some()
    }

    /// A copy of the device's last-known attribute snapshot.
    pub fn get(&self, id: &str) -> RegistryResult<HashMap<String, Value>> {
        self.snapshots
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| RegistryError::UnknownDevice { id: id.to_string() })
    }

    /// The static device record, if registered.
    pub fn device(&self, id: &str) -> Option<Device> {
        self.devices.get(id).map(|d| d.clone())
    }

    /// A stable snapshot of all registered devices.
    pub fn list(&self) -> Vec<Device> {
        self.devices.iter().map(|d| d.clone()).collect()
    }

    /// Find the device owning `topic` (state or snapshot binding).
    pub fn find_by_topic(&self, topic: &str) -> Option<Device> {
        self.devices
            .iter()
            .find(|d| d.owns_topic(topic))
            .map(|d| d.clone())
    }

    /// Merge `attrs` into the stored snapshot.
    ///
    /// The merge happens under the device's map entry, so readers never
    /// observe a partially applied payload. Unknown device ids are
    /// ignored.
    pub fn update_snapshot(&self, id: &str, attrs: &HashMap<String, Value>) {
        if !self.devices.contains_key(id) {
            return;
        }
        let mut snapshot = self.snapshots.entry(id.to_string()).or_default();
        for (k, v) in attrs {
            snapshot.insert(k.clone(), v.clone());
        }
    }

    /// Publish an attribute write to the device's command topic.
    ///
    /// Does not touch the snapshot; the state changes when the device
    /// echoes it on the bus. Not retried here.
    pub fn set(&self, id: &str, attrs: &HashMap<String, Value>) -> RegistryResult<()> {
        let device = self
            .device(id)
            .ok_or_else(|| RegistryError::UnknownDevice { id: id.to_string() })?;
        let bus = self.bus.get().ok_or(RegistryError::NoBus)?;

        match device.encoding {
            CommandEncoding::Json => {
                let body: serde_json::Map<String, serde_json::Value> = attrs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                let payload = serde_json::Value::Object(body).to_string().into_bytes();
                debug!(device = %id, topic = %device.mqtt.command_topic, "Publishing command");
                bus.publish(&device.mqtt.command_topic, payload)?;
            }
            CommandEncoding::PerAttribute => {
                for (attr, value) in attrs {
                    let topic = format!("{}/{}/set", device.mqtt.command_topic, attr);
                    let payload = scalar_payload(value);
                    debug!(device = %id, topic = %topic, "Publishing attribute command");
                    bus.publish(&topic, payload)?;
                }
            }
        }
        Ok(())
    }
}

/// Scalar coercion for per-attribute command topics.
fn scalar_payload(value: &Value) -> Vec<u8> {
    match value {
        Value::Bool(true) => b"ON".to_vec(),
        Value::Bool(false) => b"OFF".to_vec(),
        Value::Int(i) => i.to_string().into_bytes(),
        Value::Float(f) => f.to_string().into_bytes(),
        Value::Str(s) => s.clone().into_bytes(),
        other => other.to_json().to_string().into_bytes(),
    }
}

/// Thread-safe handle to the registry
pub type SharedDeviceRegistry = Arc<DeviceRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use luma_core::MqttTopics;
    use std::sync::Mutex;

    struct RecordingBus {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        fail_with: Mutex<Option<RegistryError>>,
    }

    impl RecordingBus {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
                fail_with: Mutex::new(None),
            })
        }

        fn published(&self) -> Vec<(String, Vec<u8>)> {
            self.published.lock().unwrap().clone()
        }
    }

    impl CommandBus for RecordingBus {
        fn publish(&self, topic: &str, payload: Vec<u8>) -> RegistryResult<()> {
            if let Some(err) = self.fail_with.lock().unwrap().take() {
                return Err(err);
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn light(id: &str, encoding: CommandEncoding) -> Device {
        Device {
            id: id.to_string(),
            name: id.to_string(),
            kind: "light".to_string(),
            model: None,
            vendor: None,
            attributes: vec!["state".to_string(), "brightness".to_string()],
            actions: vec![],
            mqtt: MqttTopics {
                state_topic: format!("zigbee2mqtt/{id}"),
                command_topic: format!("zigbee2mqtt/{id}/set"),
                snapshot_topic: None,
            },
            encoding,
        }
    }

    #[test]
    fn test_get_returns_copy() {
        let registry = DeviceRegistry::new(vec![light("porch", CommandEncoding::Json)]);
        registry.update_snapshot(
            "porch",
            &HashMap::from([("state".to_string(), Value::from("ON"))]),
        );

        let mut copy = registry.get("porch").unwrap();
        copy.insert("state".to_string(), Value::from("OFF"));

        assert_eq!(
            registry.get("porch").unwrap().get("state"),
            Some(&Value::from("ON"))
        );
    }

    #[test]
    fn test_get_unknown_device() {
        let registry = DeviceRegistry::new(vec![]);
        assert!(matches!(
            registry.get("ghost").unwrap_err(),
            RegistryError::UnknownDevice { .. }
        ));
    }

    #[test]
    fn test_update_snapshot_merges() {
        let registry = DeviceRegistry::new(vec![light("porch", CommandEncoding::Json)]);
        registry.update_snapshot(
            "porch",
            &HashMap::from([("state".to_string(), Value::from("ON"))]),
        );
        registry.update_snapshot(
            "porch",
            &HashMap::from([("brightness".to_string(), Value::Int(200))]),
        );

        let snapshot = registry.get("porch").unwrap();
        assert_eq!(snapshot.get("state"), Some(&Value::from("ON")));
        assert_eq!(snapshot.get("brightness"), Some(&Value::Int(200)));
    }

    #[test]
    fn test_set_does_not_update_snapshot() {
        let registry = DeviceRegistry::new(vec![light("porch", CommandEncoding::Json)]);
        registry.attach_bus(RecordingBus::new());

        registry
            .set(
                "porch",
                &HashMap::from([("state".to_string(), Value::from("ON"))]),
            )
            .unwrap();

        assert!(registry.get("porch").unwrap().is_empty());
    }

    #[test]
    fn test_set_json_encoding() {
        let registry = DeviceRegistry::new(vec![light("porch", CommandEncoding::Json)]);
        let bus = RecordingBus::new();
        registry.attach_bus(bus.clone());

        registry
            .set(
                "porch",
                &HashMap::from([("state".to_string(), Value::from("OFF"))]),
            )
            .unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "zigbee2mqtt/porch/set");
        let body: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body, serde_json::json!({"state": "OFF"}));
    }

    #[test]
    fn test_set_per_attribute_encoding() {
        let mut device = light("yard", CommandEncoding::PerAttribute);
        device.mqtt.command_topic = "frigate/yard".to_string();
        let registry = DeviceRegistry::new(vec![device]);
        let bus = RecordingBus::new();
        registry.attach_bus(bus.clone());

        registry
            .set(
                "yard",
                &HashMap::from([("detect".to_string(), Value::Bool(true))]),
            )
            .unwrap();
        registry
            .set(
                "yard",
                &HashMap::from([("threshold".to_string(), Value::Int(7))]),
            )
            .unwrap();

        let published = bus.published();
        assert_eq!(published[0].0, "frigate/yard/detect/set");
        assert_eq!(published[0].1, b"ON");
        assert_eq!(published[1].0, "frigate/yard/threshold/set");
        assert_eq!(published[1].1, b"7");
    }

    #[test]
    fn test_set_surfaces_bus_errors() {
        let registry = DeviceRegistry::new(vec![light("porch", CommandEncoding::Json)]);
        let bus = RecordingBus::new();
        *bus.fail_with.lock().unwrap() = Some(RegistryError::NotConnected);
        registry.attach_bus(bus);

        let err = registry
            .set(
                "porch",
                &HashMap::from([("state".to_string(), Value::from("ON"))]),
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotConnected));
    }

    #[test]
    fn test_find_by_topic() {
        let registry = DeviceRegistry::new(vec![light("porch", CommandEncoding::Json)]);
        assert_eq!(
            registry.find_by_topic("zigbee2mqtt/porch").unwrap().id,
            "porch"
        );
        assert!(registry.find_by_topic("zigbee2mqtt/other").is_none());
    }

    #[test]
    fn test_remove() {
        let registry = DeviceRegistry::new(vec![light("porch", CommandEncoding::Json)]);
        assert!(registry.remove("porch"));
        assert!(!registry.remove("porch"));
        assert!(registry.get("porch").is_err());
    }

    #[test]
    fn test_scalar_payload_coercion() {
        assert_eq!(scalar_payload(&Value::Bool(true)), b"ON");
        assert_eq!(scalar_payload(&Value::Bool(false)), b"OFF");
        assert_eq!(scalar_payload(&Value::Int(42)), b"42");
        assert_eq!(scalar_payload(&Value::Float(1.5)), b"1.5");
        assert_eq!(scalar_payload(&Value::from("dim")), b"dim");
    }
}
