//! Shared fixtures for executor and pool tests
#![allow(dead_code)]

use luma_core::{CommandEncoding, Device, Event, EventSink, EventSource, MqttTopics, Value};
use luma_registry::{CommandBus, DeviceRegistry, RegistryResult};
use luma_scheduler::{Scheduler, SchedulerConfig};
use luma_script::ScriptExecutor;
use luma_store::StateStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Command bus double recording every publish.
#[derive(Default)]
pub struct RecordingBus {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl CommandBus for RecordingBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> RegistryResult<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

/// Sink that swallows events; scheduler tests drive timers, not patterns.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn dispatch(&self, _event: Event) {}
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<StateStore>,
    pub registry: Arc<DeviceRegistry>,
    pub bus: Arc<RecordingBus>,
    pub executor: ScriptExecutor,
    pub scheduler: Arc<Scheduler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_script_timeout(None)
    }

    pub fn with_script_timeout(timeout: Option<std::time::Duration>) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.db")).unwrap());
        let bus = Arc::new(RecordingBus::default());

        let registry = Arc::new(DeviceRegistry::new(vec![Device {
            id: "porch".to_string(),
            name: "Porch".to_string(),
            kind: "light".to_string(),
            model: None,
            vendor: None,
            attributes: vec!["state".to_string(), "brightness".to_string()],
            actions: vec!["turn_on".to_string(), "turn_off".to_string()],
            mqtt: MqttTopics {
                state_topic: "zigbee2mqtt/Porch".to_string(),
                command_topic: "zigbee2mqtt/Porch/set".to_string(),
                snapshot_topic: None,
            },
            encoding: CommandEncoding::Json,
        }]));
        registry.attach_bus(bus.clone());

        let mut executor =
            ScriptExecutor::new(store.clone(), registry.clone(), dir.path().to_path_buf());
        if let Some(timeout) = timeout {
            executor = executor.with_timeout(timeout);
        }
        let scheduler = Scheduler::new(SchedulerConfig {
            events_dir: dir.path().join("events"),
            coordinates: None,
        });
        executor.attach_scheduler(scheduler.clone());
        scheduler.set_invoker(&executor.invoker_handle());

        Self {
            dir,
            store,
            registry,
            bus,
            executor,
            scheduler,
        }
    }

    /// Write a script under the config dir, returning its absolute path.
    pub fn write_script(&self, rel: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        path
    }

    pub fn device_event(&self, attribute: &str, value: &str) -> Event {
        Event::new(EventSource::Device, "state_change")
            .with_device("porch")
            .with_attribute(attribute)
            .with_topic("zigbee2mqtt/Porch")
            .with_data(HashMap::from([(
                attribute.to_string(),
                Value::from(value),
            )]))
    }
}
