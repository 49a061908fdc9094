//! MQTT bus adapter
//!
//! Owns the persistent broker session: subscribes to every registered
//! device's state topic (plus declared snapshot topics, discovery config
//! topics, and any topic with handlers under `events/bus/`), decodes
//! inbound payloads into canonical events, and publishes outbound
//! commands for the device registry.

mod decode;

use decode::Decoded;
use luma_core::EventSink;
use luma_registry::{CommandBus, DeviceRegistry, RegistryError, RegistryResult};
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Errors raised while establishing the bus session
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid broker url '{0}'")]
    InvalidBroker(String),

    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("connection attempt timed out")]
    ConnectTimeout,
}

/// Bus connection parameters.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// `host`, `host:port`, `tcp://host:port` or `ssl://host:port`.
    pub broker: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Raw topics with handlers under `events/bus/`, subscribed verbatim.
    pub extra_topics: Vec<String>,
}

/// The live MQTT session.
pub struct MqttBus {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    runtime: tokio::runtime::Handle,
}

impl MqttBus {
    /// Connect, subscribe and start the reader task.
    ///
    /// Fails when the first connection attempt does not succeed within
    /// 15 seconds; after that, reconnects retry forever with a 5-second
    /// backoff.
    pub async fn connect(
        config: BusConfig,
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> BusResult<Arc<Self>> {
        let (host, port, tls) = parse_broker(&config.broker)?;

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(KEEP_ALIVE);
        if tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or(""));
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let connected = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(run_session(
            eventloop,
            client.clone(),
            Arc::clone(&connected),
            registry,
            sink,
            config.extra_topics,
            ready_tx,
        ));

        match tokio::time::timeout(CONNECT_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(BusError::Connect("session task ended".to_string())),
            Err(_) => return Err(BusError::ConnectTimeout),
        }

        Ok(Arc::new(Self {
            client,
            connected,
            runtime: tokio::runtime::Handle::current(),
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
        debug!("MQTT disconnected");
    }
}

impl CommandBus for MqttBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> RegistryResult<()> {
        if !self.is_connected() {
            return Err(RegistryError::NotConnected);
        }

        let client = self.client.clone();
        let topic_owned = topic.to_string();
        let result = self.runtime.block_on(async move {
            tokio::time::timeout(
                PUBLISH_TIMEOUT,
                client.publish(topic_owned, QoS::AtMostOnce, false, payload),
            )
            .await
        });

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RegistryError::Transport(e.to_string())),
            Err(_) => Err(RegistryError::Timeout {
                topic: topic.to_string(),
            }),
        }
    }
}

async fn run_session(
    mut eventloop: EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn EventSink>,
    extra_topics: Vec<String>,
    ready: oneshot::Sender<BusResult<()>>,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::Relaxed);
                info!("MQTT connected");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                subscribe_all(&client, &registry, &extra_topics).await;
            }
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                handle_publish(&registry, sink.as_ref(), &publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::Relaxed);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(BusError::Connect(e.to_string())));
                    return;
                }
                error!(error = %e, "MQTT connection lost, retrying in 5s");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Subscriptions are re-issued on every ConnAck so reconnects recover
/// them.
async fn subscribe_all(client: &AsyncClient, registry: &DeviceRegistry, extra_topics: &[String]) {
    for device in registry.list() {
        subscribe(client, &device.mqtt.state_topic).await;
        if let Some(snapshot_topic) = &device.mqtt.snapshot_topic {
            subscribe(client, snapshot_topic).await;
        }
    }
    // Dynamic-device removal watches both discovery config layouts.
    subscribe(client, "homeassistant/+/+/config").await;
    subscribe(client, "homeassistant/+/+/+/config").await;
    for topic in extra_topics {
        subscribe(client, topic).await;
    }
}

async fn subscribe(client: &AsyncClient, topic: &str) {
    match client.subscribe(topic, QoS::AtMostOnce).await {
        Ok(()) => debug!(topic = %topic, "Subscribed"),
        Err(e) => warn!(topic = %topic, error = %e, "Subscribe failed"),
    }
}

fn handle_publish(registry: &DeviceRegistry, sink: &dyn EventSink, topic: &str, payload: &[u8]) {
    if let Some(object_id) = decode::discovery_removal(topic, payload) {
        if registry.remove(&object_id) {
            info!(device = %object_id, "Device removed by empty discovery payload");
        }
        return;
    }

    let Some(device) = registry.find_by_topic(topic) else {
        // A topic subscribed for the events/bus/ tree.
        sink.dispatch(decode::bus_event(topic, payload));
        return;
    };

    match decode::decode_payload(topic, payload) {
        Decoded::State(attrs) => {
            // Snapshot first so handlers reading device.get() see the
            // change that triggered them.
            registry.update_snapshot(&device.id, &attrs);
            for event in decode::events_for_state(&device.id, topic, &attrs) {
                sink.dispatch(event);
            }
        }
        Decoded::Snapshot { object_type, bytes } => {
            debug!(device = %device.id, object = %object_type, size = bytes.len(), "Snapshot received");
            sink.dispatch(decode::snapshot_event(&device.id, topic, object_type, bytes));
        }
        Decoded::Ignore => {
            debug!(device = %device.id, topic = %topic, size = payload.len(), "Dropping undecodable payload");
        }
    }
}

/// Topics with handler directories under `events/bus/`.
///
/// A directory is a topic when it directly contains at least one `*.lua`
/// file; the topic is its path relative to `events/bus/`.
pub fn topics_from_tree(config_dir: &Path) -> Vec<String> {
    let bus_dir = config_dir.join("events").join("bus");
    let mut topics = Vec::new();
    collect_topics(&bus_dir, String::new(), &mut topics);
    topics.sort();
    topics
}

fn collect_topics(dir: &Path, prefix: String, topics: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut has_scripts = false;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_dir() {
            let child = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            collect_topics(&path, child, topics);
        } else if name.ends_with(".lua") {
            has_scripts = true;
        }
    }

    if has_scripts && !prefix.is_empty() {
        topics.push(prefix);
    }
}

/// Split a broker URL into `(host, port, tls)`. Bare `host` and
/// `host:port` default to plain TCP.
pub fn parse_broker(broker: &str) -> BusResult<(String, u16, bool)> {
    let (rest, tls) = if let Some(rest) = broker.strip_prefix("tcp://") {
        (rest, false)
    } else if let Some(rest) = broker.strip_prefix("ssl://") {
        (rest, true)
    } else if broker.contains("://") {
        return Err(BusError::InvalidBroker(broker.to_string()));
    } else {
        (broker, false)
    };

    let default_port = if tls { 8883 } else { 1883 };
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| BusError::InvalidBroker(broker.to_string()))?;
            Ok((host.to_string(), port, tls))
        }
        None => Ok((rest.to_string(), default_port, tls)),
    }
}
