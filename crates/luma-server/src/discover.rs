//! Device discovery over the bus
//!
//! Subscribes to the Zigbee2MQTT bridge inventory, maps the exposed
//! features onto device records and writes `devices/devices.yaml`. The
//! generated file is a starting point; users edit it by hand afterwards.

use crate::Cli;
use anyhow::{Context, Result};
use chrono::Utc;
use luma_config::Inventory;
use luma_core::{CommandEncoding, Device, MqttTopics};
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS, Transport};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const BRIDGE_DEVICES_TOPIC: &str = "zigbee2mqtt/bridge/devices";
const BRIDGE_REQUEST_TOPIC: &str = "zigbee2mqtt/bridge/config/devices/get";

#[derive(Debug, Deserialize)]
struct BridgeDevice {
    #[serde(rename = "type")]
    kind: String,
    friendly_name: String,
    #[serde(default)]
    definition: Option<BridgeDefinition>,
}

#[derive(Debug, Deserialize)]
struct BridgeDefinition {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    exposes: Vec<BridgeExpose>,
}

#[derive(Debug, Deserialize)]
struct BridgeExpose {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    property: Option<String>,
    #[serde(default)]
    features: Vec<BridgeFeature>,
}

#[derive(Debug, Deserialize)]
struct BridgeFeature {
    #[serde(default)]
    property: Option<String>,
}

pub async fn run(cli: &Cli, timeout: Duration) -> Result<()> {
    info!("Starting device discovery");

    let (host, port, tls) = luma_bus::parse_broker(&cli.broker)?;
    let mut options = MqttOptions::new(
        format!("luma-discovery-{}", std::process::id()),
        host,
        port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    if tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    if let Some(user) = &cli.user {
        options.set_credentials(user, cli.pass.as_deref().unwrap_or(""));
    }

    let (client, mut eventloop) = AsyncClient::new(options, 16);

    let devices = tokio::time::timeout(timeout, async {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    client
                        .subscribe(BRIDGE_DEVICES_TOPIC, QoS::AtMostOnce)
                        .await
                        .context("subscribing to bridge inventory")?;
                    // The bridge republishes the retained list on request.
                    client
                        .publish(BRIDGE_REQUEST_TOPIC, QoS::AtMostOnce, false, "")
                        .await
                        .context("requesting bridge inventory")?;
                }
                Ok(MqttEvent::Incoming(Packet::Publish(publish)))
                    if publish.topic == BRIDGE_DEVICES_TOPIC =>
                {
                    let bridge: Vec<BridgeDevice> = serde_json::from_slice(&publish.payload)
                        .context("parsing bridge inventory")?;
                    return Ok::<_, anyhow::Error>(bridge);
                }
                Ok(_) => {}
                Err(e) => return Err(anyhow::anyhow!("bus error during discovery: {e}")),
            }
        }
    })
    .await
    .context("discovery timed out waiting for the bridge inventory")??;

    let _ = client.disconnect().await;

    let devices: Vec<Device> = devices.into_iter().filter_map(map_device).collect();
    if devices.is_empty() {
        warn!("No devices discovered");
        return Ok(());
    }

    info!(count = devices.len(), "Discovered devices");
    let inventory = Inventory {
        devices,
        generated: Some(Utc::now()),
    };
    luma_config::write_inventory(&cli.config, &inventory).context("writing devices.yaml")?;
    info!("Wrote device inventory; edit it and start with `luma-server run`");
    Ok(())
}

fn map_device(bridge: BridgeDevice) -> Option<Device> {
    if bridge.kind == "Coordinator" {
        debug!(device = %bridge.friendly_name, "Skipping coordinator");
        return None;
    }

    let definition = bridge.definition;
    let mut attributes = Vec::new();
    let mut kind = "sensor".to_string();

    if let Some(definition) = &definition {
        for expose in &definition.exposes {
            if let Some(property) = &expose.property {
                if !attributes.contains(property) {
                    attributes.push(property.clone());
                }
            }
            for feature in &expose.features {
                if let Some(property) = &feature.property {
                    if !attributes.contains(property) {
                        attributes.push(property.clone());
                    }
                }
            }
            // A composite expose names the device class.
            if let Some(expose_kind) = &expose.kind {
                if matches!(expose_kind.as_str(), "light" | "switch" | "cover" | "lock") {
                    kind = expose_kind.clone();
                }
            }
        }
    }

    let actions = if attributes.iter().any(|a| a == "state") {
        vec![
            "turn_on".to_string(),
            "turn_off".to_string(),
            "toggle".to_string(),
        ]
    } else {
        Vec::new()
    };

    Some(Device {
        id: slug(&bridge.friendly_name),
        name: bridge.friendly_name.clone(),
        kind,
        model: definition.as_ref().and_then(|d| d.model.clone()),
        vendor: definition.as_ref().and_then(|d| d.vendor.clone()),
        attributes,
        actions,
        mqtt: MqttTopics {
            state_topic: format!("zigbee2mqtt/{}", bridge.friendly_name),
            command_topic: format!("zigbee2mqtt/{}/set", bridge.friendly_name),
            snapshot_topic: None,
        },
        encoding: CommandEncoding::Json,
    })
}

/// Lowercase identifier derived from a friendly name.
fn slug(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
