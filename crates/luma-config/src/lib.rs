//! Device inventory loading
//!
//! The inventory lives at `<config>/devices/devices.yaml` and is read once
//! at startup. The `discover` subcommand regenerates it.

mod error;

pub use error::{ConfigError, ConfigResult};

use chrono::{DateTime, Utc};
use luma_core::Device;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Root of `devices.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub devices: Vec<Device>,
    /// When the file was generated by `discover`, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<DateTime<Utc>>,
}

/// Load the device inventory from `<config>/devices/devices.yaml`.
pub fn load_inventory(config_dir: &Path) -> ConfigResult<Inventory> {
    let path = config_dir.join("devices").join("devices.yaml");

    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
        path: path.clone(),
        source,
    })?;

    let inventory: Inventory =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
            path: path.clone(),
            source,
        })?;

    let mut seen = std::collections::HashSet::new();
    for device in &inventory.devices {
        if !seen.insert(device.id.as_str()) {
            return Err(ConfigError::DuplicateDevice {
                id: device.id.clone(),
            });
        }
    }

    info!(count = inventory.devices.len(), "Loaded device inventory");
    Ok(inventory)
}

/// Write the device inventory, creating parent directories as needed.
pub fn write_inventory(config_dir: &Path, inventory: &Inventory) -> ConfigResult<()> {
    let dir = config_dir.join("devices");
    std::fs::create_dir_all(&dir).map_err(|source| ConfigError::WriteFile {
        path: dir.clone(),
        source,
    })?;

    let path = dir.join("devices.yaml");
    let body = serde_yaml::to_string(inventory).map_err(|source| ConfigError::ParseYaml {
        path: path.clone(),
        source,
    })?;

    let header = "# Device inventory. Edit to customise device properties;\n\
                  # run `luma-server discover` to regenerate.\n\n";

    std::fs::write(&path, format!("{header}{body}")).map_err(|source| ConfigError::WriteFile {
        path,
        source,
    })?;

    Ok(())
}
