//! Server configuration.
//!
//! One JSON file with a `settings` object and a `servers` array. The file
//! is loaded once at startup; a missing or malformed file is fatal.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use superdash_core::{DeviceConfig, Settings};

/// The configuration file schema.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// Global settings; absent fields take their defaults.
    #[serde(default)]
    pub settings: Settings,
    /// Static device fleet.
    #[serde(default)]
    pub servers: Vec<DeviceConfig>,
}

impl ConfigFile {
    /// Loads and parses the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ConfigFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use superdash_core::DeviceKind;

    #[test]
    fn parses_full_config() {
        let config: ConfigFile = serde_json::from_str(
            r#"{
                "settings": {
                    "defaultFramerate": 50,
                    "updateIntervalMs": 250,
                    "webSocketPort": 8080,
                    "defaultPorts": { "hyperdeck": 9993, "vmix": 8088, "casparcg": 6250 },
                    "emberPlusPort": 9000,
                    "tslUmdDestinations": [ { "host": "10.0.0.50", "port": 4003 } ],
                    "tslUmdScreen": 0
                },
                "servers": [
                    { "id": 1, "name": "HD 1", "type": "hyperdeck", "ip": "10.0.0.11" },
                    { "id": 2, "name": "vMix", "type": "vmix", "ip": "10.0.0.12", "port": 8188 },
                    { "id": 3, "name": "GFX", "type": "casparcg", "ip": "10.0.0.13", "framerate": 25 }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.settings.default_framerate, 50.0);
        assert_eq!(config.settings.tsl_umd_destinations.len(), 1);
        assert_eq!(config.servers.len(), 3);
        assert_eq!(config.servers[1].kind, DeviceKind::Vmix);
        assert_eq!(config.servers[1].port, Some(8188));
        assert_eq!(config.servers[2].framerate, Some(25.0));
    }

    #[test]
    fn missing_sections_take_defaults() {
        let config: ConfigFile = serde_json::from_str("{}").unwrap();
        assert_eq!(config.settings.web_socket_port, 8080);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn unknown_device_type_fails() {
        let result = serde_json::from_str::<ConfigFile>(
            r#"{"servers": [{ "id": 1, "name": "X", "type": "atem", "ip": "10.0.0.1" }]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn malformed_json_fails() {
        assert!(serde_json::from_str::<ConfigFile>("{ nope").is_err());
    }
}
