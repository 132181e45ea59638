//! Core application state types.
//!
//! Provides the global settings schema ([`Settings`]), static device
//! configuration ([`DeviceConfig`]), the normalised runtime state of a
//! device ([`DeviceState`]) and the store that owns all of them
//! ([`DeviceStore`]).

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::utils::monotonic_millis;

// ─────────────────────────────────────────────────────────────────────────────
// Global Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Default ports per device type, overridable from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DefaultPorts {
    pub hyperdeck: u16,
    pub vmix: u16,
    pub casparcg: u16,
}

impl Default for DefaultPorts {
    fn default() -> Self {
        Self {
            hyperdeck: 9993,
            vmix: 8088,
            casparcg: 6250,
        }
    }
}

/// A TSL UMD destination (`{host, port}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TslDestination {
    pub host: String,
    #[serde(default = "TslDestination::default_port")]
    pub port: u16,
}

impl TslDestination {
    fn default_port() -> u16 {
        4003
    }
}

/// Immutable global settings, loaded once at startup.
///
/// All fields have defaults so a minimal configuration file only needs the
/// values it actually changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Frame rate assumed for devices that do not set their own.
    pub default_framerate: f64,

    /// WebSocket snapshot broadcast period (milliseconds).
    pub update_interval_ms: u64,

    /// Port for the HTTP/WebSocket server.
    pub web_socket_port: u16,

    /// Per-type connection port defaults.
    pub default_ports: DefaultPorts,

    /// TCP port for the Ember+ provider.
    pub ember_plus_port: u16,

    /// Interface the Ember+ provider binds to.
    pub ember_plus_bind_address: String,

    /// UDP destinations for TSL UMD v5.0 tally packets. Empty disables the
    /// sender.
    pub tsl_umd_destinations: Vec<TslDestination>,

    /// TSL screen index carried in every packet.
    pub tsl_umd_screen: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_framerate: 25.0,
            update_interval_ms: 1000,
            web_socket_port: 8080,
            default_ports: DefaultPorts::default(),
            ember_plus_port: 9000,
            ember_plus_bind_address: "0.0.0.0".to_string(),
            tsl_umd_destinations: Vec::new(),
            tsl_umd_screen: 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// The protocol spoken by a configured device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Hyperdeck,
    Vmix,
    Casparcg,
}

impl DeviceKind {
    /// Stable lowercase name, used on every wire surface (WS JSON, Ember+
    /// `Type` parameter).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hyperdeck => "hyperdeck",
            Self::Vmix => "vmix",
            Self::Casparcg => "casparcg",
        }
    }

    /// Default connection port for this device type.
    #[must_use]
    pub fn default_port(&self, ports: &DefaultPorts) -> u16 {
        match self {
            Self::Hyperdeck => ports.hyperdeck,
            Self::Vmix => ports.vmix,
            Self::Casparcg => ports.casparcg,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static configuration for one device; immutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Unique stable id; doubles as the Ember+ identifier suffix and the
    /// TSL display index. Must not be 0xFFFF (TSL broadcast).
    pub id: u16,
    /// Display name.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub ip: String,
    /// Connection port; defaults by type when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Frame rate; defaults to the global setting when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<f64>,
}

impl DeviceConfig {
    /// Resolved connection port.
    #[must_use]
    pub fn resolved_port(&self, ports: &DefaultPorts) -> u16 {
        self.port.unwrap_or_else(|| self.kind.default_port(ports))
    }

    /// Resolved frame rate.
    #[must_use]
    pub fn resolved_framerate(&self, settings: &Settings) -> f64 {
        self.framerate.unwrap_or(settings.default_framerate)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Runtime State
// ─────────────────────────────────────────────────────────────────────────────

/// Normalised transport state of a playout device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Stop,
    Play,
    Rec,
    #[default]
    Offline,
}

impl TransportState {
    /// Stable lowercase name used in WS JSON and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Play => "play",
            Self::Rec => "rec",
            Self::Offline => "offline",
        }
    }

    /// Index in the Ember+ enumeration `stop|play|rec|offline`.
    #[must_use]
    pub fn ember_index(&self) -> i64 {
        match self {
            Self::Stop => 0,
            Self::Play => 1,
            Self::Rec => 2,
            Self::Offline => 3,
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime state of one device, owned exclusively by the aggregator.
///
/// Invariant: `state == Offline` implies `connected == false`. The last
/// timecode and filename are retained across a disconnect for operator
/// context; only `state` is forced to offline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub id: u16,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub ip: String,
    pub port: u16,
    pub framerate: f64,
    pub state: TransportState,
    pub timecode: String,
    pub filename: String,
    /// Milliseconds since the process monotonic origin; non-decreasing.
    pub updated: u64,
    pub connected: bool,
}

impl DeviceState {
    /// Creates the initial (offline) state for a configured device.
    #[must_use]
    pub fn from_config(config: &DeviceConfig, settings: &Settings) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            kind: config.kind,
            ip: config.ip.clone(),
            port: config.resolved_port(&settings.default_ports),
            framerate: config.resolved_framerate(settings),
            state: TransportState::Offline,
            timecode: "00:00:00:00".to_string(),
            filename: String::new(),
            updated: 0,
            connected: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Store
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory store of all device states.
///
/// # Concurrency design
///
/// Writes happen only from the aggregator task; the broadcast loop and the
/// HTTP handlers take whole-map snapshots. A `RwLock<BTreeMap>` matches that
/// pattern (single writer, snapshot readers) and keeps WS payload ordering
/// stable by device id.
#[derive(Debug, Default)]
pub struct DeviceStore {
    devices: RwLock<BTreeMap<u16, DeviceState>>,
}

impl DeviceStore {
    /// Builds the store from static configuration; every device starts
    /// offline.
    #[must_use]
    pub fn from_config(servers: &[DeviceConfig], settings: &Settings) -> Self {
        let devices = servers
            .iter()
            .map(|c| (c.id, DeviceState::from_config(c, settings)))
            .collect();
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Number of configured devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// True when no devices are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Number of devices currently connected.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.devices.read().values().filter(|d| d.connected).count()
    }

    /// Clones a single device state.
    #[must_use]
    pub fn get(&self, id: u16) -> Option<DeviceState> {
        self.devices.read().get(&id).cloned()
    }

    /// Atomic snapshot of all devices, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeviceState> {
        self.devices.read().values().cloned().collect()
    }

    /// Mutates one device under the write lock, stamping `updated` with a
    /// monotonic timestamp. Returns false for unknown ids.
    pub fn with_mut<F>(&self, id: u16, f: F) -> bool
    where
        F: FnOnce(&mut DeviceState),
    {
        let mut devices = self.devices.write();
        match devices.get_mut(&id) {
            Some(device) => {
                f(device);
                // Stamp after the mutation so `updated` reflects this event
                // and stays non-decreasing per device.
                device.updated = device.updated.max(monotonic_millis());
                true
            }
            None => false,
        }
    }
}
