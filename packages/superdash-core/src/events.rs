//! Device events flowing from protocol clients into the aggregation domain.
//!
//! Every protocol client owns a cheap clone of the [`EventSender`] and posts
//! `(device id, event)` pairs; the aggregator task is the only consumer and
//! applies them to the store in arrival order.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::state::TransportState;

/// Normalised transport snapshot emitted by a protocol client.
///
/// Clients only emit when at least one field differs from their last
/// emission, so every event carries real information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub state: TransportState,
    pub timecode: String,
    pub filename: String,
}

/// Event from a protocol client about one device.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Transport state changed.
    State(StateUpdate),
    /// The client established (or re-established) its connection.
    Connected,
    /// The client lost its connection or hit its failure threshold.
    Disconnected,
    /// A non-fatal error; logged, no state change.
    Error(String),
}

/// Sender half used by all protocol clients.
pub type EventSender = mpsc::UnboundedSender<(u16, DeviceEvent)>;

/// Receiver half owned by the aggregator.
pub type EventReceiver = mpsc::UnboundedReceiver<(u16, DeviceEvent)>;

/// Creates the event channel connecting clients to the aggregator.
#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

// ─────────────────────────────────────────────────────────────────────────────
// Protocol Status (WebSocket `protocols` object and /health)
// ─────────────────────────────────────────────────────────────────────────────

/// Ember+ provider status as published to dashboard clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmberStatus {
    pub enabled: bool,
    pub running: bool,
    pub port: u16,
}

/// TSL UMD sender status as published to dashboard clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TslStatus {
    pub enabled: bool,
    pub running: bool,
    pub destinations: usize,
    pub device_count: usize,
}
