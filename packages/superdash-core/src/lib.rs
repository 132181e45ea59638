//! SuperDash Core - shared library for the SuperDash playout aggregator.
//!
//! This crate connects to a configured fleet of broadcast playout devices
//! (Blackmagic HyperDecks over TCP, vMix over HTTP polling, CasparCG over
//! OSC/UDP), normalises their transport state into one device model, and
//! fans that model out to dashboard WebSocket clients, Ember+ consumers and
//! TSL UMD v5.0 tally displays.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`state`]: Settings schema, device configuration and the state store
//! - [`clients`]: Protocol clients (HyperDeck, vMix, CasparCG/OSC)
//! - [`aggregator`]: The serialisation domain applying client events
//! - [`ember`]: Ember+ provider (S101 framing, BER, Glow tree)
//! - [`tsl`]: TSL UMD v5.0 tally sender
//! - [`api`]: WebSocket fan-out and HTTP collaborator endpoints
//! - [`timecode`]: Frame-accurate timecode arithmetic
//! - [`timer`]: Drift-free periodic scheduling
//! - [`bootstrap`]: Service wiring and shutdown ordering
//! - [`error`]: Centralized error types
//!
//! Protocol clients report upward only through the event channel; the
//! aggregator task is the single writer of the device store and drives the
//! Ember+ and TSL side effects synchronously, so per-device ordering holds
//! everywhere downstream.

#![warn(clippy::all)]

pub mod aggregator;
pub mod api;
pub mod bootstrap;
pub mod clients;
pub mod ember;
pub mod error;
pub mod events;
pub mod state;
pub mod timecode;
pub mod timer;
pub mod tsl;
pub mod utils;

// Re-export commonly used types at the crate root
pub use aggregator::Aggregator;
pub use api::{start_server, AppState, ServerError};
pub use bootstrap::{bootstrap, validate_servers, BootstrappedServices};
pub use error::{ConfigError, SuperdashError, SuperdashResult};
pub use events::{DeviceEvent, EmberStatus, StateUpdate, TslStatus};
pub use state::{
    DefaultPorts, DeviceConfig, DeviceKind, DeviceState, DeviceStore, Settings, TransportState,
    TslDestination,
};
pub use timecode::{
    frames_to_timecode, milliseconds_to_timecode, requires_drop_frame, timecode_to_frames,
};
pub use utils::monotonic_millis;
