//! Centralized error types for the SuperDash core library.
//!
//! Each protocol domain defines its own `thiserror` enum; the crate-level
//! [`SuperdashError`] aggregates them for surfaces that span domains.
//! Protocol clients never bubble errors out of their run loops — transport
//! failures drive reconnect/backoff and protocol failures are logged and
//! skipped — so these types mostly appear in logs and in the bind/startup
//! paths.

use thiserror::Error;

/// Errors raised while validating the static configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Two devices share an id.
    #[error("Duplicate device id {0}")]
    DuplicateDeviceId(u16),

    /// 0xFFFF is the TSL broadcast display index and cannot be a device id.
    #[error("Device id 0xFFFF is reserved for TSL broadcast")]
    ReservedDeviceId,

    /// Frame rates must be positive.
    #[error("Device {id} has non-positive framerate {framerate}")]
    InvalidFramerate { id: u16, framerate: f64 },
}

/// Errors from the HyperDeck line protocol.
#[derive(Debug, Error)]
pub enum HyperdeckError {
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the vMix XML snapshot path.
#[derive(Debug, Error)]
pub enum VmixError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Empty response body")]
    EmptyBody,

    #[error("Response is not a vMix API document")]
    NotVmix,
}

/// Errors from OSC packet decoding.
#[derive(Debug, Error)]
pub enum OscError {
    #[error("Truncated OSC packet")]
    Truncated,

    #[error("OSC string is not valid UTF-8")]
    InvalidString,

    #[error("Unsupported OSC type tag '{0}'")]
    UnsupportedType(char),

    #[error("Malformed OSC packet: {0}")]
    Malformed(&'static str),
}

/// Errors from the Ember+ provider.
#[derive(Debug, Error)]
pub enum EmberError {
    #[error("Failed to bind Ember+ port: {0}")]
    Bind(std::io::Error),

    #[error("S101 framing error: {0}")]
    Framing(&'static str),

    #[error("BER decoding error: {0}")]
    Ber(&'static str),
}

/// Errors from the TSL UMD sender.
#[derive(Debug, Error)]
pub enum TslError {
    #[error("Failed to open TSL socket: {0}")]
    Socket(std::io::Error),

    #[error("Display index 0xFFFF is reserved for broadcast")]
    ReservedIndex,
}

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum SuperdashError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HyperDeck error: {0}")]
    Hyperdeck(#[from] HyperdeckError),

    #[error("vMix error: {0}")]
    Vmix(#[from] VmixError),

    #[error("OSC error: {0}")]
    Osc(#[from] OscError),

    #[error("Ember+ error: {0}")]
    Ember(#[from] EmberError),

    #[error("TSL error: {0}")]
    Tsl(#[from] TslError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenient Result alias for application-wide operations.
pub type SuperdashResult<T> = Result<T, SuperdashError>;
