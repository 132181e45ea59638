//! Protocol clients, one per configured device.
//!
//! Each client owns its transport and lifecycle (reconnect, polling or
//! shared-socket registration) and reports upward only through the event
//! channel. Clients are created once per device and never recreated;
//! reconnection happens inside.

pub mod casparcg;
pub mod hyperdeck;
pub mod osc;
pub mod vmix;

pub use casparcg::{CasparCgClient, CasparCgConfig, SharedOscListener};
pub use hyperdeck::{HyperdeckClient, HyperdeckConfig};
pub use vmix::{VmixClient, VmixConfig};

/// A started protocol client of any type.
pub enum DeviceClient {
    Hyperdeck(HyperdeckClient),
    Vmix(VmixClient),
    Casparcg(CasparCgClient),
}

impl DeviceClient {
    /// Asks the client to disconnect and waits for its tasks to finish.
    ///
    /// Stops reconnect timers, pollers and stale checkers; used during
    /// shutdown before the protocol outputs are closed.
    pub async fn stop(&self) {
        match self {
            Self::Hyperdeck(client) => client.stop().await,
            Self::Vmix(client) => client.stop().await,
            Self::Casparcg(client) => client.stop().await,
        }
    }
}
