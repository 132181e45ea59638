//! Service construction and lifecycle wiring.
//!
//! Builds the store, outputs, aggregator and protocol clients from the
//! static configuration and owns the shutdown ordering: protocol clients
//! first (so they stop mutating state), then the Ember+ and TSL outputs,
//! then the broadcast loop and aggregator.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::api::{spawn_broadcast_loop, AppState};
use crate::clients::{
    CasparCgClient, CasparCgConfig, DeviceClient, HyperdeckClient, HyperdeckConfig,
    SharedOscListener, VmixClient, VmixConfig,
};
use crate::ember::EmberProvider;
use crate::error::{ConfigError, SuperdashResult};
use crate::events::event_channel;
use crate::state::{DeviceConfig, DeviceKind, DeviceStore, Settings};
use crate::tsl::TslSender;

/// TSL display index reserved for broadcast; never a device id.
const TSL_BROADCAST_INDEX: u16 = 0xFFFF;

/// Everything a running server needs, with shutdown ordering baked in.
pub struct BootstrappedServices {
    pub store: Arc<DeviceStore>,
    pub settings: Arc<Settings>,
    pub servers: Arc<Vec<DeviceConfig>>,
    pub ember: Arc<EmberProvider>,
    pub tsl: Arc<TslSender>,
    pub app_state: AppState,
    clients: Vec<DeviceClient>,
    aggregator: Aggregator,
    broadcast_cancel: CancellationToken,
    broadcast_task: Option<JoinHandle<()>>,
}

/// Validates the device list against the constraints the runtime relies
/// on.
pub fn validate_servers(servers: &[DeviceConfig]) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for server in servers {
        if server.id == TSL_BROADCAST_INDEX {
            return Err(ConfigError::ReservedDeviceId);
        }
        if !seen.insert(server.id) {
            return Err(ConfigError::DuplicateDeviceId(server.id));
        }
        if let Some(framerate) = server.framerate {
            if framerate <= 0.0 {
                return Err(ConfigError::InvalidFramerate {
                    id: server.id,
                    framerate,
                });
            }
        }
    }
    Ok(())
}

/// Builds and starts all services.
///
/// Output bind failures (Ember+, TSL) disable the affected output and the
/// rest of the system continues; only configuration errors are fatal.
pub async fn bootstrap(
    settings: Settings,
    servers: Vec<DeviceConfig>,
) -> SuperdashResult<BootstrappedServices> {
    validate_servers(&servers)?;

    let settings = Arc::new(settings);
    let servers = Arc::new(servers);
    let store = Arc::new(DeviceStore::from_config(&servers, &settings));

    // Outputs first so the first client events already fan out.
    let ember = EmberProvider::new(
        settings.ember_plus_bind_address.clone(),
        settings.ember_plus_port,
    );
    if let Err(e) = ember.start(&store.snapshot()).await {
        log::error!("[Ember+] Provider disabled: {e}");
    }

    let tsl = Arc::new(TslSender::new(
        settings.tsl_umd_screen,
        settings.tsl_umd_destinations.clone(),
    ));
    if let Err(e) = tsl.start().await {
        log::error!("[TSL] Sender disabled: {e}");
    }
    // Prime the rotation so the refresh loop covers every device from the
    // start.
    for device in store.snapshot() {
        tsl.update_device(device.id, &device.name, device.state).await;
    }

    let (events, receiver) = event_channel();
    let aggregator = Aggregator::spawn(
        Arc::clone(&store),
        receiver,
        Arc::clone(&ember),
        Arc::clone(&tsl),
    );

    // One shared OSC listener per distinct CasparCG port.
    let mut osc_listeners: HashMap<u16, Arc<SharedOscListener>> = HashMap::new();
    let mut clients = Vec::new();
    for server in servers.iter() {
        let port = server.resolved_port(&settings.default_ports);
        let framerate = server.resolved_framerate(&settings);
        match server.kind {
            DeviceKind::Hyperdeck => {
                clients.push(DeviceClient::Hyperdeck(HyperdeckClient::start(
                    HyperdeckConfig {
                        id: server.id,
                        ip: server.ip.clone(),
                        port,
                    },
                    events.clone(),
                )));
            }
            DeviceKind::Vmix => {
                clients.push(DeviceClient::Vmix(VmixClient::start(
                    VmixConfig::new(server.id, server.ip.clone(), port, framerate),
                    events.clone(),
                )));
            }
            DeviceKind::Casparcg => {
                let ip = match server.ip.parse() {
                    Ok(ip) => ip,
                    Err(e) => {
                        log::error!(
                            "[CasparCG] Device {} has unusable ip {:?}: {e}",
                            server.id,
                            server.ip
                        );
                        continue;
                    }
                };
                let listener = osc_listeners
                    .entry(port)
                    .or_insert_with(|| Arc::new(SharedOscListener::new(port)));
                match CasparCgClient::start(
                    CasparCgConfig::new(server.id, ip, framerate),
                    Arc::clone(listener),
                    events.clone(),
                )
                .await
                {
                    Ok(client) => clients.push(DeviceClient::Casparcg(client)),
                    Err(e) => {
                        log::error!("[CasparCG] Device {} disabled: {e}", server.id);
                    }
                }
            }
        }
    }

    let app_state = AppState::new(
        Arc::clone(&store),
        Arc::clone(&settings),
        Arc::clone(&servers),
        Arc::clone(&ember),
        Arc::clone(&tsl),
    );
    let broadcast_cancel = CancellationToken::new();
    let broadcast_task = spawn_broadcast_loop(app_state.clone(), broadcast_cancel.clone());

    log::info!(
        "[Bootstrap] {} device(s), Ember+ {}, TSL {}",
        servers.len(),
        if ember.is_running() { "running" } else { "disabled" },
        if tsl.is_running() { "running" } else { "disabled" },
    );

    Ok(BootstrappedServices {
        store,
        settings,
        servers,
        ember,
        tsl,
        app_state,
        clients,
        aggregator,
        broadcast_cancel,
        broadcast_task: Some(broadcast_task),
    })
}

impl BootstrappedServices {
    /// Graceful shutdown in dependency order: clients, outputs, broadcast
    /// loop, aggregator.
    pub async fn shutdown(mut self) {
        log::info!("[Bootstrap] Shutting down");
        for client in &self.clients {
            client.stop().await;
        }
        self.ember.stop().await;
        self.tsl.stop().await;
        self.broadcast_cancel.cancel();
        if let Some(task) = self.broadcast_task.take() {
            let _ = task.await;
        }
        self.aggregator.stop().await;
        log::info!("[Bootstrap] Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: u16, kind: DeviceKind) -> DeviceConfig {
        DeviceConfig {
            id,
            name: format!("Device {id}"),
            kind,
            ip: "127.0.0.1".to_string(),
            port: Some(0),
            framerate: None,
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let servers = vec![device(1, DeviceKind::Vmix), device(1, DeviceKind::Hyperdeck)];
        assert!(matches!(
            validate_servers(&servers),
            Err(ConfigError::DuplicateDeviceId(1))
        ));
    }

    #[test]
    fn broadcast_index_is_rejected() {
        let servers = vec![device(0xFFFF, DeviceKind::Vmix)];
        assert!(matches!(
            validate_servers(&servers),
            Err(ConfigError::ReservedDeviceId)
        ));
    }

    #[test]
    fn non_positive_framerate_is_rejected() {
        let mut bad = device(1, DeviceKind::Vmix);
        bad.framerate = Some(0.0);
        assert!(matches!(
            validate_servers(&[bad]),
            Err(ConfigError::InvalidFramerate { id: 1, .. })
        ));
    }

    #[test]
    fn valid_servers_pass() {
        let servers = vec![
            device(1, DeviceKind::Hyperdeck),
            device(2, DeviceKind::Vmix),
            device(3, DeviceKind::Casparcg),
        ];
        assert!(validate_servers(&servers).is_ok());
    }

    #[tokio::test]
    async fn bootstrap_and_shutdown_round_trip() {
        let settings = Settings {
            ember_plus_port: 0,
            update_interval_ms: 50,
            ..Settings::default()
        };
        let servers = vec![
            device(1, DeviceKind::Casparcg),
            device(2, DeviceKind::Vmix),
        ];
        let services = bootstrap(settings, servers).await.unwrap();
        assert_eq!(services.store.len(), 2);
        assert!(services.ember.is_running());
        // Shutdown completes promptly even with clients mid-poll.
        tokio::time::timeout(std::time::Duration::from_secs(5), services.shutdown())
            .await
            .expect("shutdown should not hang");
    }
}
