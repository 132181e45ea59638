//! HTTP/WebSocket API layer.
//!
//! Serves the dashboard WebSocket, the `/health` collaborator endpoint and
//! the `/api/config` mirror of the WS `getConfig` reply, all on the
//! configured WebSocket port. The snapshot broadcast is serialised once per
//! tick and fanned out through a broadcast channel; a slow or dead client
//! only loses its own frames.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::ember::EmberProvider;
use crate::events::{EmberStatus, TslStatus};
use crate::state::{DeviceConfig, DeviceState, DeviceStore, Settings};
use crate::timer::DriftFreeTimer;
use crate::tsl::TslSender;
use crate::utils::monotonic_millis;

pub mod ws;

/// Capacity of the snapshot fan-out channel; one slow consumer lagging a
/// few frames behind just skips ahead.
const BROADCAST_CHANNEL_CAPACITY: usize = 16;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the WebSocket port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// A thin wrapper over the services; all business logic lives in them.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DeviceStore>,
    pub settings: Arc<Settings>,
    pub servers: Arc<Vec<DeviceConfig>>,
    pub ember: Arc<EmberProvider>,
    pub tsl: Arc<TslSender>,
    /// Pre-serialised `playoutStates` frames.
    pub broadcast_tx: broadcast::Sender<String>,
}

impl AppState {
    /// Creates the API state and its broadcast channel.
    #[must_use]
    pub fn new(
        store: Arc<DeviceStore>,
        settings: Arc<Settings>,
        servers: Arc<Vec<DeviceConfig>>,
        ember: Arc<EmberProvider>,
        tsl: Arc<TslSender>,
    ) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Self {
            store,
            settings,
            servers,
            ember,
            tsl,
            broadcast_tx,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol status block in every snapshot frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolStatus {
    pub ember_plus: EmberStatus,
    pub tsl_umd: TslStatus,
}

/// The `playoutStates` frame sent to every dashboard client.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayoutStates<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    /// Monotonic milliseconds, not wall clock.
    timestamp: u64,
    data: &'a [DeviceState],
    protocols: ProtocolStatus,
}

/// Serialises one complete snapshot frame.
#[must_use]
pub fn playout_states_frame(state: &AppState) -> String {
    let devices = state.store.snapshot();
    let frame = PlayoutStates {
        kind: "playoutStates",
        timestamp: monotonic_millis(),
        data: &devices,
        protocols: ProtocolStatus {
            ember_plus: state.ember.status(),
            tsl_umd: state.tsl.status(),
        },
    };
    // DeviceState and the status blocks contain no non-serialisable values.
    serde_json::to_string(&frame).unwrap_or_else(|e| {
        log::error!("[WS] Failed to serialise snapshot: {e}");
        String::from("{\"type\":\"playoutStates\",\"data\":[]}")
    })
}

/// Builds the `config` reply shared by the WS `getConfig` message and
/// `GET /api/config`.
#[must_use]
pub fn config_frame(state: &AppState) -> serde_json::Value {
    json!({
        "type": "config",
        "data": {
            "settings": &*state.settings,
            "servers": &*state.servers,
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Builds the router: WebSocket upgrade plus the HTTP collaborator
/// endpoints.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_handler))
        .route("/api/config", get(config_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let devices = state.store.snapshot();
    let connected = devices.iter().filter(|d| d.connected).count();
    Json(json!({
        "status": "ok",
        "devices": {
            "total": devices.len(),
            "connected": connected,
        },
        "protocols": ProtocolStatus {
            ember_plus: state.ember.status(),
            tsl_umd: state.tsl.status(),
        },
    }))
}

async fn config_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(config_frame(&state))
}

/// Binds the WebSocket port and serves until the task is aborted.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let port = state.settings.web_socket_port;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("[WS] Server listening on http://0.0.0.0:{port}");
    let app = create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Spawns the drift-free snapshot broadcast loop.
#[must_use]
pub fn spawn_broadcast_loop(state: AppState, cancel: CancellationToken) -> JoinHandle<()> {
    let period = std::time::Duration::from_millis(state.settings.update_interval_ms.max(1));
    tokio::spawn(async move {
        let mut timer = DriftFreeTimer::new(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }
            // Serialise once per tick; receivers just clone the string.
            let frame = playout_states_frame(&state);
            // No receivers is fine; clients may all be gone.
            let _ = state.broadcast_tx.send(frame);
        }
        log::debug!("[WS] Broadcast loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeviceKind;

    async fn test_state() -> AppState {
        let settings = Arc::new(Settings::default());
        let servers = Arc::new(vec![DeviceConfig {
            id: 1,
            name: "HD".to_string(),
            kind: DeviceKind::Hyperdeck,
            ip: "10.0.0.1".to_string(),
            port: None,
            framerate: None,
        }]);
        let store = Arc::new(DeviceStore::from_config(&servers, &settings));
        let ember = EmberProvider::new("127.0.0.1".to_string(), 0);
        let tsl = Arc::new(TslSender::new(0, Vec::new()));
        AppState::new(store, settings, servers, ember, tsl)
    }

    #[tokio::test]
    async fn snapshot_frame_has_expected_shape() {
        let state = test_state().await;
        let frame = playout_states_frame(&state);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "playoutStates");
        assert!(value["timestamp"].is_u64());
        assert_eq!(value["data"].as_array().unwrap().len(), 1);
        assert_eq!(value["data"][0]["state"], "offline");
        assert!(value["protocols"]["emberPlus"]["port"].is_u64());
        assert!(value["protocols"]["tslUmd"]["deviceCount"].is_u64());
    }

    #[tokio::test]
    async fn config_frame_mirrors_settings_and_servers() {
        let state = test_state().await;
        let value = config_frame(&state);
        assert_eq!(value["type"], "config");
        assert_eq!(value["data"]["servers"][0]["type"], "hyperdeck");
        assert_eq!(value["data"]["settings"]["emberPlusPort"], 9000);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_loop_publishes_frames() {
        let state = test_state().await;
        let mut rx = state.broadcast_tx.subscribe();
        let cancel = CancellationToken::new();
        let task = spawn_broadcast_loop(state, cancel.clone());

        tokio::time::advance(std::time::Duration::from_millis(1001)).await;
        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("tick should publish")
            .unwrap();
        assert!(frame.contains("playoutStates"));

        cancel.cancel();
        let _ = task.await;
    }
}
