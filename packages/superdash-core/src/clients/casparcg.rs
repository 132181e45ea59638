//! CasparCG OSC ingest.
//!
//! CasparCG pushes OSC bundles to a UDP port that this side owns, so the
//! transport direction is inverted compared to the other clients. A single
//! [`SharedOscListener`] owns the socket for a port and demultiplexes
//! datagrams to per-server routes by source IP; the registry is mutated only
//! during register/unregister, never from the packet hot path.
//!
//! Connection state is inferred: the first datagram from a configured source
//! flips the client to connected, and a 1 Hz stale checker disconnects it
//! again when the server goes quiet.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::osc::{self, OscMessage};
use crate::events::{DeviceEvent, EventSender, StateUpdate};
use crate::state::TransportState;
use crate::timecode::frames_to_timecode;
use crate::utils::basename;

const DEFAULT_CHANNEL: u32 = 1;
const DEFAULT_LAYER: u32 = 10;
const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(5);
const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Accepted fps range for the `/file/fps` message; CasparCG occasionally
/// reports 0 or garbage while loading.
const FPS_MIN_EXCLUSIVE: f64 = 0.0;
const FPS_MAX_EXCLUSIVE: f64 = 120.0;

// ─────────────────────────────────────────────────────────────────────────────
// Shared Listener
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide UDP listener shared by all CasparCG clients on one port.
pub struct SharedOscListener {
    port: u16,
    routes: Arc<Mutex<HashMap<IpAddr, Arc<CasparRoute>>>>,
    state: tokio::sync::Mutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    is_running: bool,
    is_starting: bool,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl SharedOscListener {
    /// Creates an idle listener for `port`; the socket opens on first
    /// registration.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            routes: Arc::new(Mutex::new(HashMap::new())),
            state: tokio::sync::Mutex::new(ListenerState::default()),
        }
    }

    /// Registers a route for a source IP, opening the socket if this is the
    /// first registration. A second registration for the same IP overwrites
    /// the first.
    pub(crate) async fn register(
        &self,
        ip: IpAddr,
        route: Arc<CasparRoute>,
    ) -> std::io::Result<()> {
        self.routes.lock().insert(ip, route.clone());

        let mut state = self.state.lock().await;
        if state.is_running {
            route.listener_ready(self.port);
            return Ok(());
        }
        if state.is_starting {
            // Another registration is opening the socket; its ready pass
            // will notify this route too.
            return Ok(());
        }
        state.is_starting = true;

        match open_socket(self.port).await {
            Ok(socket) => {
                let cancel = CancellationToken::new();
                let task = tokio::spawn(recv_loop(
                    socket,
                    Arc::clone(&self.routes),
                    cancel.clone(),
                ));
                state.is_starting = false;
                state.is_running = true;
                state.cancel = Some(cancel);
                state.task = Some(task);
                drop(state);

                log::info!("[CasparCG] OSC listener bound to 0.0.0.0:{}", self.port);
                for route in self.routes.lock().values() {
                    route.listener_ready(self.port);
                }
                Ok(())
            }
            Err(e) => {
                state.is_starting = false;
                drop(state);
                self.routes.lock().remove(&ip);
                log::error!("[CasparCG] Failed to bind OSC port {}: {e}", self.port);
                Err(e)
            }
        }
    }

    /// Removes a route; the socket closes when the last route is gone.
    pub(crate) async fn unregister(&self, ip: IpAddr) {
        let now_empty = {
            let mut routes = self.routes.lock();
            routes.remove(&ip);
            routes.is_empty()
        };
        if !now_empty {
            return;
        }
        let mut state = self.state.lock().await;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = state.task.take() {
            let _ = task.await;
        }
        state.is_running = false;
        state.is_starting = false;
        log::info!("[CasparCG] OSC listener on port {} closed", self.port);
    }

    #[cfg(test)]
    async fn is_running(&self) -> bool {
        self.state.lock().await.is_running
    }
}

/// Opens the shared UDP socket with SO_REUSEADDR for rapid restarts.
async fn open_socket(port: u16) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_reuse_address(true) {
        log::warn!("[CasparCG] Failed to set SO_REUSEADDR: {e}");
    }
    socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&bind_addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

async fn recv_loop(
    socket: UdpSocket,
    routes: Arc<Mutex<HashMap<IpAddr, Arc<CasparRoute>>>>,
    cancel: CancellationToken,
) {
    // Maximum UDP payload; CasparCG bundles routinely run to a few KB.
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("[CasparCG] UDP receive error: {e}");
                        continue;
                    }
                };
                let route = routes.lock().get(&src.ip()).cloned();
                let Some(route) = route else {
                    // Unknown sources are dropped silently.
                    log::trace!("[CasparCG] Dropping datagram from unknown source {}", src.ip());
                    continue;
                };
                match osc::decode_packet(&buf[..len]) {
                    Ok(messages) => route.handle_packet(&messages),
                    Err(e) => log::debug!("[CasparCG] Malformed OSC from {}: {e}", src.ip()),
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-Server Route
// ─────────────────────────────────────────────────────────────────────────────

/// Cached layer fields, merged across bundles.
#[derive(Debug, Clone, Default)]
struct LayerCache {
    file_path: String,
    time_seconds: f64,
    frame: i64,
    fps: f64,
    paused: bool,
    foreground_file: String,
}

#[derive(Debug, Default)]
struct RouteState {
    cache: LayerCache,
    connected: bool,
    last_seen: Option<Instant>,
    last_emitted: Option<StateUpdate>,
}

/// Per-server OSC state: matches the configured channel/layer address
/// prefix and normalises the cached fields at the end of each bundle.
pub(crate) struct CasparRoute {
    id: u16,
    prefix: String,
    events: EventSender,
    inner: Mutex<RouteState>,
}

impl CasparRoute {
    fn new(config: &CasparCgConfig, events: EventSender) -> Self {
        let inner = RouteState {
            cache: LayerCache {
                // Until the server reports its own fps, convert with the
                // configured frame rate.
                fps: config.framerate,
                ..LayerCache::default()
            },
            ..RouteState::default()
        };
        Self {
            id: config.id,
            prefix: format!("/channel/{}/stage/layer/{}", config.channel, config.layer),
            events,
            inner: Mutex::new(inner),
        }
    }

    fn listener_ready(&self, port: u16) {
        log::debug!("[CasparCG] Device {} listening on shared port {port}", self.id);
    }

    /// Applies one decoded datagram (one bundle) and emits at most one
    /// state event.
    pub(crate) fn handle_packet(&self, messages: &[OscMessage]) {
        let mut inner = self.inner.lock();
        inner.last_seen = Some(Instant::now());
        if !inner.connected {
            inner.connected = true;
            log::info!("[CasparCG] Device {}: first OSC message, connected", self.id);
            let _ = self.events.send((self.id, DeviceEvent::Connected));
        }

        for message in messages {
            let Some(suffix) = message.address.strip_prefix(self.prefix.as_str()) else {
                continue;
            };
            self.apply_message(&mut inner.cache, suffix, message);
        }

        // Bundle end: normalise and emit on change.
        let update = normalize(&inner.cache);
        if inner.last_emitted.as_ref() != Some(&update) {
            inner.last_emitted = Some(update.clone());
            let _ = self.events.send((self.id, DeviceEvent::State(update)));
        }
    }

    fn apply_message(&self, cache: &mut LayerCache, suffix: &str, message: &OscMessage) {
        let first = message.args.first();
        match suffix {
            "/file/path" => {
                if let Some(path) = first.and_then(|a| a.as_str()) {
                    cache.file_path = path.to_string();
                }
            }
            "/file/time" => {
                if let Some(seconds) = first.and_then(|a| a.as_f64()) {
                    cache.time_seconds = seconds;
                }
            }
            "/file/frame" => {
                if let Some(frame) = first.and_then(|a| a.as_f64()) {
                    cache.frame = frame as i64;
                }
            }
            "/file/fps" => {
                if let Some(fps) = first.and_then(|a| a.as_f64()) {
                    if fps > FPS_MIN_EXCLUSIVE && fps < FPS_MAX_EXCLUSIVE {
                        cache.fps = fps;
                    }
                }
            }
            "/paused" => {
                if let Some(value) = first.and_then(|a| a.as_f64()) {
                    cache.paused = value == 1.0;
                }
            }
            "/foreground/file/name" => {
                if let Some(name) = first.and_then(|a| a.as_str()) {
                    cache.foreground_file = name.to_string();
                }
            }
            _ => {}
        }
    }

    /// Flips to disconnected when no datagram arrived within the timeout.
    fn mark_stale_if_quiet(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return;
        }
        let quiet = inner
            .last_seen
            .map_or(true, |seen| seen.elapsed() >= timeout);
        if quiet {
            inner.connected = false;
            inner.last_emitted = None;
            log::warn!("[CasparCG] Device {}: no OSC for {timeout:?}, disconnected", self.id);
            let _ = self.events.send((self.id, DeviceEvent::Disconnected));
        }
    }
}

/// Normalises the cached layer fields into a state update.
///
/// CasparCG does not record, so `rec` is never produced here.
fn normalize(cache: &LayerCache) -> StateUpdate {
    let file = if cache.file_path.is_empty() {
        cache.foreground_file.as_str()
    } else {
        cache.file_path.as_str()
    };
    let has_file = !file.is_empty();

    let state = if has_file && !cache.paused {
        TransportState::Play
    } else {
        TransportState::Stop
    };

    let frames = if cache.frame > 0 {
        cache.frame
    } else if cache.time_seconds > 0.0 {
        (cache.time_seconds * cache.fps).floor() as i64
    } else {
        0
    };

    StateUpdate {
        state,
        timecode: frames_to_timecode(frames, cache.fps),
        filename: basename(file).to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Connection parameters for one CasparCG server.
#[derive(Debug, Clone)]
pub struct CasparCgConfig {
    pub id: u16,
    pub ip: IpAddr,
    pub channel: u32,
    pub layer: u32,
    pub framerate: f64,
    pub stale_timeout: Duration,
}

impl CasparCgConfig {
    /// Creates a config with the default channel (1), layer (10) and stale
    /// timeout (5 s).
    #[must_use]
    pub fn new(id: u16, ip: IpAddr, framerate: f64) -> Self {
        Self {
            id,
            ip,
            channel: DEFAULT_CHANNEL,
            layer: DEFAULT_LAYER,
            framerate,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
        }
    }
}

/// Handle to one registered CasparCG client.
pub struct CasparCgClient {
    ip: IpAddr,
    listener: Arc<SharedOscListener>,
    cancel: CancellationToken,
    stale_task: Mutex<Option<JoinHandle<()>>>,
}

impl CasparCgClient {
    /// Registers with the shared listener and starts the stale checker.
    ///
    /// Fails when the shared socket cannot be opened; the device then stays
    /// offline while the rest of the system continues.
    pub async fn start(
        config: CasparCgConfig,
        listener: Arc<SharedOscListener>,
        events: EventSender,
    ) -> std::io::Result<Self> {
        let route = Arc::new(CasparRoute::new(&config, events));
        listener.register(config.ip, Arc::clone(&route)).await?;

        let cancel = CancellationToken::new();
        let stale_task = tokio::spawn(stale_loop(route, config.stale_timeout, cancel.clone()));

        Ok(Self {
            ip: config.ip,
            listener,
            cancel,
            stale_task: Mutex::new(Some(stale_task)),
        })
    }

    /// Unregisters from the shared listener and stops the stale checker.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.stale_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.listener.unregister(self.ip).await;
    }
}

async fn stale_loop(route: Arc<CasparRoute>, timeout: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(STALE_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => route.mark_stale_if_quiet(timeout),
        }
    }
}
