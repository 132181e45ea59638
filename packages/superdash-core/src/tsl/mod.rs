//! TSL UMD v5.0 tally sender.
//!
//! Builds the little-endian v5.0 packet for each device and sends it over
//! UDP to every configured destination: immediately when a device's name or
//! state changes, and from a 200 ms round-robin refresh that re-sends one
//! device per tick so a lost datagram is repaired within one cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TslError;
use crate::events::TslStatus;
use crate::state::{TransportState, TslDestination};
use crate::timer::DriftFreeTimer;

/// Protocol version byte for UMD v5.0.
const VERSION: u8 = 0x80;
/// Display index reserved for broadcast-to-all; never a device id.
const BROADCAST_INDEX: u16 = 0xFFFF;
const REFRESH_INTERVAL: Duration = Duration::from_millis(200);

// ─────────────────────────────────────────────────────────────────────────────
// Packet Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Tally lamp colour (2-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tally {
    Off = 0,
    Red = 1,
    #[allow(dead_code)]
    Green = 2,
    Amber = 3,
}

/// Display brightness (2-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Brightness {
    #[allow(dead_code)]
    Off = 0,
    Dim = 1,
    #[allow(dead_code)]
    Medium = 2,
    Full = 3,
}

/// Packs the CONTROL word: bits 0-1 right tally, 2-3 text tally, 4-5 left
/// tally, 6-7 brightness.
fn control_word(rh: Tally, txt: Tally, lh: Tally, brightness: Brightness) -> u16 {
    (rh as u16) | (txt as u16) << 2 | (lh as u16) << 4 | (brightness as u16) << 6
}

/// Maps a transport state to its tally control word.
fn control_for_state(state: TransportState) -> u16 {
    match state {
        TransportState::Play => {
            control_word(Tally::Red, Tally::Red, Tally::Off, Brightness::Full)
        }
        TransportState::Rec => {
            control_word(Tally::Amber, Tally::Amber, Tally::Off, Brightness::Full)
        }
        TransportState::Stop => {
            control_word(Tally::Off, Tally::Off, Tally::Off, Brightness::Full)
        }
        TransportState::Offline => {
            control_word(Tally::Off, Tally::Off, Tally::Off, Brightness::Dim)
        }
    }
}

/// Builds one UMD v5.0 packet (little-endian, variable length).
fn build_packet(screen: u16, index: u16, name: &str, state: TransportState) -> Bytes {
    let text = name.as_bytes();
    let total_len = 12 + text.len();
    let mut buf = BytesMut::with_capacity(total_len);
    buf.put_u16_le(total_len as u16); // PBC
    buf.put_u8(VERSION);
    buf.put_u8(0x00); // FLAGS
    buf.put_u16_le(screen);
    buf.put_u16_le(index);
    buf.put_u16_le(control_for_state(state));
    buf.put_u16_le(text.len() as u16);
    buf.put_slice(text);
    buf.freeze()
}

// ─────────────────────────────────────────────────────────────────────────────
// Sender
// ─────────────────────────────────────────────────────────────────────────────

/// Display state tracked per device.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Display {
    name: String,
    state: TransportState,
}

#[derive(Default)]
struct SenderState {
    socket: Option<Arc<UdpSocket>>,
    refresh_cancel: Option<CancellationToken>,
    refresh_task: Option<JoinHandle<()>>,
}

/// UDP tally sender with background round-robin refresh.
pub struct TslSender {
    screen: u16,
    destinations: Vec<TslDestination>,
    /// Device id -> display; config order, which also drives the refresh
    /// rotation.
    displays: Arc<Mutex<Vec<(u16, Display)>>>,
    running: AtomicBool,
    state: tokio::sync::Mutex<SenderState>,
}

impl TslSender {
    /// Creates an idle sender. `start` opens the socket.
    #[must_use]
    pub fn new(screen: u16, destinations: Vec<TslDestination>) -> Self {
        Self {
            screen,
            destinations,
            displays: Arc::new(Mutex::new(Vec::new())),
            running: AtomicBool::new(false),
            state: tokio::sync::Mutex::new(SenderState::default()),
        }
    }

    /// True once the socket is open and the refresh loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Status block for the WebSocket payload and `/health`.
    #[must_use]
    pub fn status(&self) -> TslStatus {
        TslStatus {
            enabled: !self.destinations.is_empty(),
            running: self.is_running(),
            destinations: self.destinations.len(),
            device_count: self.displays.lock().len(),
        }
    }

    /// Opens the UDP socket and starts the refresh loop.
    ///
    /// A no-op when no destinations are configured, and idempotent when
    /// already running. `running` only becomes true after the socket has
    /// opened with broadcast enabled; a bind failure leaves the sender
    /// stopped and the refresh loop never starts.
    pub async fn start(&self) -> Result<(), TslError> {
        if self.destinations.is_empty() {
            log::info!("[TSL] No destinations configured, sender disabled");
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let socket = Arc::new(open_socket().await.map_err(TslError::Socket)?);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(refresh_loop(
            Arc::clone(&socket),
            self.screen,
            self.destinations.clone(),
            Arc::clone(&self.displays),
            cancel.clone(),
        ));

        state.socket = Some(socket);
        state.refresh_cancel = Some(cancel);
        state.refresh_task = Some(task);
        self.running.store(true, Ordering::SeqCst);
        log::info!(
            "[TSL] Sender running: screen {}, {} destination(s)",
            self.screen,
            self.destinations.len()
        );
        Ok(())
    }

    /// Stops the refresh loop and closes the socket. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = state.refresh_cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = state.refresh_task.take() {
            let _ = task.await;
        }
        state.socket = None;
        log::info!("[TSL] Sender stopped");
    }

    /// Updates a device display and sends immediately when the name or
    /// state changed.
    pub async fn update_device(&self, id: u16, name: &str, state: TransportState) {
        if id == BROADCAST_INDEX {
            log::warn!("[TSL] Ignoring device with reserved broadcast index 0xFFFF");
            return;
        }
        let display = Display {
            name: name.to_string(),
            state,
        };
        let changed = {
            let mut displays = self.displays.lock();
            match displays.iter_mut().find(|(existing, _)| *existing == id) {
                Some((_, existing)) => {
                    let changed = *existing != display;
                    *existing = display.clone();
                    changed
                }
                None => {
                    displays.push((id, display.clone()));
                    true
                }
            }
        };
        if !changed {
            return;
        }

        let socket = self.state.lock().await.socket.clone();
        let Some(socket) = socket else { return };
        let packet = build_packet(self.screen, id, &display.name, display.state);
        send_to_all(&socket, &packet, &self.destinations).await;
    }
}

/// Opens the sender socket with SO_BROADCAST so broadcast-addressed
/// destinations work.
async fn open_socket() -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr: std::net::SocketAddr = std::net::SocketAddr::from(([0, 0, 0, 0], 0));
    socket.bind(&bind_addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Sends one packet to every destination; an error for one destination is
/// logged and does not abort the others.
async fn send_to_all(socket: &UdpSocket, packet: &Bytes, destinations: &[TslDestination]) {
    for dest in destinations {
        let target = (dest.host.as_str(), dest.port);
        if let Err(e) = socket.send_to(packet, target).await {
            log::warn!("[TSL] Send to {}:{} failed: {e}", dest.host, dest.port);
        }
    }
}

/// Walks the device set one display per tick, repairing lost datagrams
/// within one cycle per device.
async fn refresh_loop(
    socket: Arc<UdpSocket>,
    screen: u16,
    destinations: Vec<TslDestination>,
    displays: Arc<Mutex<Vec<(u16, Display)>>>,
    cancel: CancellationToken,
) {
    let mut timer = DriftFreeTimer::new(REFRESH_INTERVAL);
    let mut cursor = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }
        let next = {
            let displays = displays.lock();
            if displays.is_empty() {
                continue;
            }
            cursor %= displays.len();
            let (id, display) = &displays[cursor];
            cursor += 1;
            (*id, display.clone())
        };
        let packet = build_packet(screen, next.0, &next.1.name, next.1.state);
        send_to_all(&socket, &packet, &destinations).await;
    }
}
