//! Ember+ provider: a static read-only tree served over TCP.
//!
//! The tree mirrors the device store:
//!
//! ```text
//! SuperDash (1)
//! ├── Info (1)        Version, DeviceCount
//! └── Devices (2)     Device<id> with State/Timecode/Filename/Connected/Type
//! ```
//!
//! Consumers browse with GetDirectory and receive per-parameter pushes on
//! every change. Writes are actively rejected: the attempt is logged and the
//! current value is re-sent so a misconfigured control surface sees its
//! write bounce.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::glow::{self, ConsumerRequest, GlowValue, ParameterSpec};
use super::s101::{self, FrameDecoder, S101Message};
use crate::error::EmberError;
use crate::events::EmberStatus;
use crate::state::{DeviceKind, DeviceState, TransportState};

const ROOT_IDENTIFIER: &str = "SuperDash";
const VERSION_VALUE: &str = "1.0.0";
/// Normative enumeration ordering for the State parameter.
const STATE_ENUMERATION: &str = "stop\nplay\nrec\noffline";

// Node numbers under the root.
const NODE_INFO: u32 = 1;
const NODE_DEVICES: u32 = 2;
// Parameter numbers under Info.
const PARAM_VERSION: u32 = 1;
const PARAM_DEVICE_COUNT: u32 = 2;
// Parameter numbers under each device node.
const PARAM_STATE: u32 = 1;
const PARAM_TIMECODE: u32 = 2;
const PARAM_FILENAME: u32 = 3;
const PARAM_CONNECTED: u32 = 4;
const PARAM_TYPE: u32 = 5;

/// Partial device update; only present fields are compared and pushed.
#[derive(Debug, Clone, Default)]
pub struct EmberDeviceUpdate {
    pub state: Option<TransportState>,
    pub timecode: Option<String>,
    pub filename: Option<String>,
    pub connected: Option<bool>,
}

/// Mirrored values for one device node.
#[derive(Debug, Clone)]
struct DeviceEntry {
    id: u16,
    kind: DeviceKind,
    state: TransportState,
    timecode: String,
    filename: String,
    connected: bool,
}

#[derive(Debug, Default)]
struct TreeData {
    device_count: i64,
    /// Config order; position + 1 is the Ember+ node number.
    devices: Vec<DeviceEntry>,
}

impl TreeData {
    fn device_index(&self, id: u16) -> Option<usize> {
        self.devices.iter().position(|d| d.id == id)
    }
}

#[derive(Default)]
struct ProviderTasks {
    cancel: Option<CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
    bound_port: u16,
}

/// The Ember+ provider service.
pub struct EmberProvider {
    port: u16,
    bind_address: String,
    running: AtomicBool,
    tree: Mutex<TreeData>,
    consumers: Arc<DashMap<u64, mpsc::UnboundedSender<Bytes>>>,
    tasks: tokio::sync::Mutex<ProviderTasks>,
    /// Self-reference handed to connection tasks so they never keep the
    /// provider alive past `stop()`.
    weak: Weak<EmberProvider>,
}

impl EmberProvider {
    /// Creates an idle provider; [`start`] builds the tree and opens the
    /// listener.
    ///
    /// [`start`]: Self::start
    #[must_use]
    pub fn new(bind_address: String, port: u16) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            port,
            bind_address,
            running: AtomicBool::new(false),
            tree: Mutex::new(TreeData::default()),
            consumers: Arc::new(DashMap::new()),
            tasks: tokio::sync::Mutex::new(ProviderTasks::default()),
            weak: weak.clone(),
        })
    }

    /// True while the TCP listener is accepting consumers.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Status block for the WebSocket payload and `/health`.
    #[must_use]
    pub fn status(&self) -> EmberStatus {
        EmberStatus {
            enabled: true,
            running: self.is_running(),
            port: self.port,
        }
    }

    /// Builds the tree from the initial device states and opens the
    /// listener. Idempotent when already running.
    pub async fn start(&self, devices: &[DeviceState]) -> Result<(), EmberError> {
        let mut tasks = self.tasks.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut tree = self.tree.lock();
            tree.devices = devices
                .iter()
                .map(|d| DeviceEntry {
                    id: d.id,
                    kind: d.kind,
                    state: d.state,
                    timecode: d.timecode.clone(),
                    filename: d.filename.clone(),
                    connected: d.connected,
                })
                .collect();
            tree.device_count = devices.len() as i64;
        }

        let listener = TcpListener::bind((self.bind_address.as_str(), self.port))
            .await
            .map_err(EmberError::Bind)?;
        tasks.bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(self.port);

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.weak.clone(),
            cancel.clone(),
        ));
        tasks.cancel = Some(cancel);
        tasks.accept_task = Some(accept_task);
        self.running.store(true, Ordering::SeqCst);
        log::info!(
            "[Ember+] Provider listening on {}:{}",
            self.bind_address,
            tasks.bound_port
        );
        Ok(())
    }

    /// Closes the listener and drops all consumers. Idempotent.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = tasks.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = tasks.accept_task.take() {
            let _ = task.await;
        }
        self.consumers.clear();
        log::info!("[Ember+] Provider stopped");
    }

    /// Port the listener actually bound (differs from the configured port
    /// only when configured as 0).
    pub async fn bound_port(&self) -> u16 {
        self.tasks.lock().await.bound_port
    }

    /// Applies a partial update, pushing one parameter update per changed
    /// field. Unknown ids are ignored (they may arrive before the tree is
    /// built).
    pub fn update_device(&self, id: u16, update: &EmberDeviceUpdate) {
        for (path, value) in self.apply_update(id, update) {
            self.push_value(&path, value);
        }
    }

    /// Updates the Info/DeviceCount parameter.
    pub fn update_device_count(&self, count: usize) {
        let count = count as i64;
        let changed = {
            let mut tree = self.tree.lock();
            if tree.device_count == count {
                false
            } else {
                tree.device_count = count;
                true
            }
        };
        if changed {
            self.push_value(
                &[1, NODE_INFO, PARAM_DEVICE_COUNT],
                GlowValue::Integer(count),
            );
        }
    }

    /// Compares each present field against the tree and returns the changed
    /// parameter paths and their new values.
    fn apply_update(&self, id: u16, update: &EmberDeviceUpdate) -> Vec<(Vec<u32>, GlowValue)> {
        let mut tree = self.tree.lock();
        let Some(index) = tree.device_index(id) else {
            return Vec::new();
        };
        let node = 1 + index as u32;
        let device = &mut tree.devices[index];
        let base = [1, NODE_DEVICES, node];
        let mut changes = Vec::new();

        if let Some(state) = update.state {
            if device.state != state {
                device.state = state;
                changes.push((
                    [base.as_slice(), &[PARAM_STATE]].concat(),
                    GlowValue::Enum(state.ember_index()),
                ));
            }
        }
        if let Some(timecode) = &update.timecode {
            if &device.timecode != timecode {
                device.timecode = timecode.clone();
                changes.push((
                    [base.as_slice(), &[PARAM_TIMECODE]].concat(),
                    GlowValue::String(timecode.clone()),
                ));
            }
        }
        if let Some(filename) = &update.filename {
            if &device.filename != filename {
                device.filename = filename.clone();
                changes.push((
                    [base.as_slice(), &[PARAM_FILENAME]].concat(),
                    GlowValue::String(filename.clone()),
                ));
            }
        }
        if let Some(connected) = update.connected {
            if device.connected != connected {
                device.connected = connected;
                changes.push((
                    [base.as_slice(), &[PARAM_CONNECTED]].concat(),
                    GlowValue::Boolean(connected),
                ));
            }
        }
        changes
    }

    /// Sends one parameter value update to every connected consumer.
    fn push_value(&self, path: &[u32], value: GlowValue) {
        if self.consumers.is_empty() {
            return;
        }
        let frame = value_update_frame(path, value);
        for consumer in self.consumers.iter() {
            let _ = consumer.value().send(frame.clone());
        }
    }

    /// Builds the GetDirectory response elements for a path; unknown paths
    /// produce an empty listing.
    fn list(&self, path: &[u32]) -> Vec<Vec<u8>> {
        let tree = self.tree.lock();
        match path {
            [] => vec![glow::encode_qualified_node(&[1], ROOT_IDENTIFIER)],
            [1] => vec![
                glow::encode_qualified_node(&[1, NODE_INFO], "Info"),
                glow::encode_qualified_node(&[1, NODE_DEVICES], "Devices"),
            ],
            [1, NODE_INFO] => vec![
                version_parameter(),
                device_count_parameter(tree.device_count),
            ],
            [1, NODE_INFO, PARAM_VERSION] => vec![version_parameter()],
            [1, NODE_INFO, PARAM_DEVICE_COUNT] => {
                vec![device_count_parameter(tree.device_count)]
            }
            [1, NODE_DEVICES] => tree
                .devices
                .iter()
                .enumerate()
                .map(|(i, device)| {
                    glow::encode_qualified_node(
                        &[1, NODE_DEVICES, 1 + i as u32],
                        &format!("Device{}", device.id),
                    )
                })
                .collect(),
            [1, NODE_DEVICES, node] => device_at(&tree, *node)
                .map(|device| device_parameters(*node, device))
                .unwrap_or_default(),
            [1, NODE_DEVICES, node, param] => device_at(&tree, *node)
                .and_then(|device| device_parameter(*node, device, *param))
                .map(|element| vec![element])
                .unwrap_or_default(),
            _ => {
                log::debug!("[Ember+] GetDirectory for unknown path {path:?}");
                Vec::new()
            }
        }
    }

    /// The current value of the parameter at `path`, used to answer write
    /// attempts with the authoritative value.
    fn current_value(&self, path: &[u32]) -> Option<GlowValue> {
        let tree = self.tree.lock();
        match path {
            [1, NODE_INFO, PARAM_VERSION] => Some(GlowValue::String(VERSION_VALUE.to_string())),
            [1, NODE_INFO, PARAM_DEVICE_COUNT] => Some(GlowValue::Integer(tree.device_count)),
            [1, NODE_DEVICES, node, param] => {
                let device = device_at(&tree, *node)?;
                match *param {
                    PARAM_STATE => Some(GlowValue::Enum(device.state.ember_index())),
                    PARAM_TIMECODE => Some(GlowValue::String(device.timecode.clone())),
                    PARAM_FILENAME => Some(GlowValue::String(device.filename.clone())),
                    PARAM_CONNECTED => Some(GlowValue::Boolean(device.connected)),
                    PARAM_TYPE => Some(GlowValue::String(device.kind.as_str().to_string())),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Answers one decoded consumer request, returning the frame to send
    /// back (if any).
    fn answer(&self, request: &ConsumerRequest) -> Option<Bytes> {
        match request {
            ConsumerRequest::GetDirectory(path) => {
                let elements = self.list(path);
                let payload = glow::encode_root(&elements);
                Some(s101::encode_ember(&payload))
            }
            ConsumerRequest::SetValue(path) => {
                // Monitoring-only protocol: reject the write by re-asserting
                // the authoritative value.
                log::warn!("[Ember+] Rejecting consumer write to {path:?}");
                let value = self.current_value(path)?;
                Some(value_update_frame(path, value))
            }
            ConsumerRequest::Subscribe(_) | ConsumerRequest::Unsubscribe(_) => {
                // Updates are pushed unconditionally; nothing to do.
                None
            }
        }
    }
}

fn value_update_frame(path: &[u32], value: GlowValue) -> Bytes {
    let spec = ParameterSpec {
        path,
        identifier: None,
        value,
        enumeration: None,
        with_metadata: false,
    };
    let payload = glow::encode_root(&[glow::encode_qualified_parameter(&spec)]);
    s101::encode_ember(&payload)
}

fn device_at<'a>(tree: &'a TreeData, node: u32) -> Option<&'a DeviceEntry> {
    let index = (node as usize).checked_sub(1)?;
    tree.devices.get(index)
}

fn version_parameter() -> Vec<u8> {
    glow::encode_qualified_parameter(&ParameterSpec {
        path: &[1, NODE_INFO, PARAM_VERSION],
        identifier: Some("Version"),
        value: GlowValue::String(VERSION_VALUE.to_string()),
        enumeration: None,
        with_metadata: true,
    })
}

fn device_count_parameter(count: i64) -> Vec<u8> {
    glow::encode_qualified_parameter(&ParameterSpec {
        path: &[1, NODE_INFO, PARAM_DEVICE_COUNT],
        identifier: Some("DeviceCount"),
        value: GlowValue::Integer(count),
        enumeration: None,
        with_metadata: true,
    })
}

fn device_parameter(node: u32, device: &DeviceEntry, param: u32) -> Option<Vec<u8>> {
    let path = [1, NODE_DEVICES, node, param];
    let (identifier, value, enumeration) = match param {
        PARAM_STATE => (
            "State",
            GlowValue::Enum(device.state.ember_index()),
            Some(STATE_ENUMERATION),
        ),
        PARAM_TIMECODE => ("Timecode", GlowValue::String(device.timecode.clone()), None),
        PARAM_FILENAME => ("Filename", GlowValue::String(device.filename.clone()), None),
        PARAM_CONNECTED => ("Connected", GlowValue::Boolean(device.connected), None),
        PARAM_TYPE => (
            "Type",
            GlowValue::String(device.kind.as_str().to_string()),
            None,
        ),
        _ => return None,
    };
    Some(glow::encode_qualified_parameter(&ParameterSpec {
        path: &path,
        identifier: Some(identifier),
        value,
        enumeration,
        with_metadata: true,
    }))
}

fn device_parameters(node: u32, device: &DeviceEntry) -> Vec<Vec<u8>> {
    [
        PARAM_STATE,
        PARAM_TIMECODE,
        PARAM_FILENAME,
        PARAM_CONNECTED,
        PARAM_TYPE,
    ]
    .iter()
    .filter_map(|&param| device_parameter(node, device, param))
    .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Consumer Connections
// ─────────────────────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    provider: Weak<EmberProvider>,
    cancel: CancellationToken,
) {
    let mut next_id: u64 = 1;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let Some(alive) = provider.upgrade() else { break };
                        let id = next_id;
                        next_id += 1;
                        log::info!("[Ember+] Consumer {id} connected from {peer}");
                        let (tx, rx) = mpsc::unbounded_channel();
                        alive.consumers.insert(id, tx);
                        drop(alive);
                        tokio::spawn(serve_consumer(
                            id,
                            stream,
                            rx,
                            provider.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        log::warn!("[Ember+] Accept failed: {e}");
                    }
                }
            }
        }
    }
}

async fn serve_consumer(
    id: u64,
    stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    provider: Weak<EmberProvider>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::default();
    let mut buf = vec![0u8; 4096];

    'connection: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_all(&frame).await {
                    log::warn!("[Ember+] Consumer {id} write failed: {e}");
                    break;
                }
            }
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!("[Ember+] Consumer {id} read failed: {e}");
                        break;
                    }
                };
                for frame in decoder.feed(&buf[..n]) {
                    let replies = match handle_frame(&frame, &provider) {
                        Some(replies) => replies,
                        None => break 'connection,
                    };
                    for reply in replies {
                        if let Err(e) = writer.write_all(&reply).await {
                            log::warn!("[Ember+] Consumer {id} write failed: {e}");
                            break 'connection;
                        }
                    }
                }
            }
        }
    }

    if let Some(provider) = provider.upgrade() {
        provider.consumers.remove(&id);
    }
    log::info!("[Ember+] Consumer {id} disconnected");
}

/// Processes one frame, returning the replies to write. `None` means the
/// provider is gone and the connection should close.
fn handle_frame(frame: &[u8], provider: &Weak<EmberProvider>) -> Option<Vec<Bytes>> {
    let provider = provider.upgrade()?;
    match s101::decode_message(frame) {
        Ok(S101Message::KeepaliveRequest) => Some(vec![s101::encode_keepalive_response()]),
        Ok(S101Message::KeepaliveResponse) => Some(Vec::new()),
        Ok(S101Message::Ember(payload)) => match glow::decode_requests(&payload) {
            Ok(requests) => Some(
                requests
                    .iter()
                    .filter_map(|request| provider.answer(request))
                    .collect(),
            ),
            Err(e) => {
                log::debug!("[Ember+] Bad Glow payload: {e}");
                Some(Vec::new())
            }
        },
        Err(e) => {
            log::debug!("[Ember+] Framing error: {e}");
            Some(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DeviceConfig, Settings};
    use bytes::BytesMut;
    use std::time::Duration;

    fn test_devices() -> Vec<DeviceState> {
        let settings = Settings::default();
        [
            (3u16, "CAM 1", DeviceKind::Hyperdeck),
            (7u16, "GFX", DeviceKind::Casparcg),
        ]
        .iter()
        .map(|(id, name, kind)| {
            DeviceState::from_config(
                &DeviceConfig {
                    id: *id,
                    name: (*name).to_string(),
                    kind: *kind,
                    ip: "10.0.0.1".to_string(),
                    port: None,
                    framerate: None,
                },
                &settings,
            )
        })
        .collect()
    }

    async fn started_provider() -> Arc<EmberProvider> {
        let provider = EmberProvider::new("127.0.0.1".to_string(), 0);
        provider.start(&test_devices()).await.unwrap();
        provider
    }

    #[tokio::test]
    async fn start_twice_is_idempotent() {
        let provider = started_provider().await;
        provider.start(&test_devices()).await.unwrap();
        assert!(provider.is_running());
        provider.stop().await;
        provider.stop().await;
        assert!(!provider.is_running());
    }

    #[tokio::test]
    async fn listing_walks_the_tree() {
        let provider = started_provider().await;

        assert_eq!(provider.list(&[]).len(), 1);
        assert_eq!(provider.list(&[1]).len(), 2);
        assert_eq!(provider.list(&[1, 1]).len(), 2);
        // Two configured devices.
        assert_eq!(provider.list(&[1, 2]).len(), 2);
        // Five parameters per device node.
        assert_eq!(provider.list(&[1, 2, 1]).len(), 5);
        assert_eq!(provider.list(&[1, 2, 2]).len(), 5);
        // Unknown paths list empty.
        assert!(provider.list(&[1, 3]).is_empty());
        assert!(provider.list(&[1, 2, 9]).is_empty());

        provider.stop().await;
    }

    #[tokio::test]
    async fn update_pushes_only_changed_parameters() {
        let provider = started_provider().await;

        let update = EmberDeviceUpdate {
            state: Some(TransportState::Play),
            timecode: Some("00:00:01:00".to_string()),
            filename: Some(String::new()),
            connected: None,
        };
        let changes = provider.apply_update(3, &update);
        // Initial filename is already empty: state and timecode change.
        assert_eq!(changes.len(), 2);

        // The same update again changes nothing (idempotence).
        let changes = provider.apply_update(3, &update);
        assert!(changes.is_empty());

        provider.stop().await;
    }

    #[tokio::test]
    async fn unknown_device_ids_are_ignored() {
        let provider = started_provider().await;
        let update = EmberDeviceUpdate {
            state: Some(TransportState::Play),
            ..EmberDeviceUpdate::default()
        };
        assert!(provider.apply_update(99, &update).is_empty());
        provider.stop().await;
    }

    #[tokio::test]
    async fn device_count_update_is_change_detected() {
        let provider = started_provider().await;
        // Count was set to 2 by start(); re-asserting is a no-op, changing
        // pushes.
        provider.update_device_count(2);
        provider.update_device_count(3);
        assert_eq!(provider.tree.lock().device_count, 3);
        provider.stop().await;
    }

    /// Builds a GetDirectory payload the way a consumer would.
    fn get_directory_payload() -> Vec<u8> {
        use crate::ember::ber;
        let mut number = BytesMut::new();
        ber::write_tlv(&mut number, ber::INTEGER, &ber::integer_content(32));
        let mut wrapped = BytesMut::new();
        ber::write_tlv(&mut wrapped, ber::context(0), &number);
        let mut command = BytesMut::new();
        ber::write_tlv(&mut command, ber::application(2), &wrapped);
        glow::encode_root(&[command.to_vec()])
    }

    #[tokio::test]
    async fn consumer_handshake_over_tcp() {
        let provider = started_provider().await;
        let port = provider.bound_port().await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        // Keepalive request is answered with a keepalive response.
        stream
            .write_all(&s101::encode_keepalive_request())
            .await
            .unwrap();

        // GetDirectory on the root returns the SuperDash node.
        stream
            .write_all(&s101::encode_ember(&get_directory_payload()))
            .await
            .unwrap();

        let mut decoder = FrameDecoder::default();
        let mut received = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let mut buf = [0u8; 4096];
        while received.len() < 2 && tokio::time::Instant::now() < deadline {
            let n = tokio::time::timeout(Duration::from_millis(500), stream.read(&mut buf))
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or(0);
            if n == 0 {
                break;
            }
            received.extend(decoder.feed(&buf[..n]));
        }

        let messages: Vec<S101Message> = received
            .iter()
            .map(|frame| s101::decode_message(frame).unwrap())
            .collect();
        assert!(messages.contains(&S101Message::KeepaliveResponse));
        let has_root_listing = messages.iter().any(|m| match m {
            S101Message::Ember(payload) => payload
                .windows(ROOT_IDENTIFIER.len())
                .any(|w| w == ROOT_IDENTIFIER.as_bytes()),
            _ => false,
        });
        assert!(has_root_listing, "expected SuperDash in listing");

        provider.stop().await;
    }
}
