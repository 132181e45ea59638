//! The aggregation domain.
//!
//! One task drains the client event channel and is the only writer of the
//! device store. After each store mutation it synchronously drives the
//! Ember+ updater and the TSL sender, so for any device event the side
//! effects land before the next event is processed and before the next
//! broadcast tick can observe the previous value.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ember::{EmberDeviceUpdate, EmberProvider};
use crate::events::{DeviceEvent, EventReceiver, StateUpdate};
use crate::state::{DeviceStore, TransportState};
use crate::tsl::TslSender;

/// Handle to the running aggregator task.
pub struct Aggregator {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
    /// Spawns the aggregation task.
    #[must_use]
    pub fn spawn(
        store: Arc<DeviceStore>,
        events: EventReceiver,
        ember: Arc<EmberProvider>,
        tsl: Arc<TslSender>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(store, events, ember, tsl, cancel.clone()));
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stops the task; pending events in the channel are dropped.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(
    store: Arc<DeviceStore>,
    mut events: EventReceiver,
    ember: Arc<EmberProvider>,
    tsl: Arc<TslSender>,
    cancel: CancellationToken,
) {
    loop {
        let (id, event) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Some(pair) => pair,
                None => break,
            },
        };
        apply_event(&store, &ember, &tsl, id, event).await;
    }
    log::debug!("[Aggregator] Stopped");
}

/// Applies one event: store mutation first, then Ember+ and TSL side
/// effects for that device.
async fn apply_event(
    store: &DeviceStore,
    ember: &EmberProvider,
    tsl: &TslSender,
    id: u16,
    event: DeviceEvent,
) {
    let ember_update = match event {
        DeviceEvent::State(StateUpdate {
            state,
            timecode,
            filename,
        }) => {
            log::debug!("[Aggregator] Device {id}: {state} {timecode} {filename:?}");
            let applied = store.with_mut(id, |device| {
                device.state = state;
                device.timecode = timecode.clone();
                device.filename = filename.clone();
                device.connected = true;
            });
            if !applied {
                log::warn!("[Aggregator] State event for unknown device {id}");
                return;
            }
            EmberDeviceUpdate {
                state: Some(state),
                timecode: Some(timecode),
                filename: Some(filename),
                connected: Some(true),
            }
        }
        DeviceEvent::Connected => {
            log::info!("[Aggregator] Device {id} connected");
            let applied = store.with_mut(id, |device| {
                device.connected = true;
                // Freshly connected, transport not yet known.
                device.state = TransportState::Stop;
            });
            if !applied {
                return;
            }
            EmberDeviceUpdate {
                state: Some(TransportState::Stop),
                connected: Some(true),
                ..EmberDeviceUpdate::default()
            }
        }
        DeviceEvent::Disconnected => {
            log::warn!("[Aggregator] Device {id} disconnected");
            // Timecode and filename are retained for operator context; only
            // the transport state is forced offline.
            let applied = store.with_mut(id, |device| {
                device.connected = false;
                device.state = TransportState::Offline;
            });
            if !applied {
                return;
            }
            EmberDeviceUpdate {
                state: Some(TransportState::Offline),
                connected: Some(false),
                ..EmberDeviceUpdate::default()
            }
        }
        DeviceEvent::Error(message) => {
            // Non-fatal; the owning client follows up with a disconnect
            // event when the transport actually drops.
            log::warn!("[Aggregator] Device {id} error: {message}");
            return;
        }
    };

    ember.update_device(id, &ember_update);
    if let Some(device) = store.get(id) {
        tsl.update_device(id, &device.name, device.state).await;
    }
}
