//! vMix HTTP polling client.
//!
//! Polls `http://ip:port/api` on a drift-free schedule and converts the XML
//! snapshot into normalised state. The XML is scanned with tolerant regexes
//! rather than a full parser: vMix's document is flat and stable, and a
//! regex scan keeps malformed fragments from taking the whole poll down.

use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::VmixError;
use crate::events::{DeviceEvent, EventSender, StateUpdate};
use crate::state::TransportState;
use crate::timecode::milliseconds_to_timecode;
use crate::timer::DriftFreeTimer;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Consecutive failures before the device is considered disconnected.
const FAILURE_THRESHOLD: u32 = 3;

/// Connection parameters for one vMix instance.
#[derive(Debug, Clone)]
pub struct VmixConfig {
    pub id: u16,
    pub ip: String,
    pub port: u16,
    pub framerate: f64,
    pub poll_interval: Duration,
}

impl VmixConfig {
    /// Creates a config with the default 500 ms poll interval.
    #[must_use]
    pub fn new(id: u16, ip: String, port: u16, framerate: f64) -> Self {
        Self {
            id,
            ip,
            port,
            framerate,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    fn api_url(&self) -> String {
        format!("http://{}:{}/api", self.ip, self.port)
    }
}

/// Handle to a running vMix poller task.
pub struct VmixClient {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VmixClient {
    /// Spawns the poller; it runs until [`stop`] is called.
    ///
    /// [`stop`]: Self::stop
    #[must_use]
    pub fn start(config: VmixConfig, events: EventSender) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(config, events, cancel.clone()));
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stops polling and waits for the task to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(config: VmixConfig, events: EventSender, cancel: CancellationToken) {
    let client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            log::error!("[vMix] {}: failed to build HTTP client: {e}", config.ip);
            return;
        }
    };
    let parser = SnapshotParser::new();
    let mut timer = DriftFreeTimer::new(config.poll_interval);
    let mut poll_state = PollState::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }

        let outcome = poll_once(&client, &config, &parser).await;
        if let Err(e) = &outcome {
            log::debug!("[vMix] {}: poll failed: {e}", config.ip);
        }
        for event in poll_state.advance(outcome.ok()) {
            match &event {
                DeviceEvent::Connected => log::info!("[vMix] {}: connected", config.ip),
                DeviceEvent::Disconnected => {
                    log::warn!(
                        "[vMix] {}: disconnected after {FAILURE_THRESHOLD} failures",
                        config.ip
                    );
                }
                _ => {}
            }
            let _ = events.send((config.id, event));
        }
    }
    log::debug!("[vMix] {}: client stopped", config.ip);
}

/// Connection/emission state machine driven by poll outcomes.
///
/// Success resets the failure counter; the third consecutive failure while
/// connected produces exactly one disconnect. Transient failures below the
/// threshold re-assert the last good state so the dashboard does not
/// jitter.
#[derive(Default)]
struct PollState {
    connected: bool,
    failures: u32,
    last_good: Option<StateUpdate>,
    last_emitted: Option<StateUpdate>,
}

impl PollState {
    /// Feeds one poll outcome, returning the events to emit in order.
    fn advance(&mut self, outcome: Option<StateUpdate>) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        match outcome {
            Some(update) => {
                self.failures = 0;
                if !self.connected {
                    self.connected = true;
                    events.push(DeviceEvent::Connected);
                    // Force an emission after reconnect.
                    self.last_emitted = None;
                }
                if self.last_emitted.as_ref() != Some(&update) {
                    self.last_emitted = Some(update.clone());
                    events.push(DeviceEvent::State(update.clone()));
                }
                self.last_good = Some(update);
            }
            None => {
                self.failures = self.failures.saturating_add(1);
                if self.connected {
                    if self.failures >= FAILURE_THRESHOLD {
                        self.connected = false;
                        self.last_emitted = None;
                        events.push(DeviceEvent::Disconnected);
                    } else if let Some(update) = &self.last_good {
                        events.push(DeviceEvent::State(update.clone()));
                    }
                }
            }
        }
        events
    }
}

async fn poll_once(
    client: &reqwest::Client,
    config: &VmixConfig,
    parser: &SnapshotParser,
) -> Result<StateUpdate, VmixError> {
    let response = client.get(config.api_url()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(VmixError::HttpStatus(status.as_u16()));
    }
    let body = response.text().await?;
    parser.parse(&body, config.framerate)
}

// ─────────────────────────────────────────────────────────────────────────────
// XML Snapshot Parser
// ─────────────────────────────────────────────────────────────────────────────

/// Extracted fields from one `/api` snapshot.
#[derive(Debug, Default, PartialEq)]
struct Snapshot {
    recording: bool,
    streaming: bool,
    duration_ms: i64,
    active_input_title: Option<String>,
    active_input_state: Option<String>,
}

/// Regex-based extractor for the vMix API document.
struct SnapshotParser {
    recording: Regex,
    streaming: Regex,
    duration: Regex,
    input_tag: Regex,
    state_attr: Regex,
    title_attr: Regex,
}

impl SnapshotParser {
    fn new() -> Self {
        // The patterns are fixed literals; construction cannot fail.
        Self {
            recording: Regex::new(r"(?is)<recording[^>]*>\s*(true|false)\s*</recording>")
                .expect("static regex"),
            streaming: Regex::new(r"(?is)<streaming[^>]*>\s*(true|false)\s*</streaming>")
                .expect("static regex"),
            duration: Regex::new(r"(?is)<duration[^>]*>\s*(\d+)\s*</duration>")
                .expect("static regex"),
            input_tag: Regex::new(r"(?is)<input\b[^>]*>").expect("static regex"),
            state_attr: Regex::new(r#"(?i)\bstate\s*=\s*"([^"]*)""#).expect("static regex"),
            title_attr: Regex::new(r#"(?i)\btitle\s*=\s*"([^"]*)""#).expect("static regex"),
        }
    }

    fn parse(&self, body: &str, framerate: f64) -> Result<StateUpdate, VmixError> {
        Ok(normalize(self.extract(body)?, framerate))
    }

    fn extract(&self, body: &str) -> Result<Snapshot, VmixError> {
        if body.trim().is_empty() {
            return Err(VmixError::EmptyBody);
        }
        if !body.to_ascii_lowercase().contains("<vmix") {
            return Err(VmixError::NotVmix);
        }

        let mut snapshot = Snapshot::default();
        if let Some(m) = self.recording.captures(body) {
            snapshot.recording = m[1].eq_ignore_ascii_case("true");
        }
        if let Some(m) = self.streaming.captures(body) {
            snapshot.streaming = m[1].eq_ignore_ascii_case("true");
        }
        if let Some(m) = self.duration.captures(body) {
            snapshot.duration_ms = m[1].parse().unwrap_or(0);
        }

        log::trace!(
            "[vMix] snapshot: recording={}, streaming={}, duration={}ms",
            snapshot.recording,
            snapshot.streaming,
            snapshot.duration_ms
        );

        // First input that is Running or Paused wins.
        for tag in self.input_tag.find_iter(body) {
            let tag = tag.as_str();
            let Some(state) = self.state_attr.captures(tag).map(|c| c[1].to_string()) else {
                continue;
            };
            if state.eq_ignore_ascii_case("running") || state.eq_ignore_ascii_case("paused") {
                snapshot.active_input_title =
                    self.title_attr.captures(tag).map(|c| c[1].to_string());
                snapshot.active_input_state = Some(state);
                break;
            }
        }

        Ok(snapshot)
    }
}

/// Applies the normalisation priority: recording beats a running input,
/// which beats a paused input, which beats idle.
fn normalize(snapshot: Snapshot, framerate: f64) -> StateUpdate {
    let title = snapshot.active_input_title.clone().unwrap_or_default();
    let input_state = snapshot.active_input_state.as_deref().unwrap_or("");

    let (state, filename) = if snapshot.recording {
        let filename = if title.is_empty() {
            "Recording".to_string()
        } else {
            title
        };
        (TransportState::Rec, filename)
    } else if input_state.eq_ignore_ascii_case("running") {
        (TransportState::Play, title)
    } else if input_state.eq_ignore_ascii_case("paused") {
        (TransportState::Stop, title)
    } else {
        (TransportState::Stop, String::new())
    };

    StateUpdate {
        state,
        timecode: milliseconds_to_timecode(snapshot.duration_ms, framerate),
        filename,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str, framerate: f64) -> Result<StateUpdate, VmixError> {
        SnapshotParser::new().parse(body, framerate)
    }

    #[test]
    fn recording_with_running_input() {
        let body = r#"<vmix><recording>True</recording><streaming>False</streaming><duration>60000</duration><inputs><input title="News" state="Running"/></inputs></vmix>"#;
        let update = parse(body, 50.0).unwrap();
        assert_eq!(
            update,
            StateUpdate {
                state: TransportState::Rec,
                timecode: "00:01:00:00".to_string(),
                filename: "News".to_string(),
            }
        );
    }

    #[test]
    fn recording_without_running_input_uses_placeholder() {
        let body = r"<vmix><recording>true</recording><duration>0</duration></vmix>";
        let update = parse(body, 25.0).unwrap();
        assert_eq!(update.state, TransportState::Rec);
        assert_eq!(update.filename, "Recording");
    }

    #[test]
    fn running_input_without_recording_plays() {
        let body = r#"<vmix><recording>false</recording><duration>2000</duration><inputs><input title="Promo" state="Running"/></inputs></vmix>"#;
        let update = parse(body, 25.0).unwrap();
        assert_eq!(update.state, TransportState::Play);
        assert_eq!(update.filename, "Promo");
        assert_eq!(update.timecode, "00:00:02:00");
    }

    #[test]
    fn paused_input_stops_with_title() {
        let body = r#"<vmix><inputs><input title="Held" state="Paused"/></inputs></vmix>"#;
        let update = parse(body, 25.0).unwrap();
        assert_eq!(update.state, TransportState::Stop);
        assert_eq!(update.filename, "Held");
    }

    #[test]
    fn idle_snapshot_stops_with_empty_filename() {
        let body = r#"<vmix><inputs><input title="Bench" state="Completed"/></inputs></vmix>"#;
        let update = parse(body, 25.0).unwrap();
        assert_eq!(update.state, TransportState::Stop);
        assert_eq!(update.filename, "");
    }

    #[test]
    fn first_active_input_wins() {
        let body = r#"<vmix><inputs>
            <input title="Idle" state="Completed"/>
            <input title="First" state="Running"/>
            <input title="Second" state="Running"/>
        </inputs></vmix>"#;
        let update = parse(body, 25.0).unwrap();
        assert_eq!(update.filename, "First");
    }

    #[test]
    fn attribute_order_does_not_matter() {
        let body = r#"<vmix><inputs><input state="Running" key="abc" title="Swapped"/></inputs></vmix>"#;
        let update = parse(body, 25.0).unwrap();
        assert_eq!(update.filename, "Swapped");
        assert_eq!(update.state, TransportState::Play);
    }

    #[test]
    fn empty_body_is_an_error() {
        assert!(matches!(parse("", 25.0), Err(VmixError::EmptyBody)));
        assert!(matches!(parse("   ", 25.0), Err(VmixError::EmptyBody)));
    }

    #[test]
    fn non_vmix_body_is_an_error() {
        assert!(matches!(
            parse("<html>not the api</html>", 25.0),
            Err(VmixError::NotVmix)
        ));
    }

    #[test]
    fn boolean_case_is_insensitive() {
        let body = r"<vmix><recording>TRUE</recording></vmix>";
        assert_eq!(parse(body, 25.0).unwrap().state, TransportState::Rec);
    }

    fn update(filename: &str) -> StateUpdate {
        StateUpdate {
            state: TransportState::Play,
            timecode: "00:00:01:00".to_string(),
            filename: filename.to_string(),
        }
    }

    #[test]
    fn disconnect_fires_on_exactly_the_third_failure() {
        let mut poll = PollState::default();
        assert!(matches!(
            poll.advance(Some(update("a")))[..],
            [DeviceEvent::Connected, DeviceEvent::State(_)]
        ));

        // Failures one and two re-assert the last good state.
        assert!(matches!(poll.advance(None)[..], [DeviceEvent::State(_)]));
        assert!(matches!(poll.advance(None)[..], [DeviceEvent::State(_)]));
        // The third produces exactly one disconnect.
        assert!(matches!(poll.advance(None)[..], [DeviceEvent::Disconnected]));
        // Further failures stay silent.
        assert!(poll.advance(None).is_empty());
        assert!(poll.advance(None).is_empty());
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let mut poll = PollState::default();
        poll.advance(Some(update("a")));
        poll.advance(None);
        poll.advance(None);
        // Recovery resets the counter; two fresh failures stay transient.
        poll.advance(Some(update("a")));
        assert!(matches!(poll.advance(None)[..], [DeviceEvent::State(_)]));
        assert!(matches!(poll.advance(None)[..], [DeviceEvent::State(_)]));
    }

    #[test]
    fn reconnect_re_emits_current_state() {
        let mut poll = PollState::default();
        poll.advance(Some(update("a")));
        for _ in 0..3 {
            poll.advance(None);
        }
        // Same payload as before the outage still emits after reconnect.
        let events = poll.advance(Some(update("a")));
        assert!(matches!(
            events[..],
            [DeviceEvent::Connected, DeviceEvent::State(_)]
        ));
    }

    #[test]
    fn unchanged_snapshot_does_not_re_emit() {
        let mut poll = PollState::default();
        poll.advance(Some(update("a")));
        assert!(poll.advance(Some(update("a"))).is_empty());
        assert!(matches!(
            poll.advance(Some(update("b")))[..],
            [DeviceEvent::State(_)]
        ));
    }

    #[test]
    fn failures_before_first_connect_stay_silent() {
        let mut poll = PollState::default();
        for _ in 0..5 {
            assert!(poll.advance(None).is_empty());
        }
    }
}
