//! Blackmagic HyperDeck TCP client.
//!
//! Maintains one persistent connection per deck and keeps a live view of
//! transport status, active slot and current clip. The protocol is
//! line-oriented ASCII: responses start with a three-digit code, multi-line
//! responses end their first line with `:` and terminate with a blank line,
//! and the deck pushes asynchronous notifications once subscribed.
//!
//! The connection is supervised with exponential backoff (1 s doubling to a
//! 30 s cap); an intentional `stop()` cancels any pending reconnect.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::HyperdeckError;
use crate::events::{DeviceEvent, EventSender, StateUpdate};
use crate::state::TransportState;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay after TCP establishment so the deck's banner settles before we
/// subscribe.
const BANNER_SETTLE: Duration = Duration::from_millis(100);
/// Safety net against missed notifications.
const SAFETY_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Connection parameters for one deck.
#[derive(Debug, Clone)]
pub struct HyperdeckConfig {
    pub id: u16,
    pub ip: String,
    pub port: u16,
}

impl HyperdeckConfig {
    fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Handle to a running HyperDeck client task.
pub struct HyperdeckClient {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HyperdeckClient {
    /// Spawns the client; it connects and reconnects until [`stop`] is
    /// called.
    ///
    /// [`stop`]: Self::stop
    #[must_use]
    pub fn start(config: HyperdeckConfig, events: EventSender) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(config, events, cancel.clone()));
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Intentional disconnect: cancels the connection and any pending
    /// reconnect timer, then waits for the task to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Doubles the backoff delay, saturating at the cap.
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_CAP)
}

async fn run(config: HyperdeckConfig, events: EventSender, cancel: CancellationToken) {
    let mut backoff = RECONNECT_BASE;
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect(&config) => result,
        };

        match connected {
            Ok(stream) => {
                log::info!("[HyperDeck] {}: connected", config.addr());
                backoff = RECONNECT_BASE;
                let _ = events.send((config.id, DeviceEvent::Connected));

                let outcome = serve_connection(&config, stream, &events, &cancel).await;
                if let Err(e) = outcome {
                    log::warn!("[HyperDeck] {}: connection error: {e}", config.addr());
                    let _ = events.send((config.id, DeviceEvent::Error(e.to_string())));
                } else if !cancel.is_cancelled() {
                    log::info!("[HyperDeck] {}: connection closed by peer", config.addr());
                }
                let _ = events.send((config.id, DeviceEvent::Disconnected));
                if cancel.is_cancelled() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("[HyperDeck] {}: connect failed: {e}", config.addr());
            }
        }

        log::debug!(
            "[HyperDeck] {}: reconnecting in {}s",
            config.addr(),
            backoff.as_secs()
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff);
    }
    log::debug!("[HyperDeck] {}: client stopped", config.addr());
}

async fn connect(config: &HyperdeckConfig) -> Result<TcpStream, HyperdeckError> {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(config.addr())).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        // The pending connect is dropped here, which destroys the socket.
        Err(_) => Err(HyperdeckError::ConnectTimeout(CONNECT_TIMEOUT)),
    }
}

async fn send_command(writer: &mut OwnedWriteHalf, command: &str) -> Result<(), HyperdeckError> {
    log::trace!("[HyperDeck] > {command}");
    writer.write_all(command.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

/// Runs one established connection until EOF, error or cancellation.
async fn serve_connection(
    config: &HyperdeckConfig,
    stream: TcpStream,
    events: &EventSender,
    cancel: &CancellationToken,
) -> Result<(), HyperdeckError> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut parser = LineParser::default();
    let mut tracker = TransportTracker::default();

    tokio::time::sleep(BANNER_SETTLE).await;
    send_command(&mut writer, "notify: transport: true").await?;
    send_command(&mut writer, "notify: slot: true").await?;
    send_command(&mut writer, "transport info").await?;

    let mut poll = interval_at(Instant::now() + SAFETY_POLL_INTERVAL, SAFETY_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                let Some(block) = parser.feed(&line) else { continue };
                let outcome = tracker.apply(block);
                if let Some(update) = outcome.emit {
                    let _ = events.send((config.id, DeviceEvent::State(update)));
                }
                if let Some(slot) = outcome.query_slot {
                    send_command(&mut writer, &format!("slot info: slot id: {slot}")).await?;
                }
            }
            _ = poll.tick() => {
                send_command(&mut writer, "transport info").await?;
                if let Some(slot) = tracker.active_slot() {
                    let command = format!("slot info: slot id: {slot}");
                    send_command(&mut writer, &command).await?;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Line Protocol Parser
// ─────────────────────────────────────────────────────────────────────────────

/// One complete response from the deck.
#[derive(Debug, PartialEq, Eq)]
struct ResponseBlock {
    code: u16,
    fields: HashMap<String, String>,
}

/// Assembles CR/LF-tolerant protocol lines into response blocks.
///
/// Multi-line responses start with `NNN name:` and end with a blank line;
/// single-line responses (`200 ok`) complete immediately.
#[derive(Default)]
struct LineParser {
    current: Option<ResponseBlock>,
}

impl LineParser {
    /// Feeds one line, returning a block when the line completes one.
    fn feed(&mut self, raw: &str) -> Option<ResponseBlock> {
        let line = raw.trim_end_matches('\r');

        if let Some(block) = &mut self.current {
            if line.is_empty() {
                return self.current.take();
            }
            if let Some((key, value)) = line.split_once(':') {
                block.fields.insert(normalize_key(key), value.trim().to_string());
            } else {
                log::debug!("[HyperDeck] Ignoring stray response line: {line:?}");
            }
            return None;
        }

        if line.is_empty() {
            return None;
        }
        let code = line.get(..3)?.parse::<u16>().ok()?;
        if line.len() > 3 && !line[3..].starts_with(' ') {
            return None;
        }
        if line.ends_with(':') {
            self.current = Some(ResponseBlock {
                code,
                fields: HashMap::new(),
            });
            None
        } else {
            Some(ResponseBlock {
                code,
                fields: HashMap::new(),
            })
        }
    }
}

/// Lowercases a field key and maps spaces to underscores
/// (`display timecode` -> `display_timecode`).
fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace(' ', "_")
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport Tracker
// ─────────────────────────────────────────────────────────────────────────────

/// Result of applying one response block.
#[derive(Debug, Default, PartialEq, Eq)]
struct TrackerOutcome {
    emit: Option<StateUpdate>,
    query_slot: Option<String>,
}

/// Accumulates transport/slot responses into a normalised device view and
/// decides when an emission is due.
#[derive(Default)]
struct TransportTracker {
    state: TransportState,
    timecode: Option<String>,
    filename: String,
    active_slot: Option<String>,
    /// Set while a slot query is in flight; emission is deferred so a slot
    /// change produces a single combined event. The 2 s safety poll repairs
    /// a lost slot response.
    awaiting_slot: bool,
    last_emitted: Option<StateUpdate>,
}

impl TransportTracker {
    fn active_slot(&self) -> Option<&str> {
        self.active_slot.as_deref()
    }

    fn apply(&mut self, block: ResponseBlock) -> TrackerOutcome {
        match block.code {
            // Transport info, solicited (208) and asynchronous (508).
            208 | 508 => self.apply_transport(&block.fields),
            // Slot info, solicited (202) and asynchronous (502).
            202 | 502 => self.apply_slot(&block.fields),
            code if code >= 100 => {
                log::debug!("[HyperDeck] Unhandled response {code}");
                TrackerOutcome::default()
            }
            _ => TrackerOutcome::default(),
        }
    }

    fn apply_transport(&mut self, fields: &HashMap<String, String>) -> TrackerOutcome {
        if let Some(status) = fields.get("status") {
            self.state = normalize_status(status);
        }
        if let Some(raw) = fields
            .get("display_timecode")
            .or_else(|| fields.get("timecode"))
        {
            self.timecode = Some(normalize_timecode(raw));
        }

        let mut outcome = TrackerOutcome::default();
        if let Some(slot) = fields.get("active_slot") {
            if self.active_slot.as_deref() != Some(slot.as_str()) {
                self.active_slot = Some(slot.clone());
                self.awaiting_slot = true;
                outcome.query_slot = Some(slot.clone());
            }
        }
        if !self.awaiting_slot {
            outcome.emit = self.emit_if_changed();
        }
        outcome
    }

    fn apply_slot(&mut self, fields: &HashMap<String, String>) -> TrackerOutcome {
        if let Some(clip) = fields.get("clip_name") {
            self.filename = clip.clone();
        }
        self.awaiting_slot = false;
        TrackerOutcome {
            emit: self.emit_if_changed(),
            query_slot: None,
        }
    }

    fn emit_if_changed(&mut self) -> Option<StateUpdate> {
        let update = StateUpdate {
            state: self.state,
            timecode: self
                .timecode
                .clone()
                .unwrap_or_else(|| "00:00:00:00".to_string()),
            filename: self.filename.clone(),
        };
        if self.last_emitted.as_ref() == Some(&update) {
            return None;
        }
        self.last_emitted = Some(update.clone());
        Some(update)
    }
}

/// Maps a deck status string to the normalised transport state.
///
/// Everything that is not playing or recording (stopped, preview, shuttle,
/// jog, fast forward, rewind, unknown) counts as stopped.
fn normalize_status(status: &str) -> TransportState {
    match status.to_ascii_lowercase().as_str() {
        "play" | "playing" => TransportState::Play,
        "record" | "recording" => TransportState::Rec,
        _ => TransportState::Stop,
    }
}

/// Normalises deck timecode formats to `HH:MM:SS:FF`.
///
/// Accepts colon-separated, semicolon-before-frames (drop-frame display)
/// and bare 8-digit `HHMMSSFF` forms; anything else is passed through with
/// a log line.
fn normalize_timecode(raw: &str) -> String {
    let raw = raw.trim();
    let bytes = raw.as_bytes();
    let is_timecode_shape = bytes.len() == 11
        && bytes[2] == b':'
        && bytes[5] == b':'
        && (bytes[8] == b':' || bytes[8] == b';')
        && [0, 1, 3, 4, 6, 7, 9, 10]
            .iter()
            .all(|&i| bytes[i].is_ascii_digit());

    if is_timecode_shape {
        return raw.replace(';', ":");
    }
    if bytes.len() == 8 && bytes.iter().all(|b| b.is_ascii_digit()) {
        return format!("{}:{}:{}:{}", &raw[0..2], &raw[2..4], &raw[4..6], &raw[6..8]);
    }
    log::debug!("[HyperDeck] Unexpected timecode format: {raw:?}");
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_lines(lines: &[&str]) -> (Vec<StateUpdate>, Vec<String>) {
        let mut parser = LineParser::default();
        let mut tracker = TransportTracker::default();
        let mut emitted = Vec::new();
        let mut queries = Vec::new();
        for line in lines {
            if let Some(block) = parser.feed(line) {
                let outcome = tracker.apply(block);
                if let Some(update) = outcome.emit {
                    emitted.push(update);
                }
                if let Some(slot) = outcome.query_slot {
                    queries.push(slot);
                }
            }
        }
        (emitted, queries)
    }

    #[test]
    fn parses_single_line_response() {
        let mut parser = LineParser::default();
        let block = parser.feed("200 ok").unwrap();
        assert_eq!(block.code, 200);
        assert!(block.fields.is_empty());
    }

    #[test]
    fn parses_multi_line_response_with_key_normalization() {
        let mut parser = LineParser::default();
        assert!(parser.feed("208 transport info:").is_none());
        assert!(parser.feed("status: play").is_none());
        assert!(parser.feed("display timecode: 01:23:45:12\r").is_none());
        let block = parser.feed("").unwrap();
        assert_eq!(block.code, 208);
        assert_eq!(block.fields["status"], "play");
        assert_eq!(block.fields["display_timecode"], "01:23:45:12");
    }

    #[test]
    fn ignores_lines_without_a_code() {
        let mut parser = LineParser::default();
        assert!(parser.feed("garbage without code").is_none());
        assert!(parser.feed("x08 nope").is_none());
        // Parser state is untouched; a real response still parses.
        assert!(parser.feed("200 ok").is_some());
    }

    #[test]
    fn transport_info_sequence_emits_one_combined_event() {
        let (emitted, queries) = feed_lines(&[
            "208 transport info:",
            "status: play",
            "display timecode: 01:23:45:12",
            "active slot: 1",
            "",
            "202 slot info:",
            "slot id: 1",
            "clip name: clip.mov",
            "",
        ]);
        assert_eq!(queries, vec!["1".to_string()]);
        assert_eq!(
            emitted,
            vec![StateUpdate {
                state: TransportState::Play,
                timecode: "01:23:45:12".to_string(),
                filename: "clip.mov".to_string(),
            }]
        );
    }

    #[test]
    fn repeated_transport_info_does_not_re_emit() {
        let transport = [
            "208 transport info:",
            "status: stop",
            "timecode: 00:00:10:00",
            "",
        ];
        let mut lines = transport.to_vec();
        lines.extend_from_slice(&transport);
        let (emitted, _) = feed_lines(&lines);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].state, TransportState::Stop);
    }

    #[test]
    fn slot_change_triggers_fresh_slot_query() {
        let (_, queries) = feed_lines(&[
            "208 transport info:",
            "status: stop",
            "active slot: 1",
            "",
            "508 transport info:",
            "status: stop",
            "active slot: 2",
            "",
        ]);
        assert_eq!(queries, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn status_normalization_table() {
        assert_eq!(normalize_status("play"), TransportState::Play);
        assert_eq!(normalize_status("Playing"), TransportState::Play);
        assert_eq!(normalize_status("record"), TransportState::Rec);
        assert_eq!(normalize_status("RECORDING"), TransportState::Rec);
        for other in [
            "stopped",
            "preview",
            "shuttle forward",
            "shuttle reverse",
            "jog",
            "fast forward",
            "rewind",
            "something new",
        ] {
            assert_eq!(normalize_status(other), TransportState::Stop, "{other}");
        }
    }

    #[test]
    fn timecode_normalization() {
        assert_eq!(normalize_timecode("01:23:45:12"), "01:23:45:12");
        assert_eq!(normalize_timecode("01:23:45;12"), "01:23:45:12");
        assert_eq!(normalize_timecode("01234512"), "01:23:45:12");
        // Unknown shapes pass through untouched.
        assert_eq!(normalize_timecode("1:2:3:4"), "1:2:3:4");
    }

    #[test]
    fn display_timecode_preferred_over_timecode() {
        let (emitted, _) = feed_lines(&[
            "208 transport info:",
            "status: play",
            "timecode: 00:00:00:01",
            "display timecode: 02:00:00:00",
            "",
        ]);
        assert_eq!(emitted[0].timecode, "02:00:00:00");
    }

    #[test]
    fn unknown_codes_are_ignored() {
        let (emitted, queries) = feed_lines(&[
            "500 connection info:",
            "protocol version: 1.11",
            "model: HyperDeck Studio Mini",
            "",
            "120 some future notification",
        ]);
        assert!(emitted.is_empty());
        assert!(queries.is_empty());
    }

    #[test]
    fn reconnect_backoff_sequence() {
        let mut delay = RECONNECT_BASE;
        let mut observed = vec![delay.as_secs()];
        for _ in 0..6 {
            delay = next_backoff(delay);
            observed.push(delay.as_secs());
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn stop_cancels_pending_reconnect() {
        let (tx, mut rx) = crate::events::event_channel();
        // Unroutable port: connect fails fast and the client sits in backoff.
        let client = HyperdeckClient::start(
            HyperdeckConfig {
                id: 1,
                ip: "127.0.0.1".to_string(),
                port: 1,
            },
            tx,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.stop().await;
        // No Connected event was ever produced.
        while let Ok((_, event)) = rx.try_recv() {
            assert!(!matches!(event, DeviceEvent::Connected));
        }
    }
}
