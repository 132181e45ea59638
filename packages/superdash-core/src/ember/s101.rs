//! S101 framing for Ember+ over TCP.
//!
//! Frames are delimited by BOF 0xFE and EOF 0xFF; payload bytes in the
//! 0xF8..=0xFF range are escaped with CE 0xFD followed by the byte XOR
//! 0x20. A CRC16-CCITT (reversed polynomial, one's complement) over the
//! unescaped body trails the payload. Above the framing sits a small
//! message header carrying the EmBER message type and keepalive commands.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::EmberError;

const BOF: u8 = 0xFE;
const EOF: u8 = 0xFF;
const CE: u8 = 0xFD;
const ESCAPE_XOR: u8 = 0x20;
/// Bytes at or above this value collide with framing and must be escaped.
const ESCAPE_THRESHOLD: u8 = 0xF8;

/// Residue of a valid CRC computed over body plus trailing CRC octets.
const CRC_RESIDUE: u16 = 0xF0B8;

const SLOT: u8 = 0x00;
const MSG_EMBER: u8 = 0x0E;
const CMD_EMBER: u8 = 0x00;
const CMD_KEEPALIVE_REQUEST: u8 = 0x01;
const CMD_KEEPALIVE_RESPONSE: u8 = 0x02;
const VERSION: u8 = 0x01;
/// First-packet | last-packet: the tree is small enough that every payload
/// fits one frame.
const FLAGS_SINGLE_PACKET: u8 = 0xC0;
const DTD_GLOW: u8 = 0x01;
/// Application bytes advertising Glow DTD 2.31.
const APP_BYTES: [u8; 2] = [0x02, 0x1F];

/// CRC16-CCITT, reversed polynomial 0x8408, initial value 0xFFFF.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x8408
            } else {
                crc >> 1
            };
        }
    }
    crc
}

fn put_escaped(out: &mut BytesMut, byte: u8) {
    if byte >= ESCAPE_THRESHOLD {
        out.put_u8(CE);
        out.put_u8(byte ^ ESCAPE_XOR);
    } else {
        out.put_u8(byte);
    }
}

/// Wraps an unescaped body in a complete frame: BOF, escaped body and CRC,
/// EOF.
fn encode_frame(body: &[u8]) -> Bytes {
    let crc = !crc16(body);
    let mut out = BytesMut::with_capacity(body.len() + 6);
    out.put_u8(BOF);
    for &byte in body {
        put_escaped(&mut out, byte);
    }
    for byte in crc.to_le_bytes() {
        put_escaped(&mut out, byte);
    }
    out.put_u8(EOF);
    out.freeze()
}

/// Frames a Glow payload as a single-packet EmBER message.
#[must_use]
pub fn encode_ember(payload: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(payload.len() + 9);
    body.put_u8(SLOT);
    body.put_u8(MSG_EMBER);
    body.put_u8(CMD_EMBER);
    body.put_u8(VERSION);
    body.put_u8(FLAGS_SINGLE_PACKET);
    body.put_u8(DTD_GLOW);
    body.put_u8(APP_BYTES.len() as u8);
    body.put_slice(&APP_BYTES);
    body.put_slice(payload);
    encode_frame(&body)
}

/// Frames a keepalive response.
#[must_use]
pub fn encode_keepalive_response() -> Bytes {
    encode_frame(&[SLOT, MSG_EMBER, CMD_KEEPALIVE_RESPONSE, VERSION])
}

/// Frames a keepalive request, as sent by consumers (and by tests acting
/// as one).
#[must_use]
pub fn encode_keepalive_request() -> Bytes {
    encode_frame(&[SLOT, MSG_EMBER, CMD_KEEPALIVE_REQUEST, VERSION])
}

/// A decoded S101 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S101Message {
    KeepaliveRequest,
    KeepaliveResponse,
    /// Glow payload bytes (header stripped).
    Ember(Vec<u8>),
}

/// Parses the message layer of one unescaped, CRC-verified frame body.
pub fn decode_message(body: &[u8]) -> Result<S101Message, EmberError> {
    if body.len() < 3 {
        return Err(EmberError::Framing("frame too short"));
    }
    if body[1] != MSG_EMBER {
        return Err(EmberError::Framing("not an EmBER message"));
    }
    match body[2] {
        CMD_KEEPALIVE_REQUEST => Ok(S101Message::KeepaliveRequest),
        CMD_KEEPALIVE_RESPONSE => Ok(S101Message::KeepaliveResponse),
        CMD_EMBER => {
            // slot, msg, cmd, version, flags, dtd, app byte count, app bytes.
            if body.len() < 7 {
                return Err(EmberError::Framing("truncated EmBER header"));
            }
            let app_count = body[6] as usize;
            let payload_start = 7 + app_count;
            if body.len() < payload_start {
                return Err(EmberError::Framing("truncated application bytes"));
            }
            Ok(S101Message::Ember(body[payload_start..].to_vec()))
        }
        _ => Err(EmberError::Framing("unknown S101 command")),
    }
}

/// Incremental frame decoder for a TCP byte stream.
///
/// Bytes outside BOF/EOF are discarded; frames with a bad CRC are dropped
/// with a log line rather than killing the connection.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    in_frame: bool,
    escaping: bool,
}

impl FrameDecoder {
    /// Feeds received bytes, returning every completed frame body
    /// (unescaped, CRC stripped).
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in data {
            match byte {
                BOF => {
                    self.buf.clear();
                    self.in_frame = true;
                    self.escaping = false;
                }
                EOF if self.in_frame => {
                    self.in_frame = false;
                    if let Some(frame) = self.complete_frame() {
                        frames.push(frame);
                    }
                }
                CE if self.in_frame => self.escaping = true,
                _ if self.in_frame => {
                    let byte = if self.escaping {
                        self.escaping = false;
                        byte ^ ESCAPE_XOR
                    } else {
                        byte
                    };
                    self.buf.push(byte);
                }
                _ => {}
            }
        }
        frames
    }

    fn complete_frame(&mut self) -> Option<Vec<u8>> {
        let frame = std::mem::take(&mut self.buf);
        if frame.len() < 3 {
            log::debug!("[Ember+] Dropping runt frame ({} bytes)", frame.len());
            return None;
        }
        if crc16(&frame) != CRC_RESIDUE {
            log::debug!("[Ember+] Dropping frame with bad CRC");
            return None;
        }
        Some(frame[..frame.len() - 2].to_vec())
    }
}
