//! OSC 1.0 packet decoding.
//!
//! CasparCG pushes its state as OSC bundles over UDP. This module decodes a
//! datagram into the flat list of messages it carries, recursing into nested
//! bundles. Only the argument types CasparCG emits are supported (int32,
//! int64, float, double, string, blob, booleans); anything else fails the
//! message, not the whole packet.

use crate::error::OscError;

const BUNDLE_TAG: &[u8] = b"#bundle\0";

/// A decoded OSC argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Blob(Vec<u8>),
    Bool(bool),
}

impl OscArg {
    /// Numeric view of the argument, if it has one. Booleans count as 0/1
    /// so `paused = (value == 1)` works for either encoding.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(f64::from(*v)),
            Self::Long(v) => Some(*v as f64),
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// String view of the argument.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A decoded OSC message.
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

/// Decodes one UDP datagram into its messages.
///
/// Bundles (including nested bundles) are flattened in order; a lone
/// message yields a single-element vector. Malformed elements inside a
/// bundle are skipped with the rest of the bundle intact.
pub fn decode_packet(buf: &[u8]) -> Result<Vec<OscMessage>, OscError> {
    let mut messages = Vec::new();
    decode_element(buf, &mut messages, 0)?;
    Ok(messages)
}

/// Bundles may nest; CasparCG stays shallow but a hostile packet must not
/// recurse unboundedly.
const MAX_BUNDLE_DEPTH: usize = 8;

fn decode_element(
    buf: &[u8],
    out: &mut Vec<OscMessage>,
    depth: usize,
) -> Result<(), OscError> {
    if depth > MAX_BUNDLE_DEPTH {
        return Err(OscError::Malformed("bundle nesting too deep"));
    }
    if buf.starts_with(BUNDLE_TAG) {
        decode_bundle(buf, out, depth)
    } else {
        match decode_message(buf) {
            Ok(msg) => {
                out.push(msg);
                Ok(())
            }
            // Inside a bundle, a bad element is dropped, not fatal.
            Err(e) if depth > 0 => {
                log::debug!("[OSC] Skipping malformed bundle element: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn decode_bundle(buf: &[u8], out: &mut Vec<OscMessage>, depth: usize) -> Result<(), OscError> {
    // Header: "#bundle\0" + 8-byte time tag (ignored; CasparCG sends
    // "immediately").
    let mut cursor = Cursor::new(&buf[BUNDLE_TAG.len()..]);
    cursor.take(8)?;
    while !cursor.is_empty() {
        let size = cursor.read_i32()?;
        if size < 0 {
            return Err(OscError::Malformed("negative bundle element size"));
        }
        let element = cursor.take(size as usize)?;
        decode_element(element, out, depth + 1)?;
    }
    Ok(())
}

fn decode_message(buf: &[u8]) -> Result<OscMessage, OscError> {
    let mut cursor = Cursor::new(buf);
    let address = cursor.read_string()?;
    if !address.starts_with('/') {
        return Err(OscError::Malformed("address does not start with '/'"));
    }

    // A message without a type tag string carries no arguments.
    if cursor.is_empty() {
        return Ok(OscMessage {
            address,
            args: Vec::new(),
        });
    }

    let tags = cursor.read_string()?;
    let Some(tags) = tags.strip_prefix(',') else {
        return Err(OscError::Malformed("type tag string missing ','"));
    };

    let mut args = Vec::with_capacity(tags.len());
    for tag in tags.chars() {
        let arg = match tag {
            'i' => OscArg::Int(cursor.read_i32()?),
            'h' => OscArg::Long(cursor.read_i64()?),
            'f' => OscArg::Float(f32::from_bits(cursor.read_i32()? as u32)),
            'd' => OscArg::Double(f64::from_bits(cursor.read_i64()? as u64)),
            's' | 'S' => OscArg::Str(cursor.read_string()?),
            'b' => {
                let len = cursor.read_i32()?;
                if len < 0 {
                    return Err(OscError::Malformed("negative blob length"));
                }
                let data = cursor.take(len as usize)?.to_vec();
                cursor.skip_padding(len as usize)?;
                OscArg::Blob(data)
            }
            'T' => OscArg::Bool(true),
            'F' => OscArg::Bool(false),
            // Nil/impulse carry no payload; represent as false-ish zero.
            'N' | 'I' => OscArg::Int(0),
            other => return Err(OscError::UnsupportedType(other)),
        };
        args.push(arg);
    }

    Ok(OscMessage { address, args })
}

/// Byte cursor with OSC's 4-byte alignment rules.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], OscError> {
        let end = self.pos.checked_add(n).ok_or(OscError::Truncated)?;
        if end > self.buf.len() {
            return Err(OscError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32, OscError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, OscError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(arr))
    }

    /// Reads a null-terminated string padded to a 4-byte boundary.
    fn read_string(&mut self) -> Result<String, OscError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(OscError::Truncated)?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| OscError::InvalidString)?
            .to_string();
        // Consume the string, the terminator, and padding to the boundary.
        let consumed = (nul + 4) & !3;
        self.pos += consumed.min(rest.len());
        Ok(s)
    }

    /// Skips blob padding so the cursor lands back on a 4-byte boundary.
    fn skip_padding(&mut self, payload_len: usize) -> Result<(), OscError> {
        let pad = (4 - payload_len % 4) % 4;
        self.take(pad)?;
        Ok(())
    }
}
