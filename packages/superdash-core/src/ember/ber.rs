//! Minimal BER-TLV encoding for the Glow DTD.
//!
//! Glow uses a narrow slice of BER: definite lengths, constructed
//! context/application tags with small tag numbers, and primitive
//! universal types (integer, boolean, UTF-8 string, relative OID). That
//! slice is implemented here directly; nothing outside it appears on the
//! wire of a small provider tree.

use bytes::{BufMut, BytesMut};

use crate::error::EmberError;

// Universal primitive tags.
pub const BOOLEAN: u8 = 0x01;
pub const INTEGER: u8 = 0x02;
pub const UTF8_STRING: u8 = 0x0C;
pub const RELATIVE_OID: u8 = 0x0D;
/// Universal SET, constructed.
pub const SET: u8 = 0x31;

/// Constructed context-specific tag `[n]`.
#[must_use]
pub fn context(n: u8) -> u8 {
    0xA0 | n
}

/// Constructed application tag `[APPLICATION n]` (n < 31).
#[must_use]
pub fn application(n: u8) -> u8 {
    0x60 | n
}

// ─────────────────────────────────────────────────────────────────────────────
// Writing
// ─────────────────────────────────────────────────────────────────────────────

/// Appends one TLV with a definite length.
pub fn write_tlv(out: &mut BytesMut, tag: u8, content: &[u8]) {
    out.put_u8(tag);
    write_length(out, content.len());
    out.put_slice(content);
}

fn write_length(out: &mut BytesMut, len: usize) {
    if len < 0x80 {
        out.put_u8(len as u8);
        return;
    }
    let bytes = (len as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    let significant = &bytes[skip..];
    out.put_u8(0x80 | significant.len() as u8);
    out.put_slice(significant);
}

/// Minimal two's-complement integer content octets.
#[must_use]
pub fn integer_content(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    // Strip redundant leading octets while the sign bit stays intact.
    while start < 7 {
        let first = bytes[start];
        let next_msb = bytes[start + 1] & 0x80;
        if (first == 0x00 && next_msb == 0) || (first == 0xFF && next_msb != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

/// RELATIVE-OID content octets: base-128 subidentifiers.
#[must_use]
pub fn relative_oid_content(path: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.len());
    for &sub in path {
        let mut chunk = [0u8; 5];
        let mut n = sub;
        let mut i = 4;
        chunk[i] = (n & 0x7F) as u8;
        n >>= 7;
        while n > 0 {
            i -= 1;
            chunk[i] = 0x80 | (n & 0x7F) as u8;
            n >>= 7;
        }
        out.extend_from_slice(&chunk[i..]);
    }
    out
}

/// Boolean content octet.
#[must_use]
pub fn boolean_content(value: bool) -> Vec<u8> {
    vec![if value { 0xFF } else { 0x00 }]
}

// ─────────────────────────────────────────────────────────────────────────────
// Reading
// ─────────────────────────────────────────────────────────────────────────────

/// One decoded TLV plus the remainder of the buffer.
#[derive(Debug, Clone, Copy)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub content: &'a [u8],
}

/// Reads the TLV at the head of `buf`, returning it and the rest.
///
/// High-tag-number forms and indefinite lengths are outside the Glow slice
/// this provider speaks and are rejected.
pub fn read_tlv(buf: &[u8]) -> Result<(Tlv<'_>, &[u8]), EmberError> {
    if buf.len() < 2 {
        return Err(EmberError::Ber("truncated TLV header"));
    }
    let tag = buf[0];
    if tag & 0x1F == 0x1F {
        return Err(EmberError::Ber("high tag numbers not supported"));
    }
    let first_len = buf[1];
    let (len, header) = if first_len < 0x80 {
        (first_len as usize, 2)
    } else {
        let count = (first_len & 0x7F) as usize;
        if count == 0 || count > 4 {
            return Err(EmberError::Ber("unsupported length form"));
        }
        if buf.len() < 2 + count {
            return Err(EmberError::Ber("truncated length"));
        }
        let mut len = 0usize;
        for &b in &buf[2..2 + count] {
            len = len << 8 | b as usize;
        }
        (len, 2 + count)
    };
    if buf.len() < header + len {
        return Err(EmberError::Ber("truncated content"));
    }
    Ok((
        Tlv {
            tag,
            content: &buf[header..header + len],
        },
        &buf[header + len..],
    ))
}

/// Iterates over the TLVs packed in a constructed content.
pub fn tlvs(mut buf: &[u8]) -> impl Iterator<Item = Result<Tlv<'_>, EmberError>> {
    std::iter::from_fn(move || {
        if buf.is_empty() {
            return None;
        }
        match read_tlv(buf) {
            Ok((tlv, rest)) => {
                buf = rest;
                Some(Ok(tlv))
            }
            Err(e) => {
                buf = &[];
                Some(Err(e))
            }
        }
    })
}

/// Finds the first child TLV with the given tag inside a constructed
/// content.
pub fn find_child<'a>(buf: &'a [u8], tag: u8) -> Option<Tlv<'a>> {
    tlvs(buf).flatten().find(|tlv| tlv.tag == tag)
}

/// Decodes two's-complement integer content octets.
#[must_use]
pub fn decode_integer(content: &[u8]) -> i64 {
    if content.is_empty() {
        return 0;
    }
    let mut value = if content[0] & 0x80 != 0 { -1i64 } else { 0 };
    for &b in content {
        value = value << 8 | i64::from(b);
    }
    value
}

/// Decodes RELATIVE-OID content octets into subidentifiers.
#[must_use]
pub fn decode_relative_oid(content: &[u8]) -> Vec<u32> {
    let mut out = Vec::new();
    let mut current: u32 = 0;
    for &b in content {
        current = current << 7 | u32::from(b & 0x7F);
        if b & 0x80 == 0 {
            out.push(current);
            current = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlv_bytes(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_tlv(&mut buf, tag, content);
        buf.to_vec()
    }

    #[test]
    fn short_form_length() {
        assert_eq!(tlv_bytes(INTEGER, &[0x05]), vec![0x02, 0x01, 0x05]);
    }

    #[test]
    fn long_form_length() {
        let content = vec![0xAA; 200];
        let encoded = tlv_bytes(UTF8_STRING, &content);
        assert_eq!(&encoded[..3], &[0x0C, 0x81, 200]);
        assert_eq!(encoded.len(), 3 + 200);

        let (tlv, rest) = read_tlv(&encoded).unwrap();
        assert_eq!(tlv.content.len(), 200);
        assert!(rest.is_empty());
    }

    #[test]
    fn integer_minimal_encoding() {
        assert_eq!(integer_content(0), vec![0x00]);
        assert_eq!(integer_content(1), vec![0x01]);
        assert_eq!(integer_content(127), vec![0x7F]);
        assert_eq!(integer_content(128), vec![0x00, 0x80]);
        assert_eq!(integer_content(256), vec![0x01, 0x00]);
        assert_eq!(integer_content(-1), vec![0xFF]);
        assert_eq!(integer_content(-128), vec![0x80]);
        assert_eq!(integer_content(-129), vec![0xFF, 0x7F]);
    }

    #[test]
    fn integer_round_trip() {
        for v in [0i64, 1, -1, 127, 128, -128, -129, 32_767, -32_768, 1 << 40] {
            assert_eq!(decode_integer(&integer_content(v)), v, "v={v}");
        }
    }

    #[test]
    fn relative_oid_round_trip() {
        for path in [vec![1u32], vec![1, 2, 3], vec![1, 2, 300], vec![127, 128, 16_384]] {
            let content = relative_oid_content(&path);
            assert_eq!(decode_relative_oid(&content), path, "path={path:?}");
        }
    }

    #[test]
    fn relative_oid_uses_base128() {
        assert_eq!(relative_oid_content(&[1, 2, 3]), vec![0x01, 0x02, 0x03]);
        assert_eq!(relative_oid_content(&[300]), vec![0x82, 0x2C]);
    }

    #[test]
    fn tag_constructors() {
        assert_eq!(context(0), 0xA0);
        assert_eq!(context(2), 0xA2);
        assert_eq!(application(0), 0x60);
        assert_eq!(application(11), 0x6B);
    }

    #[test]
    fn nested_children_are_findable() {
        let mut inner = BytesMut::new();
        write_tlv(&mut inner, INTEGER, &integer_content(32));
        let mut outer = BytesMut::new();
        write_tlv(&mut outer, context(0), &inner);
        write_tlv(&mut outer, context(1), &[0x01, 0x01, 0xFF]);

        let found = find_child(&outer, context(1)).unwrap();
        assert_eq!(found.content, &[0x01, 0x01, 0xFF]);
        assert!(find_child(&outer, context(5)).is_none());
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(read_tlv(&[0x02]).is_err());
        assert!(read_tlv(&[0x02, 0x05, 0x01]).is_err());
        assert!(read_tlv(&[0x02, 0x85, 0x01]).is_err());
    }
}
