//! Glow DTD encoding and decoding.
//!
//! Only the slice of Glow a read-only provider needs: encoding qualified
//! nodes and parameters for directory listings and value pushes, and
//! decoding the commands and write attempts consumers send. Matrices,
//! functions, streams and templates are not part of this tree and are
//! ignored on receive.

use bytes::BytesMut;

use super::ber;
use crate::error::EmberError;

// Glow application tags.
const PARAMETER: u8 = 1;
const COMMAND: u8 = 2;
const NODE: u8 = 3;
const ELEMENT_COLLECTION: u8 = 4;
const QUALIFIED_PARAMETER: u8 = 9;
const QUALIFIED_NODE: u8 = 10;
const ROOT_ELEMENT_COLLECTION: u8 = 11;
const ROOT: u8 = 0;

// Command numbers.
const CMD_SUBSCRIBE: i64 = 30;
const CMD_UNSUBSCRIBE: i64 = 31;
const CMD_GET_DIRECTORY: i64 = 32;

// ParameterContents field tags.
const FIELD_IDENTIFIER: u8 = 0;
const FIELD_VALUE: u8 = 2;
const FIELD_ACCESS: u8 = 5;
const FIELD_ENUMERATION: u8 = 7;
const FIELD_TYPE: u8 = 13;

/// ParameterAccess: consumers may only read.
const ACCESS_READ: i64 = 1;

/// A parameter value in the Glow value CHOICE.
#[derive(Debug, Clone, PartialEq)]
pub enum GlowValue {
    Integer(i64),
    /// Enum values travel as integers; the enumeration text lives in the
    /// parameter contents.
    Enum(i64),
    String(String),
    Boolean(bool),
}

impl GlowValue {
    /// ParameterType discriminant for the `type` field.
    fn type_code(&self) -> i64 {
        match self {
            Self::Integer(_) => 1,
            Self::String(_) => 3,
            Self::Boolean(_) => 4,
            Self::Enum(_) => 6,
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        match self {
            Self::Integer(v) | Self::Enum(v) => {
                ber::write_tlv(out, ber::INTEGER, &ber::integer_content(*v));
            }
            Self::String(s) => ber::write_tlv(out, ber::UTF8_STRING, s.as_bytes()),
            Self::Boolean(b) => ber::write_tlv(out, ber::BOOLEAN, &ber::boolean_content(*b)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Wraps encoded elements into `Root -> RootElementCollection`, the payload
/// of one EmBER message.
#[must_use]
pub fn encode_root(elements: &[Vec<u8>]) -> Vec<u8> {
    let mut collection = BytesMut::new();
    for element in elements {
        ber::write_tlv(&mut collection, ber::context(0), element);
    }
    let mut root_content = BytesMut::new();
    ber::write_tlv(
        &mut root_content,
        ber::application(ROOT_ELEMENT_COLLECTION),
        &collection,
    );
    let mut root = BytesMut::new();
    ber::write_tlv(&mut root, ber::application(ROOT), &root_content);
    root.to_vec()
}

/// Encodes a `QualifiedNode` carrying only its identifier, as used in
/// directory listings.
#[must_use]
pub fn encode_qualified_node(path: &[u32], identifier: &str) -> Vec<u8> {
    let mut contents = BytesMut::new();
    {
        let mut id = BytesMut::new();
        ber::write_tlv(&mut id, ber::UTF8_STRING, identifier.as_bytes());
        ber::write_tlv(&mut contents, ber::context(FIELD_IDENTIFIER), &id);
    }
    let mut set = BytesMut::new();
    ber::write_tlv(&mut set, ber::SET, &contents);

    let mut node = BytesMut::new();
    {
        let mut path_tlv = BytesMut::new();
        ber::write_tlv(
            &mut path_tlv,
            ber::RELATIVE_OID,
            &ber::relative_oid_content(path),
        );
        ber::write_tlv(&mut node, ber::context(0), &path_tlv);
    }
    ber::write_tlv(&mut node, ber::context(1), &set);

    let mut out = BytesMut::new();
    ber::write_tlv(&mut out, ber::application(QUALIFIED_NODE), &node);
    out.to_vec()
}

/// Describes one parameter for encoding.
#[derive(Debug, Clone)]
pub struct ParameterSpec<'a> {
    pub path: &'a [u32],
    /// Present in full listings, absent in bare value updates.
    pub identifier: Option<&'a str>,
    pub value: GlowValue,
    /// Newline-separated enumeration text for enum parameters.
    pub enumeration: Option<&'a str>,
    /// When set, access/type metadata is included (full listing).
    pub with_metadata: bool,
}

/// Encodes a `QualifiedParameter`.
///
/// Full listings carry identifier, access, type and enumeration; value
/// pushes carry only the value so the update frame stays minimal.
#[must_use]
pub fn encode_qualified_parameter(spec: &ParameterSpec<'_>) -> Vec<u8> {
    let mut contents = BytesMut::new();

    if let Some(identifier) = spec.identifier {
        let mut id = BytesMut::new();
        ber::write_tlv(&mut id, ber::UTF8_STRING, identifier.as_bytes());
        ber::write_tlv(&mut contents, ber::context(FIELD_IDENTIFIER), &id);
    }
    {
        let mut value = BytesMut::new();
        spec.value.encode(&mut value);
        ber::write_tlv(&mut contents, ber::context(FIELD_VALUE), &value);
    }
    if spec.with_metadata {
        let mut access = BytesMut::new();
        ber::write_tlv(&mut access, ber::INTEGER, &ber::integer_content(ACCESS_READ));
        ber::write_tlv(&mut contents, ber::context(FIELD_ACCESS), &access);

        if let Some(enumeration) = spec.enumeration {
            let mut text = BytesMut::new();
            ber::write_tlv(&mut text, ber::UTF8_STRING, enumeration.as_bytes());
            ber::write_tlv(&mut contents, ber::context(FIELD_ENUMERATION), &text);
        }

        let mut kind = BytesMut::new();
        ber::write_tlv(
            &mut kind,
            ber::INTEGER,
            &ber::integer_content(spec.value.type_code()),
        );
        ber::write_tlv(&mut contents, ber::context(FIELD_TYPE), &kind);
    }

    let mut set = BytesMut::new();
    ber::write_tlv(&mut set, ber::SET, &contents);

    let mut parameter = BytesMut::new();
    {
        let mut path_tlv = BytesMut::new();
        ber::write_tlv(
            &mut path_tlv,
            ber::RELATIVE_OID,
            &ber::relative_oid_content(spec.path),
        );
        ber::write_tlv(&mut parameter, ber::context(0), &path_tlv);
    }
    ber::write_tlv(&mut parameter, ber::context(1), &set);

    let mut out = BytesMut::new();
    ber::write_tlv(&mut out, ber::application(QUALIFIED_PARAMETER), &parameter);
    out.to_vec()
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// A request decoded from a consumer's EmBER payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerRequest {
    /// GetDirectory on the node/parameter at `path` (empty = root).
    GetDirectory(Vec<u32>),
    Subscribe(Vec<u32>),
    Unsubscribe(Vec<u32>),
    /// A value write attempt on the parameter at `path`.
    SetValue(Vec<u32>),
}

/// Decodes all requests from one EmBER payload.
///
/// Unknown element kinds are skipped; a structurally broken payload is an
/// error so the connection handler can log it.
pub fn decode_requests(payload: &[u8]) -> Result<Vec<ConsumerRequest>, EmberError> {
    let (root, _) = ber::read_tlv(payload)?;
    if root.tag != ber::application(ROOT) {
        return Err(EmberError::Ber("payload is not a Glow root"));
    }
    let mut requests = Vec::new();
    for collection in ber::tlvs(root.content) {
        let collection = collection?;
        if collection.tag != ber::application(ROOT_ELEMENT_COLLECTION) {
            continue;
        }
        for element in ber::tlvs(collection.content) {
            let element = element?;
            if element.tag == ber::context(0) {
                walk_element(element.content, &[], &mut requests)?;
            }
        }
    }
    Ok(requests)
}

/// Walks one element (the content of a `[0]` wrapper), accumulating
/// requests. `base` is the tree path established by enclosing elements.
fn walk_element(
    content: &[u8],
    base: &[u32],
    requests: &mut Vec<ConsumerRequest>,
) -> Result<(), EmberError> {
    let (tlv, _) = ber::read_tlv(content)?;

    if tlv.tag == ber::application(COMMAND) {
        if let Some(number) = ber::find_child(tlv.content, ber::context(0))
            .and_then(|wrapper| ber::find_child(wrapper.content, ber::INTEGER))
            .map(|n| ber::decode_integer(n.content))
        {
            let path = base.to_vec();
            match number {
                CMD_GET_DIRECTORY => requests.push(ConsumerRequest::GetDirectory(path)),
                CMD_SUBSCRIBE => requests.push(ConsumerRequest::Subscribe(path)),
                CMD_UNSUBSCRIBE => requests.push(ConsumerRequest::Unsubscribe(path)),
                other => log::debug!("[Ember+] Ignoring command {other}"),
            }
        }
        return Ok(());
    }

    match tlv.tag {
        tag if tag == ber::application(QUALIFIED_NODE) => {
            let path = element_path(tlv.content, base, true)?;
            walk_children(tlv.content, &path, requests)
        }
        tag if tag == ber::application(NODE) => {
            let path = element_path(tlv.content, base, false)?;
            walk_children(tlv.content, &path, requests)
        }
        tag if tag == ber::application(QUALIFIED_PARAMETER) => {
            let path = element_path(tlv.content, base, true)?;
            if has_value_write(tlv.content) {
                requests.push(ConsumerRequest::SetValue(path));
            }
            Ok(())
        }
        tag if tag == ber::application(PARAMETER) => {
            let path = element_path(tlv.content, base, false)?;
            if has_value_write(tlv.content) {
                requests.push(ConsumerRequest::SetValue(path));
            }
            Ok(())
        }
        tag => {
            log::debug!("[Ember+] Ignoring element with tag 0x{tag:02X}");
            Ok(())
        }
    }
}

/// Resolves the tree path of an element: qualified elements carry a
/// RELATIVE-OID, plain elements a number appended to the base path.
fn element_path(content: &[u8], base: &[u32], qualified: bool) -> Result<Vec<u32>, EmberError> {
    let wrapper =
        ber::find_child(content, ber::context(0)).ok_or(EmberError::Ber("element without path"))?;
    if qualified {
        let oid = ber::find_child(wrapper.content, ber::RELATIVE_OID)
            .ok_or(EmberError::Ber("qualified element without OID"))?;
        Ok(ber::decode_relative_oid(oid.content))
    } else {
        let number = ber::find_child(wrapper.content, ber::INTEGER)
            .ok_or(EmberError::Ber("element without number"))?;
        let mut path = base.to_vec();
        path.push(ber::decode_integer(number.content) as u32);
        Ok(path)
    }
}

/// Recurses into an element's `[2]` children collection.
fn walk_children(
    content: &[u8],
    base: &[u32],
    requests: &mut Vec<ConsumerRequest>,
) -> Result<(), EmberError> {
    let Some(children) = ber::find_child(content, ber::context(2)) else {
        return Ok(());
    };
    let Some(collection) = ber::find_child(children.content, ber::application(ELEMENT_COLLECTION))
    else {
        return Ok(());
    };
    for element in ber::tlvs(collection.content) {
        let element = element?;
        if element.tag == ber::context(0) {
            walk_element(element.content, base, requests)?;
        }
    }
    Ok(())
}

/// True when a parameter element's contents carry a value (a write
/// attempt).
fn has_value_write(content: &[u8]) -> bool {
    ber::find_child(content, ber::context(1))
        .and_then(|contents| ber::find_child(contents.content, ber::SET))
        .map_or(false, |set| {
            ber::find_child(set.content, ber::context(FIELD_VALUE)).is_some()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds the payload a consumer sends for GetDirectory on `path`
    /// (empty path = bare root command).
    fn consumer_get_directory(path: &[u32]) -> Vec<u8> {
        let mut command = BytesMut::new();
        {
            let mut number = BytesMut::new();
            ber::write_tlv(&mut number, ber::INTEGER, &ber::integer_content(32));
            ber::write_tlv(&mut command, ber::context(0), &number);
        }
        let mut command_tlv = BytesMut::new();
        ber::write_tlv(&mut command_tlv, ber::application(COMMAND), &command);

        if path.is_empty() {
            return encode_root(&[command_tlv.to_vec()]);
        }

        // QualifiedNode { path, children: ElementCollection { Command } }.
        let mut wrapped = BytesMut::new();
        ber::write_tlv(&mut wrapped, ber::context(0), &command_tlv);
        let mut collection = BytesMut::new();
        ber::write_tlv(&mut collection, ber::application(ELEMENT_COLLECTION), &wrapped);

        let mut node = BytesMut::new();
        {
            let mut path_tlv = BytesMut::new();
            ber::write_tlv(
                &mut path_tlv,
                ber::RELATIVE_OID,
                &ber::relative_oid_content(path),
            );
            ber::write_tlv(&mut node, ber::context(0), &path_tlv);
        }
        ber::write_tlv(&mut node, ber::context(2), &collection);

        let mut node_tlv = BytesMut::new();
        ber::write_tlv(&mut node_tlv, ber::application(QUALIFIED_NODE), &node);
        encode_root(&[node_tlv.to_vec()])
    }

    /// Builds a consumer write attempt on a parameter.
    fn consumer_set_value(path: &[u32], value: i64) -> Vec<u8> {
        let spec = ParameterSpec {
            path,
            identifier: None,
            value: GlowValue::Integer(value),
            enumeration: None,
            with_metadata: false,
        };
        encode_root(&[encode_qualified_parameter(&spec)])
    }

    #[test]
    fn decodes_root_get_directory() {
        let payload = consumer_get_directory(&[]);
        let requests = decode_requests(&payload).unwrap();
        assert_eq!(requests, vec![ConsumerRequest::GetDirectory(vec![])]);
    }

    #[test]
    fn decodes_qualified_get_directory() {
        let payload = consumer_get_directory(&[1, 2]);
        let requests = decode_requests(&payload).unwrap();
        assert_eq!(requests, vec![ConsumerRequest::GetDirectory(vec![1, 2])]);
    }

    #[test]
    fn decodes_value_write_attempt() {
        let payload = consumer_set_value(&[1, 2, 1, 1], 1);
        let requests = decode_requests(&payload).unwrap();
        assert_eq!(requests, vec![ConsumerRequest::SetValue(vec![1, 2, 1, 1])]);
    }

    #[test]
    fn value_update_has_no_write_marker_side_effects() {
        // A bare value push (what the provider itself sends) decodes as a
        // SetValue shape; the provider never feeds its own frames back, so
        // this just pins the wire symmetry.
        let spec = ParameterSpec {
            path: &[1, 1, 2],
            identifier: None,
            value: GlowValue::Integer(4),
            enumeration: None,
            with_metadata: false,
        };
        let payload = encode_root(&[encode_qualified_parameter(&spec)]);
        let requests = decode_requests(&payload).unwrap();
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn node_listing_is_decodable_structure() {
        let payload = encode_root(&[
            encode_qualified_node(&[1, 1], "Info"),
            encode_qualified_node(&[1, 2], "Devices"),
        ]);
        // Listing elements carry no commands or values.
        let requests = decode_requests(&payload).unwrap();
        assert!(requests.is_empty());
    }

    #[test]
    fn rejects_non_glow_payload() {
        assert!(decode_requests(&[0x30, 0x01, 0x00]).is_err());
        assert!(decode_requests(&[]).is_err());
    }

    #[test]
    fn enum_parameter_carries_enumeration_text() {
        let spec = ParameterSpec {
            path: &[1, 2, 1, 1],
            identifier: Some("State"),
            value: GlowValue::Enum(1),
            enumeration: Some("stop\nplay\nrec\noffline"),
            with_metadata: true,
        };
        let encoded = encode_qualified_parameter(&spec);
        // The enumeration text must appear verbatim in the TLV stream.
        let needle = b"stop\nplay\nrec\noffline";
        assert!(encoded
            .windows(needle.len())
            .any(|window| window == needle));
    }
}
