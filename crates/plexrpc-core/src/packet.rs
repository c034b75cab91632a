//! # Packet assembly and decoding
//!
//! A request goes out as three spans so the payload is never copied:
//!
//! ```text
//! pre:  0Q, <id> [client] <key> <timeout> [attrs] [context] [fd] [<len>k]
//! data: <request bytes>
//! post: [,] 0z\n
//! ```
//!
//! Responses mirror it with `A` as the packet type and `q` for the payload.
//! [`PacketDecoder`] consumes fields one at a time (from a stream or a
//! slice) and reports completion at the end marker.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::ops::Range;

use crate::attr::Attributes;
use crate::fault::{Fault, FaultCode};
use crate::netstring::{nt, NetStringParser, NetStringWriter};
use crate::service_key::ServiceKey;

/// Context keys under this prefix belong to the library
pub const RESERVED_CONTEXT_PREFIX: &str = "plexrpc.";

// ── Context ──

/// Caller key/value pairs, kept encoded until first read
#[derive(Debug, Default)]
pub struct Context {
    encoded: NetStringWriter,
    decoded: OnceCell<Result<BTreeMap<String, String>, Fault>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt an encoded blob received from the peer
    pub fn from_encoded(bytes: &[u8]) -> Self {
        let mut encoded = NetStringWriter::with_capacity(bytes.len());
        encoded.append_raw(bytes);
        Context { encoded, decoded: OnceCell::new() }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Fault> {
        if key.starts_with(RESERVED_CONTEXT_PREFIX) {
            return Err(Fault::new(
                FaultCode::ContextReservedNamespace,
                format!("Context Key uses reserved prefix of '{}'", RESERVED_CONTEXT_PREFIX),
            ));
        }
        self.encoded
            .append_str(nt::CONTEXT_KEY, key)
            .append_str(nt::CONTEXT_VALUE, value);
        self.decoded = OnceCell::new();
        Ok(())
    }

    /// Look up `key`, decoding the blob on first use. Later pairs win.
    pub fn get(&self, key: &str) -> Result<Option<&str>, Fault> {
        match self.decoded.get_or_init(|| decode_context(self.encoded.as_bytes())) {
            Ok(map) => Ok(map.get(key).map(String::as_str)),
            Err(fault) => Err(fault.clone()),
        }
    }

    pub fn encoded(&self) -> &[u8] {
        self.encoded.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }

    pub fn clear(&mut self) {
        self.encoded.clear();
        self.decoded = OnceCell::new();
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Context::from_encoded(self.encoded.as_bytes())
    }
}

fn decode_context(bytes: &[u8]) -> Result<BTreeMap<String, String>, Fault> {
    let bad = |text: String| Fault::new(FaultCode::ContextFormatError, text);
    let mut map = BTreeMap::new();
    let mut fields = NetStringParser::new(bytes);
    while let Some(key) = fields.next() {
        let key = key.map_err(|e| bad(format!("Malformed context: {}", e)))?;
        if key.ty != nt::CONTEXT_KEY {
            return Err(bad(format!(
                "Unexpected context type. Wanted: 'k', but got: '{}'",
                key.ty as char
            )));
        }
        let value = fields
            .next()
            .ok_or_else(|| bad("Context key without a value".to_string()))?
            .map_err(|e| bad(format!("Malformed context: {}", e)))?;
        if value.ty != nt::CONTEXT_VALUE {
            return Err(bad(format!(
                "Unexpected context type. Wanted: 'v', but got: '{}'",
                value.ty as char
            )));
        }
        map.insert(
            String::from_utf8_lossy(key.data).into_owned(),
            String::from_utf8_lossy(value.data).into_owned(),
        );
    }
    Ok(map)
}

// ── Assembly ──

/// Everything that goes in front of and behind a request payload
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader<'a> {
    pub request_id: u64,
    pub client_name: &'a str,
    pub service_key: &'a str,
    pub timeout_ms: u64,
    pub attributes: Attributes,
    pub context: &'a [u8],
    pub has_fd: bool,
    pub data_len: usize,
}

impl RequestHeader<'_> {
    pub fn assemble(&self, pre: &mut NetStringWriter, post: &mut NetStringWriter) {
        pre.append_marker(nt::REQUEST_PACKET);
        pre.append_int(nt::REQUEST_ID, self.request_id);
        if !self.client_name.is_empty() {
            pre.append_str(nt::CLIENT_ID, self.client_name);
        }
        pre.append_str(nt::SERVICE_KEY, self.service_key);
        pre.append_int(nt::TIMEOUT_MS, self.timeout_ms);
        for (attr, marker) in Attributes::MARKERS {
            if self.attributes.contains(attr) {
                pre.append_marker(marker);
            }
        }
        if !self.context.is_empty() {
            pre.append(nt::CONTEXT, self.context);
        }
        if self.has_fd {
            pre.append_marker(nt::FILE_DESCRIPTOR);
        }
        close_payload(pre, post, nt::REQUEST_DATA, self.data_len);
    }
}

/// Service-side counterpart of [`RequestHeader`]
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader<'a> {
    pub request_id: u64,
    pub client_name: &'a str,
    pub service_name: &'a str,
    pub fault_code: i32,
    pub fault_text: &'a str,
    pub data_len: usize,
}

impl ResponseHeader<'_> {
    pub fn assemble(&self, pre: &mut NetStringWriter, post: &mut NetStringWriter) {
        pre.append_marker(nt::RESPONSE_PACKET);
        pre.append_int(nt::REQUEST_ID, self.request_id);
        if !self.client_name.is_empty() {
            pre.append_str(nt::CLIENT_ID, self.client_name);
        }
        if !self.service_name.is_empty() {
            pre.append_str(nt::SERVICE_ID, self.service_name);
        }
        if self.fault_code != 0 {
            pre.append_int(nt::FAULT_CODE, self.fault_code);
            if !self.fault_text.is_empty() {
                pre.append_str(nt::FAULT_TEXT, self.fault_text);
            }
        }
        close_payload(pre, post, nt::RESPONSE_DATA, self.data_len);
    }
}

fn close_payload(pre: &mut NetStringWriter, post: &mut NetStringWriter, ty: u8, len: usize) {
    if len > 0 {
        pre.append_raw_prefix(ty, len);
        post.append_raw_terminator();
    }
    post.append_marker_nl(nt::END_PACKET);
}

// ── Decoding ──

/// Fields accumulated from one packet.
///
/// `data` is a range into whatever buffer the fields came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedPacket {
    pub request_id: u64,
    pub client_name: String,
    pub service_name: String,
    pub service_key: Option<ServiceKey>,
    pub timeout_ms: u64,
    pub attributes: Attributes,
    pub context: Vec<u8>,
    pub has_fd: bool,
    pub fault_code: i32,
    pub fault_text: String,
    pub data: Range<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    NeedStart,
    Accepting,
    Complete,
}

/// Field-at-a-time packet decoder
#[derive(Debug)]
pub struct PacketDecoder {
    start: u8,
    state: DecodeState,
    seen: u128,
    packet: DecodedPacket,
}

impl PacketDecoder {
    pub fn for_requests() -> Self {
        Self::new(nt::REQUEST_PACKET)
    }

    pub fn for_responses() -> Self {
        Self::new(nt::RESPONSE_PACKET)
    }

    fn new(start: u8) -> Self {
        PacketDecoder {
            start,
            state: DecodeState::NeedStart,
            seen: 0,
            packet: DecodedPacket::default(),
        }
    }

    /// Feed one field. `Ok(true)` once the end marker has arrived.
    ///
    /// Unknown field types are skipped so newer peers can add fields.
    pub fn add(&mut self, ty: u8, data: &[u8], range: Range<usize>) -> Result<bool, String> {
        match self.state {
            DecodeState::NeedStart => {
                if ty != self.start {
                    return Err(format!(
                        "Unexpected netString type. Wanted: {}, but got: '{}' ({})",
                        nt::name(self.start),
                        ty as char,
                        nt::name(ty)
                    ));
                }
                self.state = DecodeState::Accepting;
                return Ok(false);
            }
            DecodeState::Complete => return Err("Have a complete packet already".to_string()),
            DecodeState::Accepting => {}
        }

        if ty >= 128 {
            return Err(format!("Out-of-range netString type: ({})", ty));
        }
        let bit = 1u128 << ty;
        if self.seen & bit != 0 {
            return Err(format!("Duplicate netString type of {}", nt::name(ty)));
        }
        self.seen |= bit;

        let p = &mut self.packet;
        match ty {
            nt::REQUEST_ID => p.request_id = parse_number(data)?,
            nt::CLIENT_ID => p.client_name = String::from_utf8_lossy(data).into_owned(),
            nt::SERVICE_ID => p.service_name = String::from_utf8_lossy(data).into_owned(),
            nt::SERVICE_KEY => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| "Invalid Service Key: not UTF-8".to_string())?;
                let key = ServiceKey::parse(text)
                    .map_err(|e| format!("Invalid Service Key: {}", e))?;
                p.service_key = Some(key);
            }
            nt::TIMEOUT_MS => p.timeout_ms = parse_number(data)?,
            nt::CONTEXT => p.context = data.to_vec(),
            nt::FILE_DESCRIPTOR => p.has_fd = true,
            nt::FAULT_CODE => p.fault_code = parse_number(data)?,
            nt::FAULT_TEXT => p.fault_text = String::from_utf8_lossy(data).into_owned(),
            nt::REQUEST_DATA | nt::RESPONSE_DATA => p.data = range,
            nt::END_PACKET => self.state = DecodeState::Complete,
            other => {
                if let Some(attr) = Attributes::from_marker(other) {
                    p.attributes.insert(attr);
                }
            }
        }
        Ok(self.state == DecodeState::Complete)
    }

    pub fn is_complete(&self) -> bool {
        self.state == DecodeState::Complete
    }

    pub fn packet(&self) -> &DecodedPacket {
        &self.packet
    }

    pub fn take_packet(&mut self) -> DecodedPacket {
        let packet = std::mem::take(&mut self.packet);
        self.reset();
        packet
    }

    pub fn reset(&mut self) {
        self.state = DecodeState::NeedStart;
        self.seen = 0;
        self.packet = DecodedPacket::default();
    }
}

fn parse_number<T: std::str::FromStr>(data: &[u8]) -> Result<T, String> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            let mut msg = String::from("Invalid number: ");
            let _ = write!(msg, "{:?}", String::from_utf8_lossy(data));
            msg
        })
}

/// Decode one complete request packet from a slice.
///
/// Returns the packet and the bytes it occupied; the payload range is
/// relative to `bytes`.
pub fn decode_request_packet(bytes: &[u8]) -> Result<Option<(DecodedPacket, usize)>, String> {
    decode_packet(PacketDecoder::for_requests(), bytes)
}

/// Decode one complete response packet from a slice
pub fn decode_response_packet(bytes: &[u8]) -> Result<Option<(DecodedPacket, usize)>, String> {
    decode_packet(PacketDecoder::for_responses(), bytes)
}

fn decode_packet(
    mut decoder: PacketDecoder,
    bytes: &[u8],
) -> Result<Option<(DecodedPacket, usize)>, String> {
    let mut parser = NetStringParser::new(bytes);
    while let Some(field) = parser.next() {
        let field = match field {
            Ok(f) => f,
            Err(crate::netstring::NetStringError::Truncated) => return Ok(None),
            Err(e) => return Err(e.to_string()),
        };
        let range = field.offset..field.offset + field.data.len();
        if decoder.add(field.ty, field.data, range)? {
            return Ok(Some((decoder.take_packet(), parser.consumed())));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_bytes(header: &RequestHeader<'_>, data: &[u8]) -> Vec<u8> {
        let mut pre = NetStringWriter::new();
        let mut post = NetStringWriter::new();
        header.assemble(&mut pre, &mut post);
        [pre.as_bytes(), data, post.as_bytes()].concat()
    }

    #[test]
    fn test_request_layout() {
        let header = RequestHeader {
            request_id: 100,
            client_name: "tool:42",
            service_key: "echo.ping.1.r",
            timeout_ms: 4000,
            attributes: Attributes::NO_RETRY | Attributes::NO_WAIT,
            context: b"",
            has_fd: false,
            data_len: 2,
        };
        let bytes = request_bytes(&header, b"hi");
        assert_eq!(
            bytes,
            b"0Q,3b100,7atool:42,13cecho.ping.1.r,4l4000,0e,0g,2khi,0z\n".to_vec()
        );
    }

    #[test]
    fn test_empty_payload_has_no_data_field() {
        let header = ResponseHeader {
            request_id: 7,
            client_name: "",
            service_name: "svc",
            fault_code: 0,
            fault_text: "ignored without a code",
            data_len: 0,
        };
        let mut pre = NetStringWriter::new();
        let mut post = NetStringWriter::new();
        header.assemble(&mut pre, &mut post);
        assert_eq!(pre.as_bytes(), b"0A,1b7,3ssvc,");
        assert_eq!(post.as_bytes(), b"0z\n");
    }

    #[test]
    fn test_decode_request_with_context() {
        let mut ctx = Context::new();
        ctx.set("user", "kim").unwrap();
        let header = RequestHeader {
            request_id: 123,
            client_name: "c:1",
            service_key: "app.fn.2.j",
            timeout_ms: 50,
            attributes: Attributes::KEEP_AFFINITY | Attributes::NO_RETRY,
            context: ctx.encoded(),
            has_fd: true,
            data_len: 5,
        };
        let mut bytes = request_bytes(&header, b"{...}");
        bytes.extend_from_slice(b"trailing");
        let (packet, used) = decode_request_packet(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len() - b"trailing".len());
        assert_eq!(packet.request_id, 123);
        assert_eq!(packet.client_name, "c:1");
        assert_eq!(packet.service_key.as_ref().map(|k| k.canonical()), Some("app.fn.2.j"));
        assert_eq!(packet.timeout_ms, 50);
        assert!(packet.attributes.contains(Attributes::KEEP_AFFINITY));
        assert!(packet.has_fd);
        assert_eq!(&bytes[packet.data.clone()], b"{...}");
        assert_eq!(Context::from_encoded(&packet.context).get("user").unwrap(), Some("kim"));
    }

    #[test]
    fn test_partial_packet_is_none() {
        assert_eq!(decode_response_packet(b"0A,3b10"), Ok(None));
        assert_eq!(decode_response_packet(b"0A,3b100,"), Ok(None));
    }

    #[test]
    fn test_decoder_rejects() {
        let err = decode_response_packet(b"0Q,0z\n").unwrap_err();
        assert!(err.starts_with("Unexpected netString type. Wanted: responsePacket"), "{err}");

        let err = decode_response_packet(b"0A,1b1,1b2,0z\n").unwrap_err();
        assert_eq!(err, "Duplicate netString type of requestID");

        let err = decode_response_packet(b"0A,2bxx,0z\n").unwrap_err();
        assert!(err.starts_with("Invalid number"), "{err}");

        let err = decode_request_packet(b"0Q,3cbad,0z\n").unwrap_err();
        assert!(err.starts_with("Invalid Service Key: invalid syntax"), "{err}");
    }

    #[test]
    fn test_unknown_types_ignored() {
        let (packet, _) = decode_response_packet(b"0A,1b9,3Xnew,2p-5,3rwhy,0z\n")
            .unwrap()
            .unwrap();
        assert_eq!(packet.request_id, 9);
        assert_eq!(packet.fault_code, -5);
        assert_eq!(packet.fault_text, "why");
    }

    #[test]
    fn test_context_reserved_and_malformed() {
        let mut ctx = Context::new();
        let fault = ctx.set("plexrpc.trace", "1").unwrap_err();
        assert_eq!(fault.code(), FaultCode::ContextReservedNamespace);
        assert!(ctx.is_empty());

        ctx.set("a", "1").unwrap();
        ctx.set("a", "2").unwrap();
        assert_eq!(ctx.get("a").unwrap(), Some("2"));
        assert_eq!(ctx.get("b").unwrap(), None);

        let broken = Context::from_encoded(b"1va,");
        assert_eq!(broken.get("a").unwrap_err().code(), FaultCode::ContextFormatError);
        let dangling = Context::from_encoded(b"1ka,");
        assert_eq!(dangling.get("a").unwrap_err().code(), FaultCode::ContextFormatError);
    }
}
