//! # Typed netstrings
//!
//! Every field on the wire is a netstring with a one-byte type between the
//! length and the payload:
//!
//! ```text
//! <decimal length><type><payload><terminator>      e.g.  5cHello,
//! ```
//!
//! The terminator is `,` or `\n`; the end-of-packet marker uses `\n` so a
//! packet reads well in a terminal. Lengths are capped at 999,999,999.
//!
//! Three pieces live here:
//!
//! - [`NetStringWriter`] appends fields to an owned buffer
//! - [`NetStringParser`] walks a complete in-memory byte slice
//! - [`NetStringBuffer`] accumulates bytes from a socket and yields fields as
//!   they complete, growing under a size cap

use std::fmt;
use std::io::Write;
use std::ops::Range;

/// Largest payload length a netstring may declare
pub const MAX_LENGTH: usize = 999_999_999;

/// Field and packet type bytes
pub mod nt {
    pub const REQUEST_PACKET: u8 = b'Q';
    pub const RESPONSE_PACKET: u8 = b'A';
    pub const END_PACKET: u8 = b'z';

    pub const CLIENT_ID: u8 = b'a';
    pub const REQUEST_ID: u8 = b'b';
    pub const SERVICE_KEY: u8 = b'c';
    pub const NO_WAIT: u8 = b'e';
    pub const NO_REMOTE: u8 = b'f';
    pub const NO_RETRY: u8 = b'g';
    pub const KEEP_AFFINITY: u8 = b'h';
    pub const NEED_AFFINITY: u8 = b'i';
    pub const CONTEXT: u8 = b'j';
    pub const REQUEST_DATA: u8 = b'k';
    pub const TIMEOUT_MS: u8 = b'l';
    pub const FILE_DESCRIPTOR: u8 = b'm';
    pub const FAULT_CODE: u8 = b'p';
    pub const RESPONSE_DATA: u8 = b'q';
    pub const FAULT_TEXT: u8 = b'r';
    pub const SERVICE_ID: u8 = b's';

    // Inside a context field
    pub const CONTEXT_KEY: u8 = b'k';
    pub const CONTEXT_VALUE: u8 = b'v';

    pub fn name(ty: u8) -> &'static str {
        match ty {
            REQUEST_PACKET => "requestPacket",
            RESPONSE_PACKET => "responsePacket",
            END_PACKET => "endPacket",
            CLIENT_ID => "clientID",
            REQUEST_ID => "requestID",
            SERVICE_KEY => "serviceKey",
            NO_WAIT => "noWait",
            NO_REMOTE => "noRemote",
            NO_RETRY => "noRetry",
            KEEP_AFFINITY => "keepAffinity",
            NEED_AFFINITY => "needAffinity",
            CONTEXT => "context",
            REQUEST_DATA => "requestData",
            TIMEOUT_MS => "timeoutMS",
            FILE_DESCRIPTOR => "fileDescriptor",
            FAULT_CODE => "faultCode",
            RESPONSE_DATA => "responseData",
            FAULT_TEXT => "faultText",
            SERVICE_ID => "serviceID",
            _ => "unknown",
        }
    }
}

// ── Errors ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetStringError {
    LeadingNotDigit,
    LengthTooLarge,
    InvalidType,
    BadTerminator,
    /// A complete slice ended inside a netstring
    Truncated,
    /// The inbound buffer would have to grow beyond its cap
    TooLarge,
}

impl fmt::Display for NetStringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetStringError::LeadingNotDigit => "leading netString character not a digit",
            NetStringError::LengthTooLarge => "netString length value greater than 999999999",
            NetStringError::InvalidType => "invalid netString type (not isprint())",
            NetStringError::BadTerminator => "incorrect netString terminator - comma or \\n expected",
            NetStringError::Truncated => "netString truncated",
            NetStringError::TooLarge => "response exceeds maximum size",
        })
    }
}

impl std::error::Error for NetStringError {}

// ── Header scanning ──

struct Header {
    ty: u8,
    len: usize,
    /// Offset of the payload relative to the scan start
    data_at: usize,
}

/// Scan `<length><type>` at the start of `bytes`.
///
/// `Ok(None)` means more bytes are needed before a verdict is possible.
fn scan_header(bytes: &[u8]) -> Result<Option<Header>, NetStringError> {
    let first = match bytes.first() {
        Some(b) => *b,
        None => return Ok(None),
    };
    if !first.is_ascii_digit() {
        return Err(NetStringError::LeadingNotDigit);
    }
    let mut len = usize::from(first - b'0');
    let mut ix = 1;
    loop {
        let b = match bytes.get(ix) {
            Some(b) => *b,
            None => return Ok(None),
        };
        if !b.is_ascii_digit() {
            break;
        }
        len = len * 10 + usize::from(b - b'0');
        if len > MAX_LENGTH {
            return Err(NetStringError::LengthTooLarge);
        }
        ix += 1;
    }
    let ty = bytes[ix];
    if !(0x20..0x7f).contains(&ty) {
        return Err(NetStringError::InvalidType);
    }
    Ok(Some(Header { ty, len, data_at: ix + 1 }))
}

#[inline]
fn is_terminator(b: u8) -> bool {
    b == b',' || b == b'\n'
}

// ── Writer ──

/// Builds a sequence of netstrings in an owned buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetStringWriter {
    buf: Vec<u8>,
}

impl NetStringWriter {
    pub fn new() -> Self {
        NetStringWriter { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        NetStringWriter { buf: Vec::with_capacity(capacity) }
    }

    /// Bytes a payload of `len` costs beyond itself (digits, type, terminator)
    pub fn overhead(len: usize) -> usize {
        let mut digits = 1;
        let mut n = len;
        while n >= 10 {
            n /= 10;
            digits += 1;
        }
        digits + 2
    }

    pub fn append(&mut self, ty: u8, data: &[u8]) -> &mut Self {
        self.append_raw_prefix(ty, data.len());
        self.buf.extend_from_slice(data);
        self.append_raw_terminator()
    }

    pub fn append_str(&mut self, ty: u8, text: &str) -> &mut Self {
        self.append(ty, text.as_bytes())
    }

    /// Decimal rendering of any integer
    pub fn append_int<T: fmt::Display>(&mut self, ty: u8, value: T) -> &mut Self {
        let mut digits = [0u8; 24];
        let mut cursor = std::io::Cursor::new(&mut digits[..]);
        // 24 bytes hold any 64-bit integer
        let _ = write!(cursor, "{}", value);
        let used = cursor.position() as usize;
        self.append(ty, &digits[..used])
    }

    /// Zero-length field whose presence is the information
    pub fn append_marker(&mut self, ty: u8) -> &mut Self {
        self.append(ty, &[])
    }

    /// Zero-length field terminated with `\n`
    pub fn append_marker_nl(&mut self, ty: u8) -> &mut Self {
        self.buf.extend_from_slice(&[b'0', ty, b'\n']);
        self
    }

    /// A field whose payload is carried in another buffer
    pub fn append_nested(&mut self, ty: u8, inner: &NetStringWriter) -> &mut Self {
        self.append(ty, inner.as_bytes())
    }

    /// `<len><type>` only; the payload follows elsewhere, then
    /// [`append_raw_terminator`](Self::append_raw_terminator)
    pub fn append_raw_prefix(&mut self, ty: u8, len: usize) -> &mut Self {
        let _ = write!(self.buf, "{}", len);
        self.buf.push(ty);
        self
    }

    pub fn append_raw_terminator(&mut self) -> &mut Self {
        self.buf.push(b',');
        self
    }

    pub fn append_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

// ── Slice parser ──

/// One parsed field borrowed from its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetString<'a> {
    pub ty: u8,
    pub data: &'a [u8],
    /// Payload offset within the parsed slice
    pub offset: usize,
}

/// Iterates the netstrings of a complete byte slice.
///
/// Stops after the first error.
#[derive(Debug, Clone)]
pub struct NetStringParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> NetStringParser<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        NetStringParser { bytes, pos: 0 }
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// First field of type `ty`, ignoring parse errors after it
    pub fn find(bytes: &'a [u8], ty: u8) -> Option<&'a [u8]> {
        NetStringParser::new(bytes)
            .map_while(Result::ok)
            .find(|ns| ns.ty == ty)
            .map(|ns| ns.data)
    }

    fn parse_next(&mut self) -> Result<NetString<'a>, NetStringError> {
        let rest = &self.bytes[self.pos..];
        let header = scan_header(rest)?.ok_or(NetStringError::Truncated)?;
        let end = header.data_at + header.len;
        let term = *rest.get(end).ok_or(NetStringError::Truncated)?;
        if !is_terminator(term) {
            return Err(NetStringError::BadTerminator);
        }
        let ns = NetString {
            ty: header.ty,
            data: &rest[header.data_at..end],
            offset: self.pos + header.data_at,
        };
        self.pos += end + 1;
        Ok(ns)
    }
}

impl<'a> Iterator for NetStringParser<'a> {
    type Item = Result<NetString<'a>, NetStringError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_eof() {
            return None;
        }
        let res = self.parse_next();
        if res.is_err() {
            self.pos = self.bytes.len();
        }
        Some(res)
    }
}

// ── Stream buffer ──

/// A field located inside a [`NetStringBuffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ty: u8,
    pub data: Range<usize>,
}

/// Grows at least this much, at most half the current size, per step
pub const MAX_GROWTH_STEP: usize = 16 * 1024;

/// Inbound bytes from one connection, parsed into frames in place.
///
/// Frames are addressed by range so the payload of a complete packet can be
/// handed out without copying once the buffer is frozen.
#[derive(Debug)]
pub struct NetStringBuffer {
    buf: Vec<u8>,
    filled: usize,
    parsed: usize,
    /// End offset of the frame currently being received, once its header is in
    pending_end: Option<usize>,
    max_size: usize,
}

impl NetStringBuffer {
    /// `max_size == 0` means no cap
    pub fn new(initial_size: usize, max_size: usize) -> Self {
        let initial = initial_size.max(64);
        let initial = if max_size > 0 { initial.min(max_size) } else { initial };
        NetStringBuffer {
            buf: vec![0; initial],
            filled: 0,
            parsed: 0,
            pending_end: None,
            max_size,
        }
    }

    /// Writable tail for the next read, growing the buffer when full
    pub fn read_space(&mut self) -> Result<&mut [u8], NetStringError> {
        if self.filled == self.buf.len() {
            self.grow()?;
        }
        Ok(&mut self.buf[self.filled..])
    }

    fn grow(&mut self) -> Result<(), NetStringError> {
        let size = self.buf.len();
        let needed = self.pending_end.map_or(size + 1, |end| end.max(size + 1));
        if self.max_size > 0 && needed > self.max_size {
            return Err(NetStringError::TooLarge);
        }
        let mut target = size + (size / 2).min(MAX_GROWTH_STEP);
        if self.max_size > 0 {
            target = target.min(self.max_size);
        }
        self.buf.resize(target.max(needed), 0);
        Ok(())
    }

    /// Record `n` bytes written into the slice from [`read_space`](Self::read_space)
    pub fn commit(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.buf.len());
    }

    pub fn bytes_read(&self) -> usize {
        self.filled
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, `Ok(None)` when more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<Frame>, NetStringError> {
        let rest = &self.buf[self.parsed..self.filled];
        let header = match scan_header(rest)? {
            Some(h) => h,
            None => return Ok(None),
        };
        let data_start = self.parsed + header.data_at;
        let data_end = data_start + header.len;
        self.pending_end = Some(data_end + 1);
        if data_end >= self.filled {
            return Ok(None);
        }
        if !is_terminator(self.buf[data_end]) {
            return Err(NetStringError::BadTerminator);
        }
        self.parsed = data_end + 1;
        self.pending_end = None;
        Ok(Some(Frame { ty: header.ty, data: data_start..data_end }))
    }

    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    /// Everything received so far
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// Unparsed bytes left after the last complete frame
    pub fn residual(&self) -> usize {
        self.filled - self.parsed
    }

    /// Hand the received bytes out, leaving an empty buffer of the same size
    pub fn take(&mut self) -> Vec<u8> {
        let size = self.buf.len();
        let mut taken = std::mem::replace(&mut self.buf, vec![0; size]);
        taken.truncate(self.filled);
        self.reset();
        taken
    }

    pub fn reset(&mut self) {
        self.filled = 0;
        self.parsed = 0;
        self.pending_end = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_format() {
        let mut w = NetStringWriter::new();
        w.append_marker(nt::REQUEST_PACKET)
            .append_int(nt::REQUEST_ID, 100u64)
            .append_str(nt::SERVICE_KEY, "a.b.1.r")
            .append_int(nt::FAULT_CODE, -19i32)
            .append_marker_nl(nt::END_PACKET);
        assert_eq!(w.as_bytes(), b"0Q,3b100,7ca.b.1.r,3p-19,0z\n");
    }

    #[test]
    fn test_raw_prefix_and_overhead() {
        let mut w = NetStringWriter::new();
        w.append_raw_prefix(nt::REQUEST_DATA, 5)
            .append_raw(b"hello")
            .append_raw_terminator();
        assert_eq!(w.as_bytes(), b"5khello,");
        assert_eq!(NetStringWriter::overhead(5), 3);
        assert_eq!(NetStringWriter::overhead(10), 4);
        assert_eq!(NetStringWriter::overhead(999_999_999), 11);
    }

    #[test]
    fn test_nested() {
        let mut ctx = NetStringWriter::new();
        ctx.append_str(nt::CONTEXT_KEY, "k1").append_str(nt::CONTEXT_VALUE, "v");
        let mut outer = NetStringWriter::new();
        outer.append_nested(nt::CONTEXT, &ctx);
        assert_eq!(outer.as_bytes(), b"9j2kk1,1vv,,");
        assert_eq!(NetStringParser::find(outer.as_bytes(), nt::CONTEXT), Some(&b"2kk1,1vv,"[..]));
    }

    #[test]
    fn test_parser_errors() {
        let cases: [(&[u8], NetStringError); 5] = [
            (b"x", NetStringError::LeadingNotDigit),
            (b"1234567890a", NetStringError::LengthTooLarge),
            (b"1\x01x,", NetStringError::InvalidType),
            (b"1ax;", NetStringError::BadTerminator),
            (b"5ahi,", NetStringError::Truncated),
        ];
        for (input, want) in cases {
            let mut p = NetStringParser::new(input);
            assert_eq!(p.next(), Some(Err(want)), "{:?}", input);
            assert_eq!(p.next(), None);
        }
        assert_eq!(
            NetStringError::BadTerminator.to_string(),
            "incorrect netString terminator - comma or \\n expected"
        );
    }

    #[test]
    fn test_parser_offsets() {
        let bytes = b"2ahi,0z\n";
        let fields: Vec<_> = NetStringParser::new(bytes).collect::<Result<_, _>>().unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0], NetString { ty: b'a', data: b"hi", offset: 2 });
        assert_eq!(fields[1].ty, nt::END_PACKET);
        assert!(fields[1].data.is_empty());
    }

    fn feed(buf: &mut NetStringBuffer, bytes: &[u8]) {
        let mut rest = bytes;
        while !rest.is_empty() {
            let space = buf.read_space().unwrap();
            let n = space.len().min(rest.len());
            space[..n].copy_from_slice(&rest[..n]);
            buf.commit(n);
            rest = &rest[n..];
        }
    }

    #[test]
    fn test_stream_byte_at_a_time() {
        let packet = b"0A,3b101,5qhello,0z\n";
        let mut buf = NetStringBuffer::new(64, 0);
        let mut frames = Vec::new();
        for b in packet.iter() {
            feed(&mut buf, std::slice::from_ref(b));
            while let Some(f) = buf.next_frame().unwrap() {
                frames.push(f);
            }
        }
        let types: Vec<u8> = frames.iter().map(|f| f.ty).collect();
        assert_eq!(types, b"Abqz");
        assert_eq!(buf.bytes(frames[2].data.clone()), b"hello");
        assert_eq!(buf.residual(), 0);
    }

    #[test]
    fn test_stream_growth_and_cap() {
        let mut payload = NetStringWriter::new();
        payload.append(nt::RESPONSE_DATA, &vec![b'x'; 300]);

        let mut grows = NetStringBuffer::new(64, 0);
        feed(&mut grows, payload.as_bytes());
        let frame = grows.next_frame().unwrap().unwrap();
        assert_eq!(frame.data.len(), 300);
        assert!(grows.capacity() >= payload.len());

        let mut capped = NetStringBuffer::new(64, 128);
        let mut rest = payload.as_bytes();
        let err = loop {
            match capped.read_space() {
                Ok(space) => {
                    let n = space.len().min(rest.len());
                    space[..n].copy_from_slice(&rest[..n]);
                    capped.commit(n);
                    rest = &rest[n..];
                    let _ = capped.next_frame();
                }
                Err(e) => break e,
            }
        };
        assert_eq!(err, NetStringError::TooLarge);
        assert_eq!(err.to_string(), "response exceeds maximum size");
    }

    #[test]
    fn test_take_resets() {
        let mut buf = NetStringBuffer::new(64, 0);
        feed(&mut buf, b"0z\n");
        assert!(buf.next_frame().unwrap().is_some());
        assert_eq!(buf.take(), b"0z\n".to_vec());
        assert_eq!(buf.bytes_read(), 0);
        assert!(buf.next_frame().unwrap().is_none());
    }
}
