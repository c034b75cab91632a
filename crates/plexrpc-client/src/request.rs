//! Requests as the caller sees them
//!
//! A [`ClientRequest`] is a cheap handle onto one shared [`RequestRecord`].
//! The caller fills it in, hands it to a client, and reads the outcome once
//! a wait reports it complete. While in flight the record is driven by the
//! dispatcher of the client it was added to; the dispatcher only keeps weak
//! references, so dropping every handle abandons the request.

use std::fmt;
use std::ops::{Deref, Range};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use plexrpc_core::constants::{FIRST_REQUEST_ID, MAX_REQUEST_ID};
use plexrpc_core::{
    Attributes, Context, Fault, FaultCode, FaultResult, NetStringBuffer, PacketDecoder, SpinLock,
};

use crate::config::ClientConfig;
use crate::dispatcher::SlotId;
use crate::socket::Conn;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(FIRST_REQUEST_ID);

/// Process-wide request ids, wrapping back to the first id
pub(crate) fn next_request_id() -> u64 {
    let prev = NEXT_REQUEST_ID.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
        Some(if id >= MAX_REQUEST_ID { FIRST_REQUEST_ID } else { id + 1 })
    });
    // fetch_update with an infallible closure never fails
    prev.unwrap_or(FIRST_REQUEST_ID)
}

// ── State ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestState {
    /// Not added to any client
    #[default]
    Idle,
    Resolving,
    Connecting,
    Writing,
    Reading,
    /// Scheduled for another attempt after a transient failure
    Retrying,
    Completed,
}

impl RequestState {
    pub fn name(self) -> &'static str {
        match self {
            RequestState::Idle => "idle",
            RequestState::Resolving => "resolving",
            RequestState::Connecting => "connecting",
            RequestState::Writing => "writing",
            RequestState::Reading => "reading",
            RequestState::Retrying => "retrying",
            RequestState::Completed => "completed",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Response view ──

/// Response payload: a shared view into the received packet
#[derive(Clone, Default)]
pub struct ResponseData {
    packet: Option<Arc<[u8]>>,
    range: Range<usize>,
}

impl ResponseData {
    pub(crate) fn new(packet: Arc<[u8]>, range: Range<usize>) -> Self {
        Self { packet: Some(packet), range }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.packet {
            Some(p) => &p[self.range.clone()],
            None => &[],
        }
    }

    /// The payload as text, if it is UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()).ok()
    }
}

impl Deref for ResponseData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for ResponseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseData({} bytes)", self.range.len())
    }
}

// ── Record ──

pub(crate) type RecordCell = SpinLock<RequestRecord>;

/// Everything about one request. Only the dispatcher that admitted it
/// touches the exchange fields while `in_progress` is set.
pub(crate) struct RequestRecord {
    // Filled by the caller
    pub(crate) request_data: Arc<[u8]>,
    pub(crate) attributes: Attributes,
    pub(crate) context: Context,
    pub(crate) client_handle: u64,
    pub(crate) passed_fd: Option<OwnedFd>,

    // Stamped on admission
    pub(crate) service_key: String,
    pub(crate) client_name: String,
    pub(crate) timeout: Duration,
    pub(crate) request_id: u64,
    pub(crate) max_attempts: u32,
    pub(crate) debug: bool,
    pub(crate) in_progress: bool,
    pub(crate) slot: Option<SlotId>,

    // Exchange
    pub(crate) state: RequestState,
    pub(crate) attempts: u32,
    pub(crate) conn: Option<Conn>,
    /// Connection kept by a successful keep-affinity exchange
    pub(crate) affinity: Option<Conn>,
    pub(crate) outbound: Arc<[u8]>,
    pub(crate) pre: Vec<u8>,
    pub(crate) post: Vec<u8>,
    pub(crate) written: usize,
    pub(crate) inbound: NetStringBuffer,
    pub(crate) decoder: PacketDecoder,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timer_seq: u64,
    pub(crate) connect_path: String,

    // Outcome
    pub(crate) fault: Fault,
    pub(crate) response: ResponseData,
    pub(crate) service_name: String,
}

impl RequestRecord {
    fn new() -> Self {
        Self {
            request_data: Arc::from(&[][..]),
            attributes: Attributes::NONE,
            context: Context::new(),
            client_handle: 0,
            passed_fd: None,
            service_key: String::new(),
            client_name: String::new(),
            timeout: Duration::ZERO,
            request_id: 0,
            max_attempts: 1,
            debug: false,
            in_progress: false,
            slot: None,
            state: RequestState::Idle,
            attempts: 0,
            conn: None,
            affinity: None,
            outbound: Arc::from(&[][..]),
            pre: Vec::new(),
            post: Vec::new(),
            written: 0,
            inbound: NetStringBuffer::new(0, 0),
            decoder: PacketDecoder::for_responses(),
            deadline: None,
            timer_seq: 0,
            connect_path: String::new(),
            fault: Fault::default(),
            response: ResponseData::default(),
            service_name: String::new(),
        }
    }

    /// Admission checks and stamping shared by both client facades.
    ///
    /// On success the record is in progress and ready for its first
    /// dispatcher pass; on failure an attribute fault is also left on the
    /// record, while a double add leaves it untouched.
    pub(crate) fn admit(
        &mut self,
        service_key: &str,
        client_name: &str,
        timeout: Duration,
        config: &ClientConfig,
    ) -> FaultResult<()> {
        if self.in_progress {
            return Err(Fault::new(
                FaultCode::RequestAlreadyAdded,
                format!("request {} is already in progress", self.request_id),
            ));
        }
        if let Err(fault) = self.attributes.check_legal(self.affinity.is_some()) {
            self.fault = fault.clone();
            return Err(fault);
        }

        self.service_key = service_key.to_string();
        self.client_name = client_name.to_string();
        self.timeout = timeout;
        self.request_id = next_request_id();
        self.max_attempts = config.max_attempts;
        self.debug = config.debug;

        self.attempts = 0;
        self.fault.clear();
        self.response = ResponseData::default();
        self.service_name.clear();
        self.connect_path.clear();
        self.outbound = Arc::clone(&self.request_data);
        self.pre.clear();
        self.post.clear();
        self.written = 0;
        self.inbound = NetStringBuffer::new(config.inbound_buffer_size, config.max_response_size);
        self.decoder.reset();
        self.deadline = None;

        if self.attributes.contains(Attributes::NEED_AFFINITY) {
            self.conn = self.affinity.take();
            self.state = RequestState::Writing;
        } else {
            self.affinity = None;
            self.conn = None;
            self.state = RequestState::Resolving;
        }
        self.in_progress = true;
        Ok(())
    }

    /// Drop out of a dispatcher without completing: connection closed, no fault
    pub(crate) fn abandon(&mut self) {
        self.conn = None;
        self.in_progress = false;
        self.slot = None;
        self.deadline = None;
        self.state = RequestState::Idle;
        self.inbound.reset();
        self.decoder.reset();
    }
}

// ── Handle ──

/// A request and, once complete, its response.
///
/// Clones share the same request.
#[derive(Clone)]
pub struct ClientRequest {
    inner: Arc<RecordCell>,
}

impl Default for ClientRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRequest {
    pub fn new() -> Self {
        Self { inner: Arc::new(SpinLock::new(RequestRecord::new())) }
    }

    pub(crate) fn from_cell(inner: Arc<RecordCell>) -> Self {
        Self { inner }
    }

    pub(crate) fn cell(&self) -> &Arc<RecordCell> {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<RecordCell> {
        Arc::downgrade(&self.inner)
    }

    /// True if both handles refer to the same request
    pub fn same_request(&self, other: &ClientRequest) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Return to the freshly constructed state, closing any kept connection
    /// and any file descriptor still owned by the request.
    pub fn reset(&self) -> FaultResult<()> {
        let mut rec = self.inner.lock();
        if rec.in_progress {
            return Err(Fault::from_code(FaultCode::RequestInProgress));
        }
        *rec = RequestRecord::new();
        Ok(())
    }

    /// Payload for the next add; an in-flight exchange keeps what it started with
    pub fn set_request_data(&self, data: impl Into<Arc<[u8]>>) {
        self.inner.lock().request_data = data.into();
    }

    pub fn request_data(&self) -> Arc<[u8]> {
        Arc::clone(&self.inner.lock().request_data)
    }

    pub fn set_attribute(&self, attr: Attributes) {
        self.inner.lock().attributes.insert(attr);
    }

    pub fn clear_attribute(&self, attr: Attributes) {
        self.inner.lock().attributes.remove(attr);
    }

    pub fn attribute(&self, attr: Attributes) -> bool {
        self.inner.lock().attributes.contains(attr)
    }

    pub fn attributes(&self) -> Attributes {
        self.inner.lock().attributes
    }

    /// Add a context pair sent with the request. Keys in the reserved
    /// namespace are refused.
    pub fn set_context(&self, key: &str, value: &str) -> FaultResult<()> {
        self.inner.lock().context.set(key, value)
    }

    pub fn context(&self, key: &str) -> FaultResult<Option<String>> {
        let rec = self.inner.lock();
        let value = rec.context.get(key)?;
        Ok(value.map(str::to_string))
    }

    pub fn set_client_handle(&self, handle: u64) {
        self.inner.lock().client_handle = handle;
    }

    pub fn client_handle(&self) -> u64 {
        self.inner.lock().client_handle
    }

    /// Pass `fd` to the service with the request. The request owns it until
    /// [`take_file_descriptor`](Self::take_file_descriptor) hands it back.
    pub fn set_file_descriptor(&self, fd: OwnedFd) {
        self.inner.lock().passed_fd = Some(fd);
    }

    pub fn take_file_descriptor(&self) -> Option<OwnedFd> {
        self.inner.lock().passed_fd.take()
    }

    pub fn has_file_descriptor(&self) -> bool {
        self.inner.lock().passed_fd.is_some()
    }

    pub fn in_progress(&self) -> bool {
        self.inner.lock().in_progress
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    pub fn has_fault(&self) -> bool {
        self.inner.lock().fault.is_fault()
    }

    pub fn fault(&self) -> Fault {
        self.inner.lock().fault.clone()
    }

    pub fn fault_code(&self) -> FaultCode {
        self.inner.lock().fault.code()
    }

    pub fn fault_text(&self) -> String {
        self.inner.lock().fault.text().to_string()
    }

    /// Response payload; refused while the exchange is still running
    pub fn response_data(&self) -> FaultResult<ResponseData> {
        let rec = self.inner.lock();
        if rec.in_progress {
            return Err(Fault::from_code(FaultCode::ResponseInProgress));
        }
        Ok(rec.response.clone())
    }

    /// Name the answering service reported
    pub fn service_name(&self) -> String {
        self.inner.lock().service_name.clone()
    }

    pub fn client_name(&self) -> String {
        self.inner.lock().client_name.clone()
    }

    pub fn request_id(&self) -> u64 {
        self.inner.lock().request_id
    }

    /// Connection attempts made by the latest exchange
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    /// True while a connection from a keep-affinity exchange is held
    pub fn has_affinity(&self) -> bool {
        self.inner.lock().affinity.is_some()
    }
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(rec) => f
                .debug_struct("ClientRequest")
                .field("request_id", &rec.request_id)
                .field("state", &rec.state)
                .field("attributes", &rec.attributes)
                .field("fault", &rec.fault)
                .field("fd", &rec.passed_fd.as_ref().map(|fd| fd.as_raw_fd()))
                .finish(),
            None => f.write_str("ClientRequest(<locked>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::default()
    }

    #[test]
    fn test_request_ids_increase() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a || b == FIRST_REQUEST_ID);
        assert!(a >= FIRST_REQUEST_ID && a <= MAX_REQUEST_ID);
    }

    #[test]
    fn test_double_admit_leaves_state() {
        let r = ClientRequest::new();
        r.set_request_data(&b"ping"[..]);
        let mut rec = r.cell().lock();
        rec.admit("echo.ping.1.r", "t:1", Duration::from_secs(1), &config()).unwrap();
        let id = rec.request_id;

        let err = rec.admit("other.fn.1.r", "t:1", Duration::from_secs(9), &config()).unwrap_err();
        assert_eq!(err.code(), FaultCode::RequestAlreadyAdded);
        assert_eq!(rec.request_id, id);
        assert_eq!(rec.service_key, "echo.ping.1.r");
        assert_eq!(rec.timeout, Duration::from_secs(1));
        assert!(!rec.fault.is_fault());
    }

    #[test]
    fn test_attribute_faults_land_on_record() {
        let r = ClientRequest::new();
        r.set_attribute(Attributes::KEEP_AFFINITY);
        let err = r.cell().lock().admit("a.b.1.r", "", Duration::from_secs(1), &config()).unwrap_err();
        assert_eq!(err.code(), FaultCode::NeedNoRetry);
        assert_eq!(r.fault_code(), FaultCode::NeedNoRetry);
        assert!(!r.in_progress());

        let r = ClientRequest::new();
        r.set_attribute(Attributes::NEED_AFFINITY);
        let err = r.cell().lock().admit("a.b.1.r", "", Duration::from_secs(1), &config()).unwrap_err();
        assert_eq!(err.code(), FaultCode::NoAffinity);
        assert!(r.has_fault());
    }

    #[test]
    fn test_reset_refused_in_progress() {
        let r = ClientRequest::new();
        r.set_client_handle(42);
        r.cell().lock().admit("a.b.1.r", "", Duration::from_secs(1), &config()).unwrap();
        assert_eq!(r.reset().unwrap_err().code(), FaultCode::RequestInProgress);
        assert_eq!(
            r.response_data().unwrap_err().code(),
            FaultCode::ResponseInProgress
        );

        r.cell().lock().abandon();
        r.reset().unwrap();
        assert_eq!(r.client_handle(), 0);
        assert_eq!(r.state(), RequestState::Idle);
    }

    #[test]
    fn test_context_reserved_prefix() {
        let r = ClientRequest::new();
        r.set_context("color", "blue").unwrap();
        assert_eq!(r.context("color").unwrap().as_deref(), Some("blue"));
        assert_eq!(
            r.set_context("plexrpc.hops", "1").unwrap_err().code(),
            FaultCode::ContextReservedNamespace
        );
    }

    #[test]
    fn test_file_descriptor_ownership() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let r = ClientRequest::new();
        r.set_file_descriptor(OwnedFd::from(a));
        assert!(r.has_file_descriptor());
        let fd = r.take_file_descriptor().unwrap();
        assert!(!r.has_file_descriptor());
        drop(fd);
    }

    #[test]
    fn test_response_view() {
        let packet: Arc<[u8]> = Arc::from(&b"xxhello,yy"[..]);
        let data = ResponseData::new(packet, 2..7);
        assert_eq!(&*data, b"hello");
        assert_eq!(data.as_str(), Some("hello"));
        assert!(ResponseData::default().is_empty());
    }
}
