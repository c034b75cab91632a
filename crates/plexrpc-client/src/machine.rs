//! Per-request exchange state machine
//!
//! ```text
//! Resolving -> Connecting -> Writing -> Reading -> Completed
//!     ^                         |          |
//!     +-------- Retrying <------+----------+   (transient failures)
//! ```
//!
//! Every transition runs on the dispatcher that owns the record. A method
//! returns a [`Step`]: wait for readiness on a descriptor, run `advance`
//! again, or done. Nothing here blocks.

use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use plexrpc_core::packet::RequestHeader;
use plexrpc_core::{
    kdebug_if, kwarn, Attributes, Fault, FaultCode, NetStringWriter, ServiceKey,
};
use plexrpc_lookup::LookupReader;

use crate::request::{RequestRecord, RequestState, ResponseData};
use crate::socket::{Conn, ConnectState};

/// Readiness a waiting request needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    pub(crate) fn poll_events(self) -> libc::c_short {
        match self {
            Interest::Read => libc::POLLIN,
            Interest::Write => libc::POLLOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Wait(Interest, RawFd),
    /// Progress possible without waiting
    Again,
    Done,
}

/// Unsent remainder of `parts` after the first `skip` bytes
fn unsent<'a>(parts: [&'a [u8]; 3], mut skip: usize) -> Vec<IoSlice<'a>> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        if skip >= part.len() {
            skip -= part.len();
            continue;
        }
        out.push(IoSlice::new(&part[skip..]));
        skip = 0;
    }
    out
}

impl RequestRecord {
    fn set_state(&mut self, state: RequestState) {
        kdebug_if!(
            self.debug,
            "request {} ({}): {} -> {}",
            self.request_id,
            self.service_key,
            self.state,
            state
        );
        self.state = state;
    }

    fn retry_allowed(&self) -> bool {
        !self.attributes.contains(Attributes::NO_RETRY)
            && !self.attributes.contains(Attributes::NEED_AFFINITY)
    }

    /// Run whatever the current state can do without an event
    pub(crate) fn advance(&mut self, lookup: Option<&mut LookupReader>) -> Step {
        match self.state {
            RequestState::Resolving | RequestState::Retrying => self.open(lookup),
            RequestState::Connecting => match &self.conn {
                Some(conn) => Step::Wait(Interest::Write, conn.as_raw_fd()),
                None => self.transient(Fault::new(FaultCode::ConnectFailed, "connection lost")),
            },
            RequestState::Writing => self.write(),
            RequestState::Reading => self.read(),
            RequestState::Idle | RequestState::Completed => Step::Done,
        }
    }

    pub(crate) fn on_writable(&mut self, lookup: Option<&mut LookupReader>) -> Step {
        match self.state {
            RequestState::Connecting => {
                let connected = match &self.conn {
                    Some(conn) => conn.finish_connect(),
                    None => Err(Fault::new(FaultCode::ConnectFailed, "connection lost")),
                };
                match connected {
                    Ok(()) => {
                        self.set_state(RequestState::Writing);
                        self.write()
                    }
                    Err(cause) => self.transient(cause),
                }
            }
            _ => self.advance(lookup),
        }
    }

    pub(crate) fn on_readable(&mut self, lookup: Option<&mut LookupReader>) -> Step {
        match self.state {
            RequestState::Reading => self.read(),
            _ => self.advance(lookup),
        }
    }

    /// The record's deadline passed. Blocking clients retry while attempts
    /// remain; the event facade always completes.
    pub(crate) fn on_expired(&mut self, allow_retry: bool) -> Step {
        let cause = Fault::new(
            FaultCode::ServiceTimeout,
            format!("service timeout after {} ms while {}", self.timeout.as_millis(), self.state),
        );
        if allow_retry && self.retry_allowed() && self.attempts < self.max_attempts {
            kdebug_if!(self.debug, "request {}: {}, retrying", self.request_id, cause.text());
            self.conn = None;
            self.deadline = None;
            self.set_state(RequestState::Retrying);
            return Step::Again;
        }
        self.finish(cause)
    }

    // ── Resolve and connect ──

    fn open(&mut self, lookup: Option<&mut LookupReader>) -> Step {
        self.set_state(RequestState::Resolving);
        let key = match ServiceKey::parse(&self.service_key) {
            Ok(key) => key,
            Err(e) => return self.finish(Fault::new(FaultCode::ServiceKeyBad, e.message())),
        };
        let Some(lookup) = lookup else {
            return self.finish(Fault::from_code(FaultCode::LookupButNoMap));
        };
        match lookup.find_service(&key.search_key()) {
            Ok(path) => self.connect_path = path,
            Err(fault) => return self.finish(fault),
        }
        if self.pre.is_empty() {
            self.assemble(&key);
        }

        self.attempts += 1;
        self.written = 0;
        self.inbound.reset();
        self.decoder.reset();

        match Conn::connect(&self.connect_path) {
            Ok((conn, ConnectState::Connected)) => {
                self.conn = Some(conn);
                self.set_state(RequestState::Writing);
                self.write()
            }
            Ok((conn, ConnectState::InProgress)) => {
                let fd = conn.as_raw_fd();
                self.conn = Some(conn);
                self.set_state(RequestState::Connecting);
                Step::Wait(Interest::Write, fd)
            }
            Err(cause) => self.transient(cause),
        }
    }

    fn assemble(&mut self, key: &ServiceKey) {
        let mut pre = NetStringWriter::with_capacity(128);
        let mut post = NetStringWriter::with_capacity(8);
        RequestHeader {
            request_id: self.request_id,
            client_name: &self.client_name,
            service_key: key.canonical(),
            timeout_ms: self.timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            attributes: self.attributes,
            context: self.context.encoded(),
            has_fd: self.passed_fd.is_some(),
            data_len: self.outbound.len(),
        }
        .assemble(&mut pre, &mut post);
        self.pre = pre.into_vec();
        self.post = post.into_vec();
    }

    // ── Write ──

    fn write(&mut self) -> Step {
        if self.pre.is_empty() {
            // Affinity exchanges skip resolution and assemble here
            match ServiceKey::parse(&self.service_key) {
                Ok(key) => self.assemble(&key),
                Err(e) => return self.finish(Fault::new(FaultCode::ServiceKeyBad, e.message())),
            }
            self.attempts += 1;
            self.written = 0;
            self.inbound.reset();
            self.decoder.reset();
        }

        let total = self.pre.len() + self.outbound.len() + self.post.len();
        while self.written < total {
            let Some(conn) = self.conn.as_ref() else {
                return self.transient(Fault::new(FaultCode::SocketWriteFailed, "no connection"));
            };
            let fd = conn.as_raw_fd();
            let pass_fd = match self.written {
                0 => self.passed_fd.as_ref().map(|fd| fd.as_raw_fd()),
                _ => None,
            };
            let sent = {
                let parts = [self.pre.as_slice(), &self.outbound[..], self.post.as_slice()];
                conn.send(&unsent(parts, self.written), pass_fd)
            };
            match sent {
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Wait(Interest::Write, fd),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return self.transient(Fault::from_io(FaultCode::SocketWriteFailed, "sendmsg", &e))
                }
            }
        }

        if self.attributes.contains(Attributes::NO_WAIT) {
            return self.finish(Fault::default());
        }
        self.set_state(RequestState::Reading);
        match &self.conn {
            Some(conn) => Step::Wait(Interest::Read, conn.as_raw_fd()),
            None => self.transient(Fault::new(FaultCode::SocketReadFailed, "no connection")),
        }
    }

    // ── Read ──

    fn read(&mut self) -> Step {
        loop {
            let Some(conn) = self.conn.as_ref() else {
                return self.transient(Fault::new(FaultCode::SocketReadFailed, "no connection"));
            };
            let fd = conn.as_raw_fd();
            let space = match self.inbound.read_space() {
                Ok(space) => space,
                Err(_) => {
                    return self.finish(Fault::new(
                        FaultCode::SocketReadFailed,
                        "response exceeds maximum size",
                    ))
                }
            };
            match conn.recv(space) {
                Ok(0) => {
                    let got = self.inbound.bytes_read();
                    if got == 0 {
                        return self.transient(Fault::new(
                            FaultCode::SocketReadFailed,
                            "EOF before response",
                        ));
                    }
                    return self.finish(Fault::new(
                        FaultCode::IncompleteResponse,
                        format!("EOF after {} bytes of response", got),
                    ));
                }
                Ok(n) => {
                    self.inbound.commit(n);
                    if let Some(step) = self.parse_frames() {
                        return step;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Wait(Interest::Read, fd),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let cause = Fault::from_io(FaultCode::SocketReadFailed, "recv", &e);
                    if self.inbound.bytes_read() == 0 {
                        return self.transient(cause);
                    }
                    return self.finish(cause);
                }
            }
        }
    }

    /// Feed complete frames to the decoder; `Some` once the exchange ends
    fn parse_frames(&mut self) -> Option<Step> {
        loop {
            match self.inbound.next_frame() {
                Ok(Some(frame)) => {
                    let data = self.inbound.bytes(frame.data.clone());
                    match self.decoder.add(frame.ty, data, frame.data) {
                        Ok(true) => return Some(self.accept_response()),
                        Ok(false) => {}
                        Err(text) => {
                            return Some(self.finish(Fault::new(
                                FaultCode::ResponsePacketFormatError,
                                text,
                            )))
                        }
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    return Some(self.finish(Fault::new(
                        FaultCode::ResponsePacketFormatError,
                        e.to_string(),
                    )))
                }
            }
        }
    }

    fn accept_response(&mut self) -> Step {
        let packet = self.decoder.take_packet();
        if packet.request_id != self.request_id || packet.client_name != self.client_name {
            kwarn!(
                "request {}: response routed for request {} of '{}'",
                self.request_id,
                packet.request_id,
                packet.client_name
            );
            return self.finish(Fault::new(
                FaultCode::SeriousInternalRoutingError,
                format!(
                    "response for request {} of '{}' arrived for request {} of '{}'",
                    packet.request_id, packet.client_name, self.request_id, self.client_name
                ),
            ));
        }

        let fault = match packet.fault_code {
            0 => Fault::default(),
            raw => match FaultCode::from_i32(raw) {
                Some(code) => Fault::new(code, packet.fault_text),
                None => Fault::new(
                    FaultCode::ResponsePacketFormatError,
                    format!("unknown fault code {} in response", raw),
                ),
            },
        };

        let bytes: Arc<[u8]> = Arc::from(self.inbound.take());
        self.response = ResponseData::new(bytes, packet.data);
        self.service_name = packet.service_name;
        self.finish(fault)
    }

    // ── Outcomes ──

    /// A failure that may succeed on a fresh connection
    fn transient(&mut self, cause: Fault) -> Step {
        self.conn = None;
        if !self.retry_allowed() {
            return self.finish(Fault::new(FaultCode::RetryNotAllowed, cause.text()));
        }
        if self.attempts >= self.max_attempts {
            return self.finish(Fault::new(
                FaultCode::ExceededRetryLimit,
                format!("{} after {} attempts", cause.text(), self.attempts),
            ));
        }
        kdebug_if!(self.debug, "request {}: {}, retrying", self.request_id, cause);
        self.deadline = None;
        self.set_state(RequestState::Retrying);
        Step::Again
    }

    pub(crate) fn finish(&mut self, fault: Fault) -> Step {
        if self.attributes.contains(Attributes::KEEP_AFFINITY) && !fault.is_fault() {
            self.affinity = self.conn.take();
        } else {
            self.conn = None;
            self.affinity = None;
        }
        if fault.is_fault() {
            kdebug_if!(self.debug, "request {} failed: {}", self.request_id, fault);
        }
        self.fault = fault;
        self.deadline = None;
        self.in_progress = false;
        self.slot = None;
        self.set_state(RequestState::Completed);
        Step::Done
    }
}
