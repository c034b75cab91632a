//! Event-driven client
//!
//! For callers with their own event loop. The client never waits: it says
//! which descriptor each request needs and for how long, and the caller
//! reports readiness or timeouts back.
//!
//! ```text
//! loop {
//!     while let Some(want) = client.get_next_event_wanted(Instant::now(), None) {
//!         register want.fd for want.interest with want.timeout
//!     }
//!     on readiness   -> send_can_read_event / send_can_write_event
//!     on expiry      -> send_timeout_event(fd, false)
//!     while let Some(done) = client.get_completed_request() { ... }
//! }
//! ```
//!
//! Every wanted event handed out must come back through one of the
//! `send_*` calls; until then the request is parked.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

use plexrpc_core::{kdebug, kwarn, Fault, FaultCode, FaultResult};
use plexrpc_lookup::{resolve_map_path, LookupReader};

use crate::config::{ClientConfig, ConfigError};
use crate::dispatcher::{Dispatcher, Drive, Event, OwnerId, SlotId};
use crate::machine::Interest;
use crate::request::ClientRequest;

/// One readiness the caller should wait for
#[derive(Debug, Clone)]
pub struct EventWanted {
    pub interest: Interest,
    pub fd: RawFd,
    /// Time left before the request times out
    pub timeout: Duration,
    pub request: ClientRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CanRead,
    CanWrite,
    Timeout,
}

/// An event that does not match any parked request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    /// No parked request on this descriptor
    UnknownFd { fd: RawFd, event: EventKind },
    /// The request parked under this descriptor is no longer using it
    FdMismatch { fd: RawFd, event: EventKind },
    /// The request waits for the other direction
    WrongDirection { fd: RawFd, event: EventKind },
}

impl EventError {
    /// Small negative code per variant: -1, -2, -3
    pub fn code(&self) -> i32 {
        match self {
            EventError::UnknownFd { .. } => -1,
            EventError::FdMismatch { .. } => -2,
            EventError::WrongDirection { .. } => -3,
        }
    }

    pub fn fault_code(&self) -> FaultCode {
        match self {
            EventError::UnknownFd { event: EventKind::CanWrite, .. }
            | EventError::FdMismatch { event: EventKind::CanWrite, .. } => FaultCode::WriteEventForWrongFd,
            EventError::UnknownFd { .. } | EventError::FdMismatch { .. } => FaultCode::ReadEventForWrongFd,
            EventError::WrongDirection { event: EventKind::CanWrite, .. } => FaultCode::WriteEventWrongState,
            EventError::WrongDirection { .. } => FaultCode::ReadEventWrongState,
        }
    }
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::UnknownFd { fd, event } => {
                write!(f, "{:?} event for fd {} with no request waiting", event, fd)
            }
            EventError::FdMismatch { fd, event } => {
                write!(f, "{:?} event for fd {} which its request no longer uses", event, fd)
            }
            EventError::WrongDirection { fd, event } => {
                write!(f, "{:?} event for fd {} waiting in the other direction", event, fd)
            }
        }
    }
}

impl std::error::Error for EventError {}

pub struct EventClient {
    owner: OwnerId,
    name: String,
    config: ClientConfig,
    dispatcher: Dispatcher,
    initialized: bool,
    /// Requests ready to be progressed, front first
    pending: VecDeque<SlotId>,
    /// Requests parked with the caller
    waiting: HashMap<RawFd, (SlotId, Interest)>,
}

impl EventClient {
    pub fn new(name: &str) -> Self {
        let config = ClientConfig::from_env();
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                kwarn!("plexrpc: ignoring client environment: {}", e);
                ClientConfig::default()
            }
        };
        Self::build(name, config)
    }

    pub fn with_config(name: &str, config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(name, config))
    }

    fn build(name: &str, config: ClientConfig) -> Self {
        let owner = OwnerId::next();
        let mut dispatcher = Dispatcher::new(false);
        dispatcher.attach_owner(owner);
        Self {
            owner,
            name: format!("{}:{}", name, std::process::id()),
            config,
            dispatcher,
            initialized: false,
            pending: VecDeque::new(),
            waiting: HashMap::new(),
        }
    }

    pub fn initialize(&mut self, lookup_map: Option<&Path>) -> FaultResult<()> {
        if self.initialized {
            return Err(Fault::from_code(FaultCode::AlreadyInitialized));
        }
        let path = resolve_map_path(lookup_map.or(self.config.lookup_map_path.as_deref()));
        let reader = LookupReader::open(&path)?;
        self.dispatcher.set_lookup(self.owner, reader);
        self.initialized = true;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_debug(&mut self, enable: bool) {
        self.config.debug = enable;
    }

    /// Requests added and not yet complete, parked ones included
    pub fn pending(&self) -> usize {
        self.dispatcher.todo(self.owner)
    }

    /// Queue `request`; its clock starts when its first event is handed out
    pub fn add_request(
        &mut self,
        service_key: &str,
        request: &ClientRequest,
        timeout: Duration,
    ) -> FaultResult<()> {
        if !self.initialized {
            return Err(Fault::from_code(FaultCode::NotInitialized));
        }
        request
            .cell()
            .lock()
            .admit(service_key, &self.name, timeout, &self.config)?;
        let id = self.dispatcher.add(self.owner, request);
        self.pending.push_back(id);
        Ok(())
    }

    /// Progress queued requests and return the next readiness one of them
    /// needs. With `filter`, only that request's event is returned, but every
    /// queued request is still progressed.
    pub fn get_next_event_wanted(
        &mut self,
        now: Instant,
        filter: Option<&ClientRequest>,
    ) -> Option<EventWanted> {
        let mut ix = 0;
        while ix < self.pending.len() {
            let id = self.pending[ix];
            let drive = match self.dispatcher.want(id) {
                Some((interest, fd)) => Drive::Waiting(interest, fd),
                None => self.dispatcher.drive(id, Event::Advance),
            };
            let (interest, fd) = match drive {
                Drive::Waiting(interest, fd) => (interest, fd),
                Drive::Completed | Drive::Gone => {
                    self.pending.remove(ix);
                    continue;
                }
                Drive::Unchanged => {
                    ix += 1;
                    continue;
                }
            };

            let Some(cell) = self.dispatcher.record(id) else {
                self.pending.remove(ix);
                continue;
            };
            let request = ClientRequest::from_cell(cell);
            if filter.is_some_and(|f| !f.same_request(&request)) {
                ix += 1;
                continue;
            }
            self.pending.remove(ix);

            let remaining = {
                let mut rec = request.cell().lock();
                let timeout = rec.timeout;
                let deadline = *rec.deadline.get_or_insert(now + timeout);
                deadline.saturating_duration_since(now)
            };
            if remaining.is_zero() {
                kdebug!("event client {}: request {} timed out", self.name, request.request_id());
                self.dispatcher.drive(
                    id,
                    Event::Fail(Fault::new(FaultCode::ServiceTimeout, "service timeout")),
                );
                continue;
            }

            self.waiting.insert(fd, (id, interest));
            return Some(EventWanted { interest, fd, timeout: remaining, request });
        }
        None
    }

    fn parked(&self, fd: RawFd, event: EventKind) -> Result<SlotId, EventError> {
        let &(id, _) = self.waiting.get(&fd).ok_or(EventError::UnknownFd { fd, event })?;
        let live_fd = self.dispatcher.record(id).and_then(|cell| {
            let rec = cell.lock();
            rec.conn.as_ref().map(|c| c.as_raw_fd())
        });
        if live_fd != Some(fd) {
            return Err(EventError::FdMismatch { fd, event });
        }
        Ok(id)
    }

    fn send_ready(&mut self, fd: RawFd, event: EventKind, wanted: Interest) -> Result<bool, EventError> {
        let id = self.parked(fd, event)?;
        if self.waiting.get(&fd).map(|w| w.1) != Some(wanted) {
            return Err(EventError::WrongDirection { fd, event });
        }
        self.waiting.remove(&fd);
        let drive = match wanted {
            Interest::Read => self.dispatcher.drive(id, Event::Readable),
            Interest::Write => self.dispatcher.drive(id, Event::Writable),
        };
        match drive {
            Drive::Completed | Drive::Gone => Ok(true),
            Drive::Waiting(..) | Drive::Unchanged => {
                self.pending.push_front(id);
                Ok(false)
            }
        }
    }

    /// `fd` is readable. `Ok(true)` if its request completed.
    pub fn send_can_read_event(&mut self, fd: RawFd) -> Result<bool, EventError> {
        self.send_ready(fd, EventKind::CanRead, Interest::Read)
    }

    /// `fd` is writable. `Ok(true)` if its request completed.
    pub fn send_can_write_event(&mut self, fd: RawFd) -> Result<bool, EventError> {
        self.send_ready(fd, EventKind::CanWrite, Interest::Write)
    }

    /// The caller's wait on `fd` timed out. With `abort` the request fails
    /// now; otherwise it is requeued and the next
    /// [`get_next_event_wanted`](Self::get_next_event_wanted) decides.
    pub fn send_timeout_event(&mut self, fd: RawFd, abort: bool) -> Result<bool, EventError> {
        let id = self.parked(fd, EventKind::Timeout)?;
        self.waiting.remove(&fd);
        if abort {
            self.dispatcher.drive(
                id,
                Event::Fail(Fault::new(FaultCode::ServiceTimeout, "Event forced service timeout")),
            );
            return Ok(true);
        }
        self.pending.push_front(id);
        Ok(false)
    }

    /// Oldest completed request, if any
    pub fn get_completed_request(&mut self) -> Option<ClientRequest> {
        self.dispatcher.pop_completed(self.owner)
    }
}

impl Drop for EventClient {
    fn drop(&mut self) {
        self.dispatcher.detach_owner(self.owner);
    }
}

impl fmt::Debug for EventClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventClient")
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .field("waiting", &self.waiting.len())
            .finish()
    }
}
