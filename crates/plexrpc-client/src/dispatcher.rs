//! Per-thread request dispatcher
//!
//! One dispatcher drives every in-flight request of every client attached
//! to a thread. Requests live in slots; each slot remembers the readiness
//! its request is waiting for, and `run` funnels all of them through a
//! single poll until the caller's wait condition holds.
//!
//! Slots hold weak references. A request whose last handle is dropped is
//! pruned on the next pass and counts as finished for its owner.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use plexrpc_core::{kdebug, Fault, FaultCode, FaultResult, Poller, SystemPoller};
use plexrpc_lookup::LookupReader;

use crate::condition::WaitCondition;
use crate::machine::{Interest, Step};
use crate::request::{ClientRequest, RecordCell, RequestState};
use crate::timer::{poll_timeout_ms, DeadlineHeap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u64);

/// Identity of one client within its dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(pub u64);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

impl OwnerId {
    pub(crate) fn next() -> Self {
        OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

/// What happened to a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Advance,
    Readable,
    Writable,
    /// The deadline armed with this sequence number passed
    Expired(u64),
    /// Complete now with this fault
    Fail(Fault),
}

/// Where a slot ended up after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drive {
    Waiting(Interest, RawFd),
    Completed,
    /// No such slot, or its request was dropped
    Gone,
    /// Stale event, nothing done
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Satisfied,
    /// The budget ran out with the condition still open
    Blocked,
}

struct Slot {
    owner: OwnerId,
    record: Weak<RecordCell>,
    want: Option<(Interest, RawFd)>,
}

#[derive(Default)]
pub(crate) struct OwnerState {
    lookup: Option<LookupReader>,
    todo: usize,
    completed: VecDeque<Weak<RecordCell>>,
}

pub(crate) struct Dispatcher {
    owners: HashMap<OwnerId, OwnerState>,
    slots: BTreeMap<SlotId, Slot>,
    next_slot: u64,
    deadlines: DeadlineHeap,
    /// The event facade keeps its own clocks
    arm_timers: bool,
    poller: Option<Arc<dyn Poller>>,
    pollfds: Vec<libc::pollfd>,
    polled: Vec<SlotId>,
}

impl Dispatcher {
    pub(crate) fn new(arm_timers: bool) -> Self {
        Self {
            owners: HashMap::new(),
            slots: BTreeMap::new(),
            next_slot: 1,
            deadlines: DeadlineHeap::new(),
            arm_timers,
            poller: None,
            pollfds: Vec::new(),
            polled: Vec::new(),
        }
    }

    // ── Owners ──

    pub(crate) fn attach_owner(&mut self, owner: OwnerId) {
        self.owners.entry(owner).or_default();
    }

    /// Force-remove the owner's requests and forget it
    pub(crate) fn detach_owner(&mut self, owner: OwnerId) {
        self.reset_owner(owner);
        self.owners.remove(&owner);
    }

    /// Force-remove the owner's requests: connections closed, no fault,
    /// nothing left to retrieve
    pub(crate) fn reset_owner(&mut self, owner: OwnerId) {
        let ids: Vec<SlotId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.owner == owner)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(slot) = self.slots.remove(id) {
                if let Some(cell) = slot.record.upgrade() {
                    cell.lock().abandon();
                }
            }
        }
        if !ids.is_empty() {
            kdebug!("dispatcher: dropped {} in-flight requests of owner {}", ids.len(), owner.0);
        }
        if let Some(state) = self.owners.get_mut(&owner) {
            state.todo = 0;
            state.completed.clear();
        }
    }

    pub(crate) fn set_lookup(&mut self, owner: OwnerId, reader: LookupReader) {
        self.owners.entry(owner).or_default().lookup = Some(reader);
    }

    pub(crate) fn set_poller(&mut self, poller: Option<Arc<dyn Poller>>) -> Option<Arc<dyn Poller>> {
        std::mem::replace(&mut self.poller, poller)
    }

    pub(crate) fn owner_count(&self) -> usize {
        self.owners.len()
    }

    // ── Requests ──

    /// Register an admitted request for `owner`
    pub(crate) fn add(&mut self, owner: OwnerId, request: &ClientRequest) -> SlotId {
        let id = SlotId(self.next_slot);
        self.next_slot += 1;
        request.cell().lock().slot = Some(id);

        let weak = request.downgrade();
        let state = self.owners.entry(owner).or_default();
        state.completed.retain(|w| !w.ptr_eq(&weak));
        state.todo += 1;
        self.slots.insert(id, Slot { owner, record: weak, want: None });
        id
    }

    /// Outstanding requests of `owner`
    pub(crate) fn todo(&self, owner: OwnerId) -> usize {
        self.owners.get(&owner).map_or(0, |s| s.todo)
    }

    pub(crate) fn completed_len(&self, owner: OwnerId) -> usize {
        self.owners
            .get(&owner)
            .map_or(0, |s| s.completed.iter().filter(|w| w.strong_count() > 0).count())
    }

    /// Oldest completed request still held by its caller
    pub(crate) fn pop_completed(&mut self, owner: OwnerId) -> Option<ClientRequest> {
        let state = self.owners.get_mut(&owner)?;
        while let Some(weak) = state.completed.pop_front() {
            if let Some(cell) = weak.upgrade() {
                return Some(ClientRequest::from_cell(cell));
            }
        }
        None
    }

    /// Empty the completed queue, returning how many were still held
    pub(crate) fn drain_completed(&mut self, owner: OwnerId) -> usize {
        match self.owners.get_mut(&owner) {
            Some(state) => state.completed.drain(..).filter(|w| w.strong_count() > 0).count(),
            None => 0,
        }
    }

    /// Drop `request` from the completed queue; true if it was there
    pub(crate) fn take_completed(&mut self, owner: OwnerId, request: &ClientRequest) -> bool {
        let Some(state) = self.owners.get_mut(&owner) else {
            return false;
        };
        let before = state.completed.len();
        let weak = request.downgrade();
        state.completed.retain(|w| !w.ptr_eq(&weak));
        state.completed.len() != before
    }

    /// True if `request` is in flight or completed under `owner`
    pub(crate) fn tracks(&self, owner: OwnerId, request: &ClientRequest) -> bool {
        let weak = request.downgrade();
        let in_flight = self
            .slots
            .values()
            .any(|slot| slot.owner == owner && slot.record.ptr_eq(&weak));
        in_flight
            || self
                .owners
                .get(&owner)
                .is_some_and(|s| s.completed.iter().any(|w| w.ptr_eq(&weak)))
    }

    /// True once every in-flight request of `owner` has been fully sent
    pub(crate) fn all_sent(&self, owner: OwnerId) -> bool {
        self.slots
            .values()
            .filter(|slot| slot.owner == owner)
            .all(|slot| match slot.record.upgrade() {
                Some(cell) => {
                    let rec = cell.lock();
                    rec.state == RequestState::Reading
                }
                None => true,
            })
    }

    pub(crate) fn record(&self, id: SlotId) -> Option<Arc<RecordCell>> {
        self.slots.get(&id)?.record.upgrade()
    }

    pub(crate) fn want(&self, id: SlotId) -> Option<(Interest, RawFd)> {
        self.slots.get(&id)?.want
    }

    // ── Driving ──

    /// Feed one event to a slot and follow the request until it waits or ends
    pub(crate) fn drive(&mut self, id: SlotId, event: Event) -> Drive {
        let Some(slot) = self.slots.get(&id) else {
            return Drive::Gone;
        };
        let owner = slot.owner;
        let Some(cell) = slot.record.upgrade() else {
            self.drop_slot(id);
            return Drive::Gone;
        };
        let mut rec = cell.lock();

        if let Event::Expired(seq) = event {
            if rec.timer_seq != seq || rec.deadline.is_none() {
                return Drive::Unchanged;
            }
        }
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.want = None;
        }

        let mut lookup = self.owners.get_mut(&owner).and_then(|s| s.lookup.as_mut());
        let mut step = match event {
            Event::Advance => rec.advance(lookup.as_deref_mut()),
            Event::Readable => rec.on_readable(lookup.as_deref_mut()),
            Event::Writable => rec.on_writable(lookup.as_deref_mut()),
            Event::Expired(_) => rec.on_expired(self.arm_timers),
            Event::Fail(fault) => rec.finish(fault),
        };

        loop {
            match step {
                Step::Again => step = rec.advance(lookup.as_deref_mut()),
                Step::Wait(interest, fd) => {
                    if self.arm_timers && rec.deadline.is_none() {
                        let deadline = Instant::now() + rec.timeout;
                        rec.deadline = Some(deadline);
                        rec.timer_seq = self.deadlines.arm(id, deadline);
                    }
                    if let Some(slot) = self.slots.get_mut(&id) {
                        slot.want = Some((interest, fd));
                    }
                    return Drive::Waiting(interest, fd);
                }
                Step::Done => {
                    drop(rec);
                    self.complete(id, owner, &cell);
                    return Drive::Completed;
                }
            }
        }
    }

    fn complete(&mut self, id: SlotId, owner: OwnerId, cell: &Arc<RecordCell>) {
        self.slots.remove(&id);
        if let Some(state) = self.owners.get_mut(&owner) {
            state.todo = state.todo.saturating_sub(1);
            state.completed.push_back(Arc::downgrade(cell));
        }
    }

    /// Forget a slot whose request was dropped by its caller
    fn drop_slot(&mut self, id: SlotId) {
        if let Some(slot) = self.slots.remove(&id) {
            if let Some(state) = self.owners.get_mut(&slot.owner) {
                state.todo = state.todo.saturating_sub(1);
            }
        }
    }

    fn prune(&mut self) {
        let dead: Vec<SlotId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.record.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.drop_slot(id);
        }
        if self.deadlines.len() > 2 * self.slots.len() + 16 {
            let slots = &self.slots;
            self.deadlines.retain(|e| slots.contains_key(&e.slot));
        }
    }

    fn expire(&mut self, now: Instant) {
        for entry in self.deadlines.pop_expired(now) {
            self.drive(entry.slot, Event::Expired(entry.seq));
        }
    }

    /// Advance every slot not waiting on readiness
    fn advance_idle(&mut self) {
        let idle: Vec<SlotId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.want.is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            self.drive(id, Event::Advance);
        }
    }

    fn build_pollfds(&mut self) {
        self.pollfds.clear();
        self.polled.clear();
        for (id, slot) in &self.slots {
            if let Some((interest, fd)) = slot.want {
                self.pollfds.push(libc::pollfd { fd, events: interest.poll_events(), revents: 0 });
                self.polled.push(*id);
            }
        }
    }

    fn poll(&mut self, timeout_ms: i32) -> FaultResult<usize> {
        let poller = self.poller.clone();
        loop {
            let rc = match &poller {
                Some(p) => p.poll(&mut self.pollfds, timeout_ms),
                None => SystemPoller.poll(&mut self.pollfds, timeout_ms),
            };
            match rc {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fault::from_io(FaultCode::SeriousInternalOsError, "poll", &e)),
            }
        }
    }

    fn dispatch_ready(&mut self) {
        let ready: Vec<(SlotId, Interest)> = self
            .pollfds
            .iter()
            .zip(&self.polled)
            .filter(|(pfd, _)| pfd.revents != 0)
            .filter_map(|(_, id)| Some((*id, self.slots.get(id)?.want?.0)))
            .collect();
        for (id, interest) in ready {
            let event = match interest {
                Interest::Read => Event::Readable,
                Interest::Write => Event::Writable,
            };
            self.drive(id, event);
        }
    }

    /// Progress every slot until `cond` holds for `owner`, or until `budget`
    /// passes with nothing ready.
    pub(crate) fn run(
        &mut self,
        owner: OwnerId,
        cond: &WaitCondition,
        budget: Option<Duration>,
    ) -> FaultResult<RunOutcome> {
        let started = Instant::now();
        loop {
            self.prune();
            self.expire(Instant::now());
            self.advance_idle();
            if cond.satisfied(self, owner) {
                return Ok(RunOutcome::Satisfied);
            }

            self.build_pollfds();
            let now = Instant::now();
            let left = budget.map(|b| b.saturating_sub(now.duration_since(started)));
            let timeout = match (self.deadlines.next_timeout(now), left) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if self.pollfds.is_empty() && timeout.is_none() {
                return Err(Fault::new(
                    FaultCode::SeriousInternalOsError,
                    format!("nothing to wait for with {} requests outstanding", self.todo(owner)),
                ));
            }

            let ready = self.poll(poll_timeout_ms(timeout))?;
            if ready == 0 {
                if let Some(b) = budget {
                    if started.elapsed() >= b {
                        return Ok(RunOutcome::Blocked);
                    }
                }
                continue;
            }
            self.dispatch_ready();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("owners", &self.owners.len())
            .field("slots", &self.slots.len())
            .field("deadlines", &self.deadlines.len())
            .field("proxy", &self.poller.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn admitted(key: &str) -> ClientRequest {
        let r = ClientRequest::new();
        r.cell()
            .lock()
            .admit(key, "t:1", Duration::from_millis(100), &ClientConfig::default())
            .unwrap();
        r
    }

    #[test]
    fn test_dropped_request_is_pruned() {
        let mut d = Dispatcher::new(true);
        let owner = OwnerId::next();
        d.attach_owner(owner);
        let r = admitted("echo.ping.1.r");
        d.add(owner, &r);
        assert_eq!(d.todo(owner), 1);

        drop(r);
        let outcome = d.run(owner, &WaitCondition::All, None).unwrap();
        assert_eq!(outcome, RunOutcome::Satisfied);
        assert_eq!(d.todo(owner), 0);
        assert!(d.pop_completed(owner).is_none());
    }

    #[test]
    fn test_lookup_failure_completes_in_order() {
        let mut d = Dispatcher::new(true);
        let owner = OwnerId::next();
        d.attach_owner(owner);
        let first = admitted("echo.ping.1.r");
        let second = admitted("bad");
        d.add(owner, &first);
        d.add(owner, &second);

        d.run(owner, &WaitCondition::All, None).unwrap();
        assert_eq!(first.fault_code(), FaultCode::LookupButNoMap);
        assert_eq!(second.fault_code(), FaultCode::ServiceKeyBad);
        assert!(d.pop_completed(owner).unwrap().same_request(&first));
        assert!(d.pop_completed(owner).unwrap().same_request(&second));
        assert!(d.pop_completed(owner).is_none());
    }

    #[test]
    fn test_reset_owner_abandons_requests() {
        let mut d = Dispatcher::new(true);
        let owner = OwnerId::next();
        let other = OwnerId::next();
        d.attach_owner(owner);
        d.attach_owner(other);
        let mine = admitted("echo.ping.1.r");
        let theirs = admitted("echo.ping.1.r");
        d.add(owner, &mine);
        d.add(other, &theirs);

        d.detach_owner(owner);
        assert!(!mine.in_progress());
        assert!(!mine.has_fault());
        assert_eq!(mine.state(), RequestState::Idle);
        assert!(theirs.in_progress());
        assert_eq!(d.owner_count(), 1);
        assert!(d.tracks(other, &theirs));
        assert!(!d.tracks(other, &mine));
    }

    #[test]
    fn test_stale_expiry_is_ignored() {
        let mut d = Dispatcher::new(true);
        let owner = OwnerId::next();
        d.attach_owner(owner);
        let r = admitted("echo.ping.1.r");
        let id = d.add(owner, &r);
        r.cell().lock().timer_seq = 5;
        r.cell().lock().deadline = Some(Instant::now());
        assert_eq!(d.drive(id, Event::Expired(4)), Drive::Unchanged);
        assert!(r.in_progress());
    }

    #[test]
    fn test_blocked_budget_with_proxy() {
        struct Never;
        impl Poller for Never {
            fn poll(&self, _fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
                if timeout_ms > 0 {
                    std::thread::sleep(Duration::from_millis(timeout_ms as u64));
                }
                Ok(0)
            }
        }

        let mut d = Dispatcher::new(true);
        let owner = OwnerId::next();
        d.attach_owner(owner);
        assert!(d.set_poller(Some(Arc::new(Never) as Arc<dyn Poller>)).is_none());

        // A slot that waits forever on a pipe-like descriptor
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let r = admitted("echo.ping.1.r");
        let id = d.add(owner, &r);
        {
            use std::os::fd::AsRawFd;
            let fd = a.as_raw_fd();
            d.slots.get_mut(&id).unwrap().want = Some((Interest::Read, fd));
        }

        let outcome = d
            .run(owner, &WaitCondition::Blocked, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(outcome, RunOutcome::Blocked);
        assert!(d.set_poller(None).is_some());
    }
}
