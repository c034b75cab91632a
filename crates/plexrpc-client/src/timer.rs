//! Request deadlines
//!
//! A min-heap of `(deadline, slot)` with lazy cancellation: each armed
//! deadline carries a sequence number, and the owner of the slot remembers
//! the number of its live deadline. Entries whose number no longer matches
//! are dropped when they reach the top instead of being searched for.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::dispatcher::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineEntry {
    pub deadline: Instant,
    pub slot: SlotId,
    pub seq: u64,
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; ties resolve in arming order
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct DeadlineHeap {
    heap: BinaryHeap<DeadlineEntry>,
    next_seq: u64,
}

impl DeadlineHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline; the returned sequence number identifies it
    pub fn arm(&mut self, slot: SlotId, deadline: Instant) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.heap.push(DeadlineEntry { deadline, slot, seq });
        seq
    }

    /// Pop every entry due at `now`, live or not. The caller checks each
    /// against its slot's current sequence number.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<DeadlineEntry> {
        let mut out = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                out.push(entry);
            }
        }
        out
    }

    /// Time until the earliest entry, zero if already due
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|e| e.deadline.saturating_duration_since(now))
    }

    /// Drop entries for which `live` is false, so an idle heap does not pin
    /// stale wakeups
    pub fn retain(&mut self, mut live: impl FnMut(&DeadlineEntry) -> bool) {
        self.heap.retain(|e| live(e));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Poll timeout in whole milliseconds, rounded up so a wait never returns
/// just before its deadline. `None` waits forever.
pub fn poll_timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_deadline_order() {
        let base = Instant::now();
        let mut heap = DeadlineHeap::new();
        heap.arm(SlotId(3), base + Duration::from_millis(30));
        heap.arm(SlotId(1), base + Duration::from_millis(10));
        heap.arm(SlotId(2), base + Duration::from_millis(20));

        assert!(heap.pop_expired(base).is_empty());
        let due: Vec<_> = heap
            .pop_expired(base + Duration::from_millis(25))
            .into_iter()
            .map(|e| e.slot)
            .collect();
        assert_eq!(due, vec![SlotId(1), SlotId(2)]);
        assert_eq!(heap.len(), 1);
        assert_eq!(
            heap.next_timeout(base + Duration::from_millis(25)),
            Some(Duration::from_millis(5))
        );
    }

    #[test]
    fn test_sequence_numbers_distinguish_rearm() {
        let now = Instant::now();
        let mut heap = DeadlineHeap::new();
        let first = heap.arm(SlotId(7), now);
        let second = heap.arm(SlotId(7), now);
        assert_ne!(first, second);

        heap.retain(|e| e.seq == second);
        let due = heap.pop_expired(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].seq, second);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_poll_timeout_rounding() {
        assert_eq!(poll_timeout_ms(None), -1);
        assert_eq!(poll_timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(poll_timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(poll_timeout_ms(Some(Duration::from_millis(15))), 15);
        assert_eq!(poll_timeout_ms(Some(Duration::from_secs(u64::MAX / 4))), i32::MAX);
    }
}
