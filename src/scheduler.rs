//! In-flight transfer scheduling
//!
//! Submitted transfers are kept ordered by absolute deadline so the event
//! loop can bound its wait by the nearest expiry and sweep expired entries in
//! a single pass from the front. Transfers without a timeout order after
//! every set deadline and therefore collect at the tail. Among equal
//! deadlines submission order is preserved.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::trace;

use crate::clock::Deadline;
use crate::transfer::{EngineFlags, Transfer};

/// Position of a transfer inside the in-flight ordering. Stored on the
/// transfer itself so removal does not have to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SchedKey {
    deadline: Deadline,
    seq: u64,
}

/// The set of transfers accepted by the backend and not yet terminal.
pub(crate) struct FlyingTransfers {
    entries: BTreeMap<SchedKey, Transfer>,
    next_seq: u64,
}

impl FlyingTransfers {
    pub(crate) fn new() -> FlyingTransfers {
        FlyingTransfers {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Link `transfer` at its deadline position. The transfer's engine state
    /// must already carry the computed deadline.
    pub(crate) fn insert(&mut self, transfer: &Transfer) {
        let mut state = transfer.state();
        let key = SchedKey {
            deadline: state.deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        state.sched_key = Some(key);
        drop(state);
        self.entries.insert(key, transfer.clone());
    }

    /// Unlink `transfer`. Tolerates transfers that are not linked.
    pub(crate) fn remove(&mut self, transfer: &Transfer) -> bool {
        let key = transfer.state().sched_key.take();
        match key {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The nearest set deadline among transfers not already latched as timed
    /// out. `None` when nothing in flight carries a set deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        for transfer in self.entries.values() {
            if transfer
                .state()
                .engine_flags
                .contains(EngineFlags::TIMED_OUT)
            {
                continue;
            }
            return match transfer.state().deadline {
                Deadline::At(at) => Some(at),
                Deadline::Never => None,
            };
        }
        None
    }

    /// Latch and return every transfer whose deadline has passed at `now`.
    /// Stops at the first unexpired or infinite deadline; entries already
    /// latched are skipped.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<Transfer> {
        let mut expired = Vec::new();
        for transfer in self.entries.values() {
            let mut state = transfer.state();
            match state.deadline {
                Deadline::Never => break,
                Deadline::At(_) if !state.deadline.expired(now) => break,
                Deadline::At(_) => {
                    if state.engine_flags.contains(EngineFlags::TIMED_OUT) {
                        continue;
                    }
                    state.engine_flags |= EngineFlags::TIMED_OUT;
                    drop(state);
                    trace!(endpoint = transfer.endpoint(), "transfer deadline expired");
                    expired.push(transfer.clone());
                }
            }
        }
        expired
    }

    /// In-flight transfers in deadline order.
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Transfer> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn flying_transfer(deadline: Deadline) -> Transfer {
        let t = Transfer::alloc(0);
        t.state().deadline = deadline;
        t
    }

    #[test]
    fn test_ordering_with_infinite_tail() {
        let now = Instant::now();
        let t1 = flying_transfer(Deadline::from_timeout_ms(200, now));
        let t2 = flying_transfer(Deadline::Never);
        let t3 = flying_transfer(Deadline::from_timeout_ms(50, now));

        let mut flying = FlyingTransfers::new();
        flying.insert(&t1);
        flying.insert(&t2);
        flying.insert(&t3);

        let order: Vec<bool> = flying.iter().map(|t| t.same_transfer(&t3)).collect();
        assert_eq!(order, vec![true, false, false]);
        let last = flying.iter().last().unwrap();
        assert!(last.same_transfer(&t2));

        // deadlines non-decreasing, infinite ones a contiguous suffix
        let deadlines: Vec<Deadline> = flying.iter().map(|t| t.state().deadline).collect();
        let mut sorted = deadlines.clone();
        sorted.sort();
        assert_eq!(deadlines, sorted);
    }

    #[test]
    fn test_equal_deadlines_keep_submission_order() {
        let at = Deadline::At(Instant::now() + Duration::from_millis(100));
        let a = flying_transfer(at);
        let b = flying_transfer(at);

        let mut flying = FlyingTransfers::new();
        flying.insert(&a);
        flying.insert(&b);

        let first = flying.iter().next().unwrap();
        assert!(first.same_transfer(&a));
    }

    #[test]
    fn test_remove_unlinks_once() {
        let t = flying_transfer(Deadline::Never);
        let mut flying = FlyingTransfers::new();
        flying.insert(&t);

        assert!(flying.remove(&t));
        assert!(!flying.remove(&t));
        assert!(flying.is_empty());
    }

    #[test]
    fn test_next_deadline_skips_latched() {
        let now = Instant::now();
        let soon = flying_transfer(Deadline::from_timeout_ms(10, now));
        let later = flying_transfer(Deadline::from_timeout_ms(500, now));

        let mut flying = FlyingTransfers::new();
        flying.insert(&soon);
        flying.insert(&later);

        soon.state().engine_flags |= EngineFlags::TIMED_OUT;
        let next = flying.next_deadline().unwrap();
        assert!(next > now + Duration::from_millis(400));
    }

    #[test]
    fn test_expire_latches_and_stops_at_unexpired() {
        let now = Instant::now();
        let expired = flying_transfer(Deadline::from_timeout_ms(10, now));
        let pending = flying_transfer(Deadline::from_timeout_ms(10_000, now));
        let infinite = flying_transfer(Deadline::Never);

        let mut flying = FlyingTransfers::new();
        flying.insert(&expired);
        flying.insert(&pending);
        flying.insert(&infinite);

        let swept = flying.expire(now + Duration::from_millis(20));
        assert_eq!(swept.len(), 1);
        assert!(swept[0].same_transfer(&expired));
        assert!(swept[0]
            .state()
            .engine_flags
            .contains(EngineFlags::TIMED_OUT));

        // a second sweep skips the latched entry
        assert!(flying.expire(now + Duration::from_millis(30)).is_empty());
    }
}
