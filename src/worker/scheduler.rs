//! Deadline-ordered timeout scheduler.
//!
//! Every running job has exactly one entry here; the earliest deadline
//! drives the event loop's poll timeout. Entries hold job tokens, never
//! job data, so the registry remains the sole owner of jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::job::JobToken;

/// Opaque reference to a scheduled entry.
///
/// The (deadline, sequence) pair is the map key itself, which makes
/// removal a plain O(log n) key lookup. The sequence breaks deadline
/// ties consistently in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Handle {
    deadline: DateTime<Utc>,
    seq: u64,
}

impl Handle {
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }
}

#[derive(Debug, Default)]
pub struct TimeoutScheduler {
    entries: BTreeMap<Handle, JobToken>,
    next_seq: u64,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `token` at `deadline`, returning the entry's handle.
    pub fn add(&mut self, deadline: DateTime<Utc>, token: JobToken) -> Handle {
        let handle = Handle {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(handle, token);
        handle
    }

    /// Drop an entry. Returns false if the handle was not scheduled.
    pub fn remove(&mut self, handle: &Handle) -> bool {
        self.entries.remove(handle).is_some()
    }

    /// Earliest-deadline entry without removing it.
    pub fn peek(&self) -> Option<(Handle, JobToken)> {
        self.entries.first_key_value().map(|(&h, &t)| (h, t))
    }

    /// Remove and return the earliest-deadline token. Only used during
    /// forced shutdown, where the deadlines no longer matter.
    pub fn pop(&mut self) -> Option<JobToken> {
        self.entries.pop_first().map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_peek_returns_earliest() {
        let mut sq = TimeoutScheduler::new();
        sq.add(at(30), 3);
        sq.add(at(10), 1);
        sq.add(at(20), 2);

        let (h, token) = sq.peek().unwrap();
        assert_eq!(token, 1);
        assert_eq!(h.deadline(), at(10));
        assert_eq!(sq.len(), 3);
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let mut sq = TimeoutScheduler::new();
        sq.add(at(10), 1);
        sq.add(at(10), 2);
        assert_eq!(sq.pop(), Some(1));
        assert_eq!(sq.pop(), Some(2));
        assert_eq!(sq.pop(), None);
    }

    #[test]
    fn test_remove_by_handle() {
        let mut sq = TimeoutScheduler::new();
        let h1 = sq.add(at(10), 1);
        let h2 = sq.add(at(20), 2);

        assert!(sq.remove(&h1));
        assert!(!sq.remove(&h1));
        assert_eq!(sq.len(), 1);
        assert_eq!(sq.peek().map(|(_, t)| t), Some(2));

        assert!(sq.remove(&h2));
        assert_eq!(sq.len(), 0);
    }

    #[test]
    fn test_replace_entry_keeps_size() {
        // The stale-retry path removes and re-adds with a later deadline.
        let mut sq = TimeoutScheduler::new();
        let h = sq.add(at(10), 1);
        sq.add(at(15), 2);

        assert!(sq.remove(&h));
        sq.add(at(25), 1);
        assert_eq!(sq.len(), 2);
        assert_eq!(sq.peek().map(|(_, t)| t), Some(2));
    }
}
