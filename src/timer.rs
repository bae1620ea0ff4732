use crate::task::TaskId;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

/// Why a deadline was armed. Sleeps resume the task with the current
/// clock; timeouts deliver a cancellation chosen by the timeout engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Sleep,
    Timeout,
}

/// Token returned by [`TimerHeap::push`]; cancelling it is O(1) and the
/// heap entry is lazily discarded when it reaches the top.
pub(crate) type TimerToken = u64;

#[derive(Debug)]
pub(crate) struct TimerEntry {
    pub(crate) deadline: f64,
    pub(crate) token: TimerToken,
    pub(crate) task: TaskId,
    pub(crate) kind: TimerKind,
}

// Ordered by (deadline, token). Tokens increase monotonically, so ties on
// the deadline fire in insertion order.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .total_cmp(&other.deadline)
            .then(self.token.cmp(&other.token))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimerEntry {}

/// Min-heap of pending deadlines keyed by absolute clock value.
///
/// Cancellation never touches the heap: the token goes into a dead set and
/// the entry is dropped when popped. Cheap to arm, cheap to disarm, which
/// matters because most timeouts never fire.
#[derive(Debug)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    dead: HashSet<TimerToken>,
    next_token: TimerToken,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            dead: HashSet::new(),
            next_token: 1,
        }
    }

    pub(crate) fn push(&mut self, deadline: f64, task: TaskId, kind: TimerKind) -> TimerToken {
        let token = self.next_token;
        self.next_token += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline,
            token,
            task,
            kind,
        }));
        token
    }

    pub(crate) fn cancel(&mut self, token: TimerToken) {
        self.dead.insert(token);
    }

    /// Deadline of the nearest live entry, if any. Dead entries found at
    /// the top are discarded along the way.
    pub(crate) fn next_deadline(&mut self) -> Option<f64> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.dead.remove(&entry.token) {
                self.heap.pop();
                continue;
            }
            return Some(entry.deadline);
        }
        None
    }

    /// Pop the next live entry whose deadline is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: f64) -> Option<TimerEntry> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.dead.remove(&entry.token) {
                self.heap.pop();
                continue;
            }
            if entry.deadline > now {
                return None;
            }
            return self.heap.pop().map(|Reverse(e)| e);
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
