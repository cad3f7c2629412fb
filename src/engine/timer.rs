//! Timer queue for the event loop.
//!
//! A min-heap keyed by deadline; ties fire in insertion order. Cancellation
//! is lazy: cancelled ids are skipped when their entries surface.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

/// Opaque handle for cancelling an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Entry<T> {
    deadline: Instant,
    order: u64,
    id: TimerId,
    kind: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.order == other.order
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline
        // (then lowest insertion order) on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.order.cmp(&self.order))
    }
}

/// Deadline-ordered timer queue.
pub struct TimerQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    cancelled: HashSet<TimerId>,
    next_id: u64,
}

impl<T> TimerQueue<T> {
    /// Empty queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_id: 0,
        }
    }

    /// Arm a timer firing `delay` from now.
    pub fn arm(&mut self, kind: T, delay: Duration) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Entry {
            deadline: Instant::now() + delay,
            order: id.0,
            id,
            kind,
        });
        id
    }

    /// Cancel a previously armed timer. Cancelling twice is harmless.
    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// Deadline of the next live timer, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_cancelled();
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Pop the next timer whose deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<T> {
        self.drop_cancelled();
        if self.heap.peek()?.deadline <= now {
            let entry = self.heap.pop()?;
            self.cancelled.remove(&entry.id);
            Some(entry.kind)
        } else {
            None
        }
    }

    /// Drop every armed timer.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.cancelled.clear();
    }

    fn drop_cancelled(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if self.cancelled.contains(&entry.id) {
                let entry = self.heap.pop().unwrap();
                self.cancelled.remove(&entry.id);
            } else {
                break;
            }
        }
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
