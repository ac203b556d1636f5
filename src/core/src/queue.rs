//! Bounded blocking queue between the signal producer and the update consumer.

use crate::event::QueueEntry;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Default number of slots.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

struct QueueState {
    entries: VecDeque<QueueEntry>,
    stopped: bool,
}

/// Fixed-capacity FIFO of [`QueueEntry`] values.
///
/// `put` blocks while full and `pop` blocks while empty. After [`stop`]
/// both return immediately: `put` reports `false` and `pop` yields the
/// stop sentinel. Entries still queued at that point are abandoned.
///
/// [`stop`]: UpdateQueue::stop
pub struct UpdateQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl UpdateQueue {
    /// Create a queue with the given capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue an entry, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was stopped before the entry was accepted.
    pub fn put(&self, entry: QueueEntry) -> bool {
        let mut state = self.state.lock();
        while state.entries.len() >= self.capacity && !state.stopped {
            self.not_full.wait(&mut state);
        }
        if state.stopped {
            tracing::debug!(source_id = entry.source_id, "Queue stopped, dropping entry");
            return false;
        }
        state.entries.push_back(entry);
        self.not_empty.notify_one();
        true
    }

    /// Dequeue the oldest entry, blocking while the queue is empty.
    ///
    /// Returns the stop sentinel once the queue has been stopped.
    pub fn pop(&self) -> QueueEntry {
        let mut state = self.state.lock();
        while state.entries.is_empty() && !state.stopped {
            self.not_empty.wait(&mut state);
        }
        if state.stopped {
            return QueueEntry::stop();
        }
        match state.entries.pop_front() {
            Some(entry) => {
                self.not_full.notify_one();
                entry
            }
            None => QueueEntry::stop(),
        }
    }

    /// Stop the queue and wake every blocked producer and consumer.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        let abandoned = state.entries.len();
        drop(state);

        if abandoned > 0 {
            tracing::info!(abandoned, "Update queue stopped with pending entries");
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for UpdateQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
