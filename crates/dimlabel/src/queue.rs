//! Thread-safe FIFO used to hand work between producers and consumers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    is_open: bool,
}

/// Blocking producer/consumer queue with a one-way drain.
///
/// Items pushed by one producer are popped in push order. Once
/// [`drain`](Self::drain) has been called the queue rejects new items,
/// but items already queued stay poppable; after they run out,
/// [`pop`](Self::pop) returns `None` instead of blocking.
///
/// # Examples
/// ```rust,ignore
/// use alopex_dimlabel::queue::SyncQueue;
///
/// let queue = SyncQueue::new();
/// assert!(queue.push(1));
/// queue.drain();
/// assert_eq!(queue.pop(), Some(1));
/// assert_eq!(queue.pop(), None);
/// ```
#[derive(Debug)]
pub struct SyncQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncQueue<T> {
    /// Creates an open, empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                is_open: true,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Appends an item and wakes one waiting consumer.
    ///
    /// Returns false without enqueueing if the queue has been drained.
    #[must_use = "a rejected push means the queue is shutting down"]
    pub fn push(&self, item: T) -> bool {
        let mut state = self.lock();
        if !state.is_open {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Pops the front item without blocking.
    ///
    /// Returns `None` when empty, whether or not the queue is drained.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Pops the front item, blocking until one is available.
    ///
    /// Returns `None` once the queue is drained and empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        // Re-check after every wakeup: spurious wakeups and competing
        // consumers are both expected.
        while state.is_open && state.items.is_empty() {
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|err| err.into_inner());
        }
        state.items.pop_front()
    }

    /// Returns true until the queue has been drained.
    pub fn is_open(&self) -> bool {
        self.lock().is_open
    }

    /// Closes the queue to new items and wakes every waiting consumer.
    ///
    /// Idempotent.
    pub fn drain(&self) {
        self.lock().is_open = false;
        self.available.notify_all();
    }

    /// Wakes one waiter without changing queue state.
    pub fn signal_one(&self) {
        self.available.notify_one();
    }

    /// Wakes every waiter without changing queue state.
    pub fn signal_all(&self) {
        self.available.notify_all();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns true if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}
