//! Hand-off queues between pipeline stages.
//!
//! [`TransferQueue`] is a FIFO guarded by one mutex with two condition
//! variables: one wakes consumers when an item arrives (or the queue closes),
//! the other wakes producers waiting for backlog room. `push` itself never
//! waits for anything but the lock.
//!
//! A consumer that must finish with an item before the queue counts as
//! drained takes it with [`TransferQueue::claim_wait`] and hands it back
//! with [`TransferQueue::release`]; [`TransferQueue::is_settled`] covers both.

use {
    crate::error::{ErrorKind, QueueError},
    std::{
        collections::VecDeque,
        sync::{Condvar, Mutex, MutexGuard, PoisonError},
        time::{Duration, Instant},
    },
};

/// Control markers that travel through the queues alongside data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// An upload pushed its last chunk.
    TransferComplete {
        /// Total bytes pushed by the upload.
        bytes: u64,
    },
    /// An upload stopped before its last chunk.
    TransferCancelled,
    /// The device went away.
    LinkLost,
    /// A worker stopped on an error of this kind.
    Failed(ErrorKind),
}

/// One item in a hand-off queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    /// Raw bytes.
    Data(Vec<u8>),
    /// Control marker.
    Marker(Marker),
}

impl QueueItem {
    /// The marker carried by this item, if any.
    pub fn marker(&self) -> Option<Marker> {
        match self {
            Self::Marker(m) => Some(*m),
            Self::Data(_) => None,
        }
    }
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    in_flight: usize,
}

/// Multi-producer, multi-consumer FIFO with explicit close and clear.
#[derive(Debug)]
pub struct TransferQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    room: Condvar,
}

impl<T> Default for TransferQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TransferQueue<T> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
                in_flight: 0,
            }),
            available: Condvar::new(),
            room: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // The state is a plain VecDeque and a flag; a panic mid-operation
        // cannot leave it half-updated
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item. Fails once the queue is closed.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Take the oldest item without waiting.
    pub fn pop(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.room.notify_all();
        }
        item
    }

    /// Take the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout, or immediately once the queue is closed and
    /// drained. Items pushed before `close` are still delivered.
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        self.take_wait(timeout, false)
    }

    /// Like [`TransferQueue::pop_wait`], but the item stays in flight until
    /// [`TransferQueue::release`] is called.
    pub fn claim_wait(&self, timeout: Duration) -> Option<T> {
        self.take_wait(timeout, true)
    }

    /// Mark one claimed item as finished.
    pub fn release(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    fn take_wait(&self, timeout: Duration, claim: bool) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                if claim {
                    state.in_flight += 1;
                }
                drop(state);
                self.room.notify_all();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wait until fewer than `limit` items are queued.
    ///
    /// Returns `false` on timeout or when the queue is closed, so a producer
    /// can re-check its stop signal between waits.
    pub fn wait_for_room(&self, limit: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return false;
            }
            if state.items.len() < limit {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .room
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Close the queue and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
        self.room.notify_all();
    }

    /// Re-open a closed queue for the next session.
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    /// Drop every queued item and forget outstanding claims, without
    /// closing the queue.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.items.clear();
        state.in_flight = 0;
        drop(state);
        self.room.notify_all();
    }

    /// Take every queued item at once, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.lock().items.drain(..).collect();
        self.room.notify_all();
        items
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Whether nothing is queued and no claimed item is still being handled.
    pub fn is_settled(&self) -> bool {
        let state = self.lock();
        state.items.is_empty() && state.in_flight == 0
    }

    /// Whether `close` has been called since the last `reopen`.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
