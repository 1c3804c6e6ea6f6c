use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Semaphore;

use crate::error::ParamsyncError;

// ---------------------------------------------------------------------------
// SendQueue
// ---------------------------------------------------------------------------

/// A bounded FIFO of variable snapshots with backpressure.
///
/// `push` suspends while the queue is full, `pop` while it is empty. Two
/// semaphores (free slots / available items) gate a plain `VecDeque`;
/// `close()` poisons both so every blocked producer and consumer wakes and
/// observes shutdown. FIFO order is preserved, including across waiters
/// (Tokio semaphores are fair).
#[derive(Debug)]
pub struct SendQueue<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    slots: Semaphore,
    items: Semaphore,
}

impl<T> SendQueue<T> {
    /// Capacity must be greater than zero.
    pub fn new(capacity: usize) -> Result<Self, ParamsyncError> {
        if capacity == 0 {
            return Err(ParamsyncError::Config(
                "send queue capacity must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            slots: Semaphore::new(capacity),
            items: Semaphore::new(0),
        })
    }

    /// Append an element, waiting for a free slot. Returns false when the
    /// queue has been closed; the element is dropped in that case.
    pub async fn push(&self, elem: T) -> bool {
        let Ok(permit) = self.slots.acquire().await else {
            return false;
        };
        permit.forget();
        self.lock().push_back(elem);
        self.items.add_permits(1);
        true
    }

    /// Remove and return the front element, waiting for one to arrive.
    /// Returns `None` once the queue has been closed.
    pub async fn pop(&self) -> Option<T> {
        let Ok(permit) = self.items.acquire().await else {
            return None;
        };
        permit.forget();
        let elem = self.lock().pop_front();
        self.slots.add_permits(1);
        elem
    }

    /// Non-blocking pop; `None` when empty or closed.
    pub fn try_pop(&self) -> Option<T> {
        let Ok(permit) = self.items.try_acquire() else {
            return None;
        };
        permit.forget();
        let elem = self.lock().pop_front();
        self.slots.add_permits(1);
        elem
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Poison the queue: wake every blocked producer and consumer. Elements
    /// still queued stay in place until `drain()`.
    pub fn close(&self) {
        self.slots.close();
        self.items.close();
    }

    pub fn is_closed(&self) -> bool {
        self.items.is_closed()
    }

    /// Remove and return everything still queued. Used on shutdown, after
    /// `close()`, to discard pending snapshots.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
