//! Bounded, lossy handoff buffer between two stages.
//!
//! Pushing into a full queue evicts the oldest element instead of blocking
//! the producer, so a slow consumer can never stall its upstream stage. The
//! price is that messages may be lost under load. `pop` waits while the queue
//! is empty.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::State;
use crate::error::{Error, Result};

struct Inner {
    buf: VecDeque<State>,
    closed: bool,
}

/// Fixed-capacity FIFO of [`State`] with overwrite-when-full semantics.
pub struct Queue {
    inner: Mutex<Inner>,
    available: Notify,
    capacity: usize,
}

impl Queue {
    /// Create a queue holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid_argument("queue capacity must be at least 1"));
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Notify::new(),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a state, evicting the oldest one when full.
    ///
    /// Returns the evicted state, if any. Pushing into a closed queue drops
    /// the state and returns it.
    pub fn push(&self, state: State) -> Option<State> {
        let evicted = {
            let mut inner = self.lock();
            if inner.closed {
                return Some(state);
            }
            let evicted = if inner.buf.len() == self.capacity {
                inner.buf.pop_front()
            } else {
                None
            };
            inner.buf.push_back(state);
            evicted
        };
        self.available.notify_one();
        evicted
    }

    /// Remove the oldest state, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<State> {
        loop {
            // Registered before checking, so a push or close in between is
            // not missed.
            let notified = self.available.notified();
            {
                let mut inner = self.lock();
                if let Some(state) = inner.buf.pop_front() {
                    return Some(state);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Remove the oldest state without waiting.
    pub fn try_pop(&self) -> Option<State> {
        self.lock().buf.pop_front()
    }

    /// Current occupancy.
    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting states and wake a waiting consumer.
    ///
    /// States already buffered can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
        self.available.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::error::Code;
    use crate::test_utils::counter;

    fn state(id: u64) -> State {
        State::new(id, counter(id as i64, "q"))
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = Queue::new(0).err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Queue::new(3).unwrap();
        queue.push(state(1));
        queue.push(state(2));
        assert_eq!(queue.pop().await.unwrap().id(), 1);
        assert_eq!(queue.pop().await.unwrap().id(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_last_capacity_items() {
        let capacity = 3;
        let extra = 4;
        let queue = Queue::new(capacity).unwrap();

        for id in 1..=(capacity + extra) as u64 {
            queue.push(state(id));
            assert!(queue.len() <= capacity);
        }
        assert_eq!(queue.len(), capacity);

        let mut popped = Vec::new();
        for _ in 0..capacity {
            popped.push(queue.pop().await.unwrap().id());
        }
        assert_eq!(popped, vec![5, 6, 7]);
    }

    #[test]
    fn test_push_reports_evicted_state() {
        let queue = Queue::new(1).unwrap();
        assert!(queue.push(state(1)).is_none());
        let evicted = queue.push(state(2)).unwrap();
        assert_eq!(evicted.id(), 1);
        assert_eq!(queue.try_pop().unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(Queue::new(1).unwrap());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_finished());

        let pushed = state(42);
        queue.push(pushed.clone());

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(popped, pushed);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_pop() {
        let queue = Arc::new(Queue::new(1).unwrap());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.close();
        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_ends() {
        let queue = Queue::new(2).unwrap();
        queue.push(state(1));
        queue.close();

        assert!(queue.push(state(2)).is_some());
        assert_eq!(queue.pop().await.unwrap().id(), 1);
        assert!(queue.pop().await.is_none());
        assert!(queue.is_closed());
    }
}
