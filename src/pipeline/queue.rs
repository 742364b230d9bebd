//! Bounded blocking hand-off queue between two pipeline stages
//!
//! Producers block while the queue is full, consumers block until an item
//! arrives or the dequeue timeout elapses. A timeout is not an error: it is
//! the heartbeat a worker uses to notice it has been asked to stop.
//!
//! `clear()` and `interrupt()` wake every waiter on both sides. Each call
//! bumps an internal epoch, and a waiter that observes a new epoch gives up
//! instead of going back to sleep.
//!
//! A closed queue still accepts items while it has room, but `enqueue` on a
//! full closed queue drops the item instead of blocking. The consumer side
//! closes its input when it stops, so producers never wait on a dead stage.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::QueueConfig;

pub const DEFAULT_CAPACITY: usize = 1500;
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(2000);

struct Inner<T> {
    items: VecDeque<T>,
    epoch: u64,
    closed: bool,
}

pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    timeout: Duration,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(256)),
                epoch: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            timeout,
        }
    }

    pub fn with_config(config: &QueueConfig) -> Self {
        Self::new(config.capacity, config.dequeue_timeout())
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert at the tail, blocking while the queue is full.
    ///
    /// Returns `false` if the wait was cancelled by `clear()`, `interrupt()`
    /// or `close()`, or if the queue is closed and full; the item is dropped
    /// in that case.
    pub fn enqueue(&self, item: T) -> bool {
        let mut inner = self.lock();
        let epoch = inner.epoch;
        while inner.items.len() >= self.capacity {
            if inner.closed {
                return false;
            }
            inner = self
                .not_full
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
            if inner.epoch != epoch {
                return false;
            }
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Insert without blocking; hands the item back when the queue is full
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        let mut inner = self.lock();
        if inner.items.len() >= self.capacity {
            return Err(item);
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the head, waiting up to the configured timeout
    pub fn dequeue(&self) -> Option<T> {
        self.dequeue_timeout(self.timeout)
    }

    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let epoch = self.lock().epoch;
        self.dequeue_since(epoch, timeout)
    }

    /// Like `dequeue_timeout`, but gives up as soon as the epoch differs from
    /// `epoch`, even if the change happened before this call.
    pub(crate) fn dequeue_since(&self, epoch: u64, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.epoch != epoch {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Drop every queued item and wake all waiters. Returns how many items were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.items.len();
        inner.items.clear();
        inner.epoch = inner.epoch.wrapping_add(1);
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
        dropped
    }

    /// Wake all waiters without touching the queued items
    pub fn interrupt(&self) {
        let mut inner = self.lock();
        inner.epoch = inner.epoch.wrapping_add(1);
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Stop blocking producers: waiters are woken and a full queue rejects
    /// further items until `reopen()`
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.epoch = inner.epoch.wrapping_add(1);
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_DEQUEUE_TIMEOUT)
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("timeout", &self.timeout)
            .finish()
    }
}
