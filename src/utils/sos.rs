//! Stop signal shared between a control thread and background loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Cloneable one-shot stop signal.
///
/// Once cancelled it stays cancelled; loops that need to restart take a
/// fresh signal.
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    shared: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop::default()
    }

    pub fn cancel(&self) {
        // Store under the lock so a waiter cannot miss the notification
        let _guard = self.shared.lock();
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    pub fn wait_cancellation(&self) {
        let mut guard = self.shared.lock();
        while !self.cancelled() {
            guard = self
                .shared
                .condvar
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Sleep for `timeout` or until cancelled. Returns `true` when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.lock();
        loop {
            if self.cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .shared
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_timeout_elapses() {
        let sos = SignalOfStop::new();
        let start = Instant::now();
        assert!(!sos.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_wakes_waiters() {
        let sos = SignalOfStop::new();
        let waiter = {
            let sos = sos.clone();
            thread::spawn(move || sos.wait_timeout(Duration::from_secs(10)))
        };
        let blocking = {
            let sos = sos.clone();
            thread::spawn(move || sos.wait_cancellation())
        };
        thread::sleep(Duration::from_millis(20));
        sos.cancel();
        assert!(waiter.join().unwrap());
        blocking.join().unwrap();
        assert!(sos.cancelled());
        assert!(sos.wait_timeout(Duration::from_secs(10)));
    }
}
