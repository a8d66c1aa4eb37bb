//! A slot that blocks readers until a value is published.
//!
//! Used to layer synchronous request/response on top of the bus: the
//! requester waits on the slot while the reader thread that decodes the
//! matching response fills it.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Single-value holder with a timed blocking read.
#[derive(Debug)]
pub struct BlockingValue<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Default for BlockingValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingValue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Store `value`, replacing any unread one, and wake all waiters.
    pub fn set(&self, value: T) {
        *self.slot.lock() = Some(value);
        self.ready.notify_all();
    }

    /// Block until a value is present or `timeout` elapses, then take it.
    /// Returns `None` on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let mut slot = self.slot.lock();
        self.block(&mut slot, timeout);
        slot.take()
    }

    /// Take the value if one is present, without blocking.
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Drop any unread value.
    pub fn clear(&self) {
        self.slot.lock().take();
    }

    fn block(&self, slot: &mut parking_lot::MutexGuard<'_, Option<T>>, timeout: Duration) {
        let deadline = Instant::now().checked_add(timeout);
        while slot.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(slot, deadline).timed_out() {
                        return;
                    }
                }
                None => self.ready.wait(slot),
            }
        }
    }
}

impl<T: Clone> BlockingValue<T> {
    /// Like [`BlockingValue::wait`] but leaves the value in place for other
    /// readers.
    pub fn wait_no_clear(&self, timeout: Duration) -> Option<T> {
        let mut slot = self.slot.lock();
        self.block(&mut slot, timeout);
        slot.clone()
    }
}
