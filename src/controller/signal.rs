//! Broadcast flag used for cooperative stop and abort requests.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cloneable, one-to-many event flag.
///
/// Every clone observes the same state, so a top-level controller and all of its
/// sub-controllers see a request as soon as it is set.
#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    /// A cleared signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter.
    pub fn set(&self) {
        let mut flag = self.inner.flag.lock();
        *flag = true;
        self.inner.cond.notify_all();
    }

    /// Lower the flag.
    pub fn clear(&self) {
        *self.inner.flag.lock() = false;
    }

    /// Current state of the flag.
    pub fn is_set(&self) -> bool {
        *self.inner.flag.lock()
    }

    /// Block until the flag is set or `timeout` elapses. Returns the flag state.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.inner.flag.lock();
        while !*flag {
            if self.inner.cond.wait_until(&mut flag, deadline).timed_out() {
                break;
            }
        }
        *flag
    }

    /// True when both handles share the same underlying flag.
    pub fn same_as(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("set", &self.is_set()).finish()
    }
}
