//! Synchronization primitives coordinating host threads and driver signals.
//!
//! This module defines the two waitable building blocks the completion
//! machinery is built on:
//!
//! - [`Semaphore`]: the contract for a driver timeline counter, a
//!   monotonically non-decreasing 64-bit value the host can wait on.
//!   [`HostSemaphore`] is the in-process implementation with a cached counter
//!   value for cheap polling; a driver backend substitutes its own.
//! - [`ConditionVariable`]: the per-event waitable, either bound to a
//!   `(semaphore, target value)` pair or to a plain host condition variable
//!   for events that have no device-side signal (user events).
//!
//! The timeline variant can complete without any host-side notification: the
//! counter advances on a driver thread and waiters observe it by polling.
//! The host variant completes only when the process notifies it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// A timeline counter the core can wait on.
///
/// Values are monotonically non-decreasing. `wait` and `poll` block until the
/// counter reaches the target (returning `false` only on a driver-side
/// failure such as device loss); `poll_once` never blocks.
pub trait Semaphore: Send + Sync {
    /// Advances the counter to `value`. No-op if the counter is already at or
    /// past it.
    fn notify(&self, value: u64);

    /// Blocks until the counter reaches `value`.
    fn wait(&self, value: u64) -> bool;

    /// Busy-polls for a bounded number of iterations, then falls back to a
    /// blocking wait.
    fn poll(&self, value: u64) -> bool;

    /// Returns whether the counter has reached `value`, without blocking.
    fn poll_once(&self, value: u64) -> bool;
}

/// In-process [`Semaphore`] backed by a mutex and condition variable.
///
/// The counter value is additionally cached in an [`AtomicU64`] so that
/// `poll_once` on an already-signaled value does not take the lock.
pub struct HostSemaphore {
    value: Mutex<u64>,
    cond: Condvar,
    cached: AtomicU64,
}

const POLL_SPIN: u32 = 1024;

impl HostSemaphore {
    pub fn new(initial_value: u64) -> Self {
        Self {
            value: Mutex::new(initial_value),
            cond: Condvar::new(),
            cached: AtomicU64::new(initial_value),
        }
    }
}

impl Semaphore for HostSemaphore {
    fn notify(&self, value: u64) {
        let mut cur = self.value.lock().unwrap();
        if *cur >= value {
            return;
        }
        *cur = value;
        self.cached.fetch_max(value, Ordering::Relaxed);
        self.cond.notify_all();
    }

    fn wait(&self, value: u64) -> bool {
        if self.cached.load(Ordering::Relaxed) >= value {
            return true;
        }
        let mut cur = self.value.lock().unwrap();
        while *cur < value {
            cur = self.cond.wait(cur).unwrap();
        }
        self.cached.fetch_max(*cur, Ordering::Relaxed);
        true
    }

    fn poll(&self, value: u64) -> bool {
        for _ in 0..POLL_SPIN {
            if self.poll_once(value) {
                return true;
            }
            std::thread::yield_now();
        }
        self.wait(value)
    }

    fn poll_once(&self, value: u64) -> bool {
        if self.cached.load(Ordering::Relaxed) >= value {
            return true;
        }
        let cur = *self.value.lock().unwrap();
        self.cached.fetch_max(cur, Ordering::Relaxed);
        cur >= value
    }
}

/// The waitable half of an event.
///
/// Construction fixes the variant for the lifetime of the event: command
/// events submitted to a queue get a [`timeline`](ConditionVariable::timeline)
/// bound to the queue's semaphore and the submission's counter value, while
/// user events get a [`host`](ConditionVariable::host) variant.
pub struct ConditionVariable {
    variant: Variant,
}

enum Variant {
    Timeline {
        semaphore: Arc<dyn Semaphore>,
        value: u64,
    },
    Host(Condvar),
}

impl ConditionVariable {
    /// A condition variable that is complete once `semaphore` reaches
    /// `value`. Retains the semaphore.
    pub fn timeline(semaphore: Arc<dyn Semaphore>, value: u64) -> Self {
        Self {
            variant: Variant::Timeline { semaphore, value },
        }
    }

    /// A condition variable completed only by explicit notification.
    pub fn host() -> Self {
        Self {
            variant: Variant::Host(Condvar::new()),
        }
    }

    pub(crate) fn is_host(&self) -> bool {
        matches!(self.variant, Variant::Host(_))
    }

    /// Wakes all waiters. For the timeline variant this forcibly advances the
    /// semaphore to the target value.
    pub fn notify(&self) {
        match &self.variant {
            Variant::Timeline { semaphore, value } => semaphore.notify(*value),
            Variant::Host(cond) => {
                cond.notify_all();
            }
        }
    }

    /// Releases `guard`, blocks (or polls, for the timeline variant) until
    /// woken, and re-acquires the lock. Returns the re-acquired guard and
    /// whether the wait succeeded.
    ///
    /// For the host variant a wakeup carries no completion information; the
    /// caller re-checks its predicate and loops.
    pub(crate) fn wait<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        lock: &'a Mutex<T>,
        poll: bool,
    ) -> (MutexGuard<'a, T>, bool) {
        match &self.variant {
            Variant::Timeline { semaphore, value } => {
                drop(guard);
                let ok = if poll {
                    semaphore.poll(*value)
                } else {
                    semaphore.wait(*value)
                };
                (lock.lock().unwrap(), ok)
            }
            Variant::Host(cond) => (cond.wait(guard).unwrap(), true),
        }
    }

    /// Non-blocking completion check. Only the timeline variant can report
    /// completion without having been notified through the event.
    pub fn is_complete(&self) -> bool {
        match &self.variant {
            Variant::Timeline { semaphore, value } => semaphore.poll_once(*value),
            Variant::Host(_) => false,
        }
    }
}
