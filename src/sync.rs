//! Lock and condition-variable primitives with a fixed top-down ordering.
//!
//! The kernel's real scheduler is an assumed external collaborator; what
//! this module fixes is the *shape* of locking the core subsystems rely
//! on: named wrapper types over `spin::Mutex` singletons, matching a
//! strict acquisition order:
//!
//! 1. address-space destruction lock
//! 2. PID directory lock
//! 3. page-table structural lock
//! 4. coremap sleep lock
//! 5. page-table-entry spinlock
//! 6. TLB spinlock
//! 7. coremap short spinlock
//! 8. swap-store short spinlock
//!
//! `Spinlock` never suspends and is safe to use from contexts that must not
//! sleep (coremap `free`, called from interrupt context). `SleepLock` is
//! the same underlying primitive but is the type used at sites that may
//! do I/O or allocation while held (the page-table structural lock, the
//! coremap's allocation path) — the distinction is documentation enforced
//! by which wrapper a module reaches for, since this crate has no real
//! thread scheduler to actually park a thread on.

use core::hint;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

/// A non-sleeping lock. Must never be held across I/O or allocation.
pub struct Spinlock<T> {
    inner: Mutex<T>,
}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Spinlock { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }
}

/// A lock that may be held across suspension points (I/O, allocation).
/// Structurally identical to `Spinlock` in this crate — the type exists so
/// call sites and reviewers can see which lock-ordering tier a given guard
/// belongs to, per the table above.
pub struct SleepLock<T> {
    inner: Mutex<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(value: T) -> Self {
        SleepLock { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

/// A broadcast condition variable. Waiters spin on a generation counter
/// rather than parking with the (assumed, external) scheduler; this is
/// observably correct both under the host test harness and under real
/// preemptive threads, since a missed wakeup just means one more spin.
pub struct CondVar {
    generation: AtomicU64,
}

impl CondVar {
    pub const fn new() -> Self {
        CondVar { generation: AtomicU64::new(0) }
    }

    /// Block until `predicate` is true, re-checking after every signal.
    /// Callers must not hold a spinlock while waiting; the lock guarding
    /// `predicate`'s state should be the same `SleepLock`/`Spinlock` this
    /// condition variable is paired with, released for each re-check by
    /// the caller's own locking discipline (the predicate closure takes
    /// the lock itself).
    pub fn wait_while<F: FnMut() -> bool>(&self, mut still_waiting: F) {
        while still_waiting() {
            let seen = self.generation.load(Ordering::Acquire);
            while self.generation.load(Ordering::Acquire) == seen && still_waiting() {
                hint::spin_loop();
            }
        }
    }

    pub fn signal(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn broadcast(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    #[test]
    fn spinlock_mutates_under_lock() {
        let lock = Spinlock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn condvar_wakes_waiter() {
        let state = Arc::new(Spinlock::new(false));
        let cv = Arc::new(CondVar::new());

        let s2 = state.clone();
        let cv2 = cv.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            *s2.lock() = true;
            cv2.broadcast();
        });

        cv.wait_while(|| !*state.lock());
        assert!(*state.lock());
        handle.join().unwrap();
    }
}
