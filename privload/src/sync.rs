//! Recursive loader lock
//!
//! The loader lock must be recursive: redirected routines (the loader-aware
//! `GetModuleHandleA`, `FlsAlloc`) are invoked from inside private-library
//! entry points that themselves run under the lock. A non-recursive lock
//! would deadlock there.
//!
//! Ownership is tracked by thread id (supplied by the platform interface)
//! with a recursion depth, like a kernel mutex: the same thread may acquire
//! any number of times and must release the same number of times.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::platform;

/// Recursive mutual-exclusion lock. Holds no data; callers use it to
/// serialize access to the loader's interior state.
pub struct RecursiveLock {
    /// Owning thread id, 0 when free.
    owner: AtomicUsize,
    /// How many times the owner has acquired.
    depth: AtomicU32,
}

impl RecursiveLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
            depth: AtomicU32::new(0),
        }
    }

    /// Acquire for thread `tid` (must be non-zero), spinning if another
    /// thread holds the lock.
    pub fn acquire(&self, tid: usize) {
        debug_assert!(tid != 0);
        if self.owner.load(Ordering::Acquire) == tid {
            // Recursive acquisition: depth is only touched by the owner.
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }
        while self
            .owner
            .compare_exchange_weak(0, tid, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.depth.store(1, Ordering::Relaxed);
    }

    /// Release one level of ownership.
    ///
    /// # Panics
    /// Panics if the calling thread is not the owner.
    pub fn release(&self, tid: usize) {
        if self.owner.load(Ordering::Acquire) != tid {
            panic!("RecursiveLock::release called by non-owner");
        }
        let depth = self.depth.fetch_sub(1, Ordering::Relaxed);
        if depth == 1 {
            self.owner.store(0, Ordering::Release);
        }
    }

    /// True iff thread `tid` currently owns the lock.
    #[inline]
    pub fn held_by(&self, tid: usize) -> bool {
        self.owner.load(Ordering::Acquire) == tid
    }

    /// Acquire on behalf of the calling thread and return a release guard.
    pub fn lock(&self) -> RecursiveGuard<'_> {
        let tid = platform::get().current_thread_id();
        self.acquire(tid);
        RecursiveGuard { lock: self, tid }
    }
}

impl Default for RecursiveLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`RecursiveLock::lock`].
pub struct RecursiveGuard<'a> {
    lock: &'a RecursiveLock,
    tid: usize,
}

impl<'a> Drop for RecursiveGuard<'a> {
    fn drop(&mut self) {
        self.lock.release(self.tid);
    }
}
