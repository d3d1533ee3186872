use core::fmt;
use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicU32;
use crate::cfg::futex;
use crate::lock::RawLock;

const FREE: u32 = 0;
const TAKEN: u32 = 1;
const CONTENDED: u32 = 2;

/// A lock that spins on a single word and blocks in the kernel through a
/// futex once contended.
///
/// The lock word moves between three states: free, taken and contended.
/// A thread that has to wait always leaves the word in the contended state
/// before blocking, so `unlock` knows that it must issue a wake call. The
/// unlocking thread wakes every waiter, they then race to acquire the word
/// again.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use qdlock::locks::FutexLock;
/// use qdlock::RawLock;
///
/// let lock = Arc::new(FutexLock::new());
/// lock.lock();
/// let c_lock = Arc::clone(&lock);
/// let handle = thread::spawn(move || {
///     c_lock.lock();
///     // SAFETY: The lock is held by this thread.
///     unsafe { c_lock.unlock() };
/// });
/// // SAFETY: The lock is held by this thread.
/// unsafe { lock.unlock() };
/// handle.join().unwrap();
/// ```
pub struct FutexLock {
    state: AtomicU32,
}

impl FutexLock {
    /// Number of failed `try_lock_with` attempts between blocking waits.
    pub const WAIT_EVERY: u32 = 128;

    /// Creates a new unlocked `FutexLock`.
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        Self { state: AtomicU32::new(FREE) }
    }

    /// Creates a new unlocked `FutexLock` with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn new() -> Self {
        Self { state: AtomicU32::new(FREE) }
    }

    /// Marks the lock as contended and blocks until an unlock happens.
    ///
    /// If the lock turned out to be free while being marked as contended,
    /// this thread now holds it (in the contended state) and `true` is
    /// returned. The contended state is published before blocking, and the
    /// kernel rechecks it, so an unlock between the two cannot be missed.
    pub fn wait(&self) -> bool {
        if self.state.load(Relaxed) != CONTENDED && self.state.swap(CONTENDED, Acquire) == FREE {
            return true;
        }
        futex::wait(&self.state, CONTENDED);
        false
    }

    /// Non-blocking probe that throttles itself: every
    /// [`WAIT_EVERY`](Self::WAIT_EVERY)th failed attempt blocks in
    /// [`wait`](Self::wait) instead of returning immediately.
    ///
    /// `attempt` is the caller's count of failed attempts so far.
    pub fn try_lock_with(&self, attempt: u32) -> bool {
        if RawLock::try_lock(self) {
            return true;
        }
        attempt % Self::WAIT_EVERY == Self::WAIT_EVERY - 1 && self.wait()
    }
}

impl Default for FutexLock {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: The lock is only acquired by moving the state out of `FREE` with
// acquire ordering, and only released by the holder with release ordering.
unsafe impl RawLock for FutexLock {
    fn new() -> Self {
        Self::new()
    }

    fn try_lock(&self) -> bool {
        if self.state.load(Relaxed) != FREE {
            return false;
        }
        self.state.compare_exchange(FREE, TAKEN, Acquire, Relaxed).is_ok()
    }

    fn lock(&self) {
        if self.state.compare_exchange(FREE, TAKEN, Acquire, Relaxed).is_ok() {
            return;
        }
        // From here on the lock is held in the contended state, even if no
        // one else ends up waiting, so the matching unlock wakes waiters.
        while self.state.swap(CONTENDED, Acquire) != FREE {
            futex::wait(&self.state, CONTENDED);
        }
    }

    unsafe fn unlock(&self) {
        let state = &self.state;
        let ptr = ptr::addr_of!(*state);
        if state.swap(FREE, Release) == CONTENDED {
            futex::wake_all(ptr);
        }
    }

    fn is_locked(&self) -> bool {
        self.state.load(Relaxed) != FREE
    }

    fn try_lock_or_wait(&self) -> bool {
        RawLock::try_lock(self) || self.wait()
    }
}

impl fmt::Debug for FutexLock {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Relaxed) {
            FREE => "free",
            TAKEN => "taken",
            _ => "contended",
        };
        f.debug_struct("FutexLock").field("state", &state).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::{FutexLock, CONTENDED, TAKEN};
    use crate::lock::RawLock;
    use crate::test::tests;

    #[test]
    fn smoke() {
        tests::smoke::<FutexLock>();
    }

    #[test]
    fn try_lock_fails_while_held() {
        tests::try_lock_while_held::<FutexLock>();
    }

    #[test]
    fn try_lock_or_wait_acquires_free() {
        tests::try_lock_or_wait_acquires_free::<FutexLock>();
    }

    #[test]
    fn try_lock_or_wait_blocks_until_unlock() {
        tests::try_lock_or_wait_returns_after_unlock::<FutexLock>();
    }

    #[test]
    fn lots_and_lots() {
        tests::lots_and_lots::<FutexLock>();
    }

    #[test]
    fn one_thread_per_increment() {
        tests::thread_per_increment::<FutexLock>(1);
        tests::thread_per_increment::<FutexLock>(128);
        tests::thread_per_increment::<FutexLock>(10_000);
    }

    #[test]
    fn uncontended_lock_stays_taken() {
        let lock = FutexLock::new();
        RawLock::lock(&lock);
        assert_eq!(lock.state.load(core::sync::atomic::Ordering::Relaxed), TAKEN);
        // SAFETY: The lock is held by this thread.
        unsafe { lock.unlock() };
        assert!(!lock.is_locked());
    }

    #[test]
    fn wait_marks_contended() {
        let lock = FutexLock::new();
        RawLock::lock(&lock);
        let lock = Arc::new(lock);
        let c_lock = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            // Wait returns once the main thread unlocks, or acquires the lock.
            while !c_lock.wait() {}
            // SAFETY: `wait` returned `true`, the lock is held by this thread.
            unsafe { c_lock.unlock() };
        });
        while lock.state.load(core::sync::atomic::Ordering::Relaxed) != CONTENDED {
            thread::yield_now();
        }
        // SAFETY: The lock is held by this thread.
        unsafe { lock.unlock() };
        handle.join().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_with_only_probes_between_waits() {
        let lock = FutexLock::new();
        RawLock::lock(&lock);
        for attempt in 0..FutexLock::WAIT_EVERY - 1 {
            assert!(!lock.try_lock_with(attempt));
        }
        // SAFETY: The lock is held by this thread.
        unsafe { lock.unlock() };
        assert!(lock.try_lock_with(FutexLock::WAIT_EVERY - 1));
        // SAFETY: The lock was just acquired by this thread.
        unsafe { lock.unlock() };
    }
}

#[cfg(all(loom, test))]
mod model {
    use super::FutexLock;
    use crate::loom::models;

    #[test]
    fn lock_join() {
        models::lock_join::<FutexLock>();
    }

    #[test]
    fn try_lock_join() {
        models::try_lock_join::<FutexLock>();
    }

    #[test]
    fn mixed_lock_join() {
        models::mixed_lock_join::<FutexLock>();
    }
}
