use core::fmt;
use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};

use crate::cfg::atomic::{fence, AtomicU32};
use crate::cfg::futex;
use crate::lock::RawLock;
use crate::relax::{Relax, Spin};

/// A FIFO ticket lock that parks waiters on the "now serving" word.
///
/// `lock` draws a ticket and waits until it is being served, spinning for a
/// while and then blocking on a futex. Waiters register themselves in a
/// sleeper counter before blocking so that `unlock` only issues the wake
/// system call when someone may be asleep.
pub struct TicketFutexLock {
    next: AtomicU32,
    serving: AtomicU32,
    sleepers: AtomicU32,
}

impl TicketFutexLock {
    /// Number of spins before a waiter parks.
    #[cfg(not(all(loom, test)))]
    const SPINS: u32 = 256;

    // Loom yields on every spin hint, keep the modelled state space small.
    #[cfg(all(loom, test))]
    const SPINS: u32 = 1;

    /// Creates a new unlocked `TicketFutexLock`.
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        Self { next: AtomicU32::new(0), serving: AtomicU32::new(0), sleepers: AtomicU32::new(0) }
    }

    /// Creates a new unlocked `TicketFutexLock` with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn new() -> Self {
        Self { next: AtomicU32::new(0), serving: AtomicU32::new(0), sleepers: AtomicU32::new(0) }
    }

    /// Blocks while `serving` still holds `seen`.
    fn sleep(&self, seen: u32) {
        self.sleepers.fetch_add(1, Relaxed);
        // Pairs with the fence in `unlock`.
        fence(SeqCst);
        futex::wait(&self.serving, seen);
        self.sleepers.fetch_sub(1, Relaxed);
    }

    fn wait_turn(&self, ticket: u32) {
        let mut relax = Spin::new();
        for _ in 0..Self::SPINS {
            if self.serving.load(Acquire) == ticket {
                return;
            }
            relax.relax();
        }
        loop {
            let serving = self.serving.load(Acquire);
            if serving == ticket {
                return;
            }
            self.sleep(serving);
        }
    }
}

impl Default for TicketFutexLock {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Exactly one ticket matches the served number at any time, and it
// is only advanced by the holder with release ordering.
unsafe impl RawLock for TicketFutexLock {
    fn new() -> Self {
        Self::new()
    }

    fn try_lock(&self) -> bool {
        let serving = self.serving.load(Acquire);
        let next = serving.wrapping_add(1);
        self.next.compare_exchange(serving, next, Relaxed, Relaxed).is_ok()
    }

    fn lock(&self) {
        let ticket = self.next.fetch_add(1, Relaxed);
        self.wait_turn(ticket);
    }

    unsafe fn unlock(&self) {
        let serving = &self.serving;
        let ptr = ptr::addr_of!(*serving);
        serving.fetch_add(1, Release);
        fence(SeqCst);
        if self.sleepers.load(Relaxed) != 0 {
            futex::wake_all(ptr);
        }
    }

    fn is_locked(&self) -> bool {
        self.next.load(Relaxed) != self.serving.load(Relaxed)
    }

    fn try_lock_or_wait(&self) -> bool {
        if RawLock::try_lock(self) {
            return true;
        }
        let serving = self.serving.load(Acquire);
        if self.next.load(Relaxed) != serving {
            self.sleep(serving);
        }
        false
    }
}

impl fmt::Debug for TicketFutexLock {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketFutexLock")
            .field("next", &self.next.load(Relaxed))
            .field("serving", &self.serving.load(Relaxed))
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::TicketFutexLock;
    use crate::lock::RawLock;
    use crate::test::tests;

    #[test]
    fn smoke() {
        tests::smoke::<TicketFutexLock>();
    }

    #[test]
    fn try_lock_fails_while_held() {
        tests::try_lock_while_held::<TicketFutexLock>();
    }

    #[test]
    fn try_lock_or_wait_acquires_free() {
        tests::try_lock_or_wait_acquires_free::<TicketFutexLock>();
    }

    #[test]
    fn try_lock_or_wait_blocks_until_unlock() {
        tests::try_lock_or_wait_returns_after_unlock::<TicketFutexLock>();
    }

    #[test]
    fn lots_and_lots() {
        tests::lots_and_lots::<TicketFutexLock>();
    }

    #[test]
    fn one_thread_per_increment() {
        tests::thread_per_increment::<TicketFutexLock>(1);
        tests::thread_per_increment::<TicketFutexLock>(128);
        tests::thread_per_increment::<TicketFutexLock>(10_000);
    }

    #[test]
    fn tickets_wrap_around() {
        let lock = TicketFutexLock::new();
        lock.next.store(u32::MAX, core::sync::atomic::Ordering::Relaxed);
        lock.serving.store(u32::MAX, core::sync::atomic::Ordering::Relaxed);
        for _ in 0..4 {
            RawLock::lock(&lock);
            assert!(lock.is_locked());
            // SAFETY: The lock is held by this thread.
            unsafe { lock.unlock() };
            assert!(!lock.is_locked());
        }
    }
}

#[cfg(all(loom, test))]
mod model {
    use super::TicketFutexLock;
    use crate::loom::models;

    #[test]
    fn lock_join() {
        models::lock_join::<TicketFutexLock>();
    }

    #[test]
    fn try_lock_join() {
        models::try_lock_join::<TicketFutexLock>();
    }

    #[test]
    fn mixed_lock_join() {
        models::mixed_lock_join::<TicketFutexLock>();
    }
}
