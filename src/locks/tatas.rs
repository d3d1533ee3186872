use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicBool;
use crate::lock::RawLock;
use crate::relax::{Relax, Spin};

/// A test-and-test-and-set spin lock.
///
/// `try_lock` first reads the lock state and only attempts the exchange if
/// the lock looked free, so that waiting threads spin on a shared cache
/// line instead of invalidating it. `lock` never blocks in the kernel, it
/// spins running the `R` relax strategy between attempts.
///
/// # Example
///
/// ```
/// use qdlock::locks::TatasLock;
/// use qdlock::RawLock;
///
/// let lock = <TatasLock>::new();
/// lock.lock();
/// assert!(lock.is_locked());
/// assert!(!lock.try_lock());
/// // SAFETY: The lock is held by this thread.
/// unsafe { lock.unlock() };
/// ```
pub struct TatasLock<R = Spin> {
    locked: AtomicBool,
    marker: PhantomData<R>,
}

impl<R> TatasLock<R> {
    /// Creates a new unlocked `TatasLock`.
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        Self { locked: AtomicBool::new(false), marker: PhantomData }
    }

    /// Creates a new unlocked `TatasLock` with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn new() -> Self {
        Self { locked: AtomicBool::new(false), marker: PhantomData }
    }
}

impl<R> Default for TatasLock<R> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: A successful exchange from `false` to `true` is the only way to
// acquire the lock, and only the holder stores `false` back.
unsafe impl<R: Relax> RawLock for TatasLock<R> {
    fn new() -> Self {
        Self::new()
    }

    fn try_lock(&self) -> bool {
        if self.locked.load(Relaxed) {
            return false;
        }
        self.locked.compare_exchange(false, true, Acquire, Relaxed).is_ok()
    }

    fn lock(&self) {
        let mut relax = R::new();
        while !self.try_lock() {
            relax.relax();
        }
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

impl<R> fmt::Debug for TatasLock<R> {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TatasLock").field("locked", &self.locked.load(Relaxed)).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::TatasLock;
    use crate::relax::{Spin, Yield};
    use crate::test::tests;

    #[test]
    fn smoke() {
        tests::smoke::<TatasLock<Spin>>();
    }

    #[test]
    fn try_lock_fails_while_held() {
        tests::try_lock_while_held::<TatasLock<Spin>>();
    }

    #[test]
    fn try_lock_or_wait_does_not_block() {
        tests::try_lock_or_wait_acquires_free::<TatasLock<Spin>>();
    }

    #[test]
    fn lots_and_lots_spin() {
        tests::lots_and_lots::<TatasLock<Spin>>();
    }

    #[test]
    fn lots_and_lots_yield() {
        tests::lots_and_lots::<TatasLock<Yield>>();
    }

    #[test]
    fn one_thread_per_increment() {
        tests::thread_per_increment::<TatasLock<Yield>>(1);
        tests::thread_per_increment::<TatasLock<Yield>>(128);
        tests::thread_per_increment::<TatasLock<Yield>>(10_000);
    }
}

#[cfg(all(loom, test))]
mod model {
    use super::TatasLock;
    use crate::loom::models;
    use crate::relax::Yield;

    #[test]
    fn lock_join() {
        models::lock_join::<TatasLock<Yield>>();
    }

    #[test]
    fn try_lock_join() {
        models::try_lock_join::<TatasLock<Yield>>();
    }

    #[test]
    fn mixed_lock_join() {
        models::mixed_lock_join::<TatasLock<Yield>>();
    }
}
