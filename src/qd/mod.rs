//! The queue delegation lock.
//!
//! A [`QdLock`] owns its data and mediates every access to it. Threads hand
//! it operations through the [`Delegate`] trait; the first thread to acquire
//! the backing lock runs its own operation and then every operation other
//! threads delegated while it held the lock. Threads that lose the race do
//! not wait for the critical section to finish, they only wait until their
//! operation is accepted by the delegation queue.
//!
//! Plain critical sections are also supported through [`QdLock::lock`],
//! whose guard drains the delegation queue before releasing the lock.

use core::fmt;

use crate::delegate::Delegate;
use crate::lock::RawLock;
use crate::locks::FutexLock;
use crate::queue::{BufferQueue, DelegationQueue};

pub(crate) mod base;

use base::{NoReaders, QdBase};
pub use base::QdGuard;

/// Byte capacity of the default delegation queue.
pub const DEFAULT_QUEUE_SIZE: usize = 16384;

/// A queue delegation lock protecting a `T`.
///
/// `L` is the backing mutual exclusion lock, `Q` the delegation queue.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use qdlock::{Delegate, QdLock};
///
/// let log = Arc::new(QdLock::<Vec<u32>>::new(Vec::new()));
/// let c_log = Arc::clone(&log);
/// thread::spawn(move || c_log.delegate_no_result(|log| log.push(1)))
///     .join()
///     .unwrap();
///
/// // Waiting on a later operation orders every earlier one before it.
/// let len = log.delegate_with_result(|log| log.len()).get();
/// assert_eq!(len, 1);
///
/// log.lock().push(2);
/// assert_eq!(*log.lock(), [1, 2]);
/// ```
pub struct QdLock<T, L = FutexLock, Q = BufferQueue<DEFAULT_QUEUE_SIZE>> {
    base: QdBase<T, L, Q>,
}

impl<T, L: RawLock, Q: DelegationQueue> QdLock<T, L, Q> {
    /// Creates a new, unlocked delegation lock protecting `value`.
    pub fn new(value: T) -> Self {
        Self { base: QdBase::new(value) }
    }

    /// Consumes the lock, returning the protected data.
    pub fn into_inner(self) -> T {
        self.base.into_inner()
    }

    /// Returns a mutable reference to the protected data.
    ///
    /// The mutable borrow statically guarantees no other access exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.base.get_mut()
    }

    /// Acquires the lock for a plain critical section, blocking the current
    /// thread until it is able to do so.
    ///
    /// Operations delegated while the guard is alive run when it is dropped,
    /// before the lock is released.
    ///
    /// The guard holder may delegate to the same lock only while the queue
    /// has room. Once the queue is full such a delegation waits for the lock
    /// to be released, which never happens, and the thread deadlocks.
    pub fn lock(&self) -> QdGuard<'_, T, L, Q> {
        self.base.lock(&NoReaders)
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<QdGuard<'_, T, L, Q>> {
        self.base.try_lock(&NoReaders)
    }

    /// Returns `true` if the lock is currently held.
    ///
    /// This function does not guarantee strong ordering, only atomicity.
    pub fn is_locked(&self) -> bool {
        self.base.raw().is_locked()
    }
}

impl<T, L: RawLock, Q: DelegationQueue> Delegate for QdLock<T, L, Q> {
    type Target = T;

    fn delegate_no_result<F>(&self, op: F)
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.base.delegate(&NoReaders, op);
    }
}

impl<T: Default, L: RawLock, Q: DelegationQueue> Default for QdLock<T, L, Q> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, L: RawLock, Q: DelegationQueue> From<T> for QdLock<T, L, Q> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: fmt::Debug, L: RawLock, Q: DelegationQueue> fmt::Debug for QdLock<T, L, Q> {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.base, f)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use crate::delegate::Delegate;
    use crate::lock::RawLock;
    use crate::locks::{FutexLock, McsFutexLock, TatasLock, TicketFutexLock};
    use crate::queue::{BufferQueue, DelegationQueue, SimpleLockedQueue};
    use crate::relax::Yield;

    use super::QdLock;

    type Small = BufferQueue<256>;

    fn counts_every_delegation<L: RawLock + Send + Sync + 'static, Q>()
    where
        Q: DelegationQueue + Send + Sync + 'static,
    {
        let lock = Arc::new(QdLock::<u64, L, Q>::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..500 {
                        lock.delegate_no_result(|n| *n += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.delegate_with_result(|n| *n).get(), 4000);
    }

    #[test]
    fn counts_every_delegation_futex() {
        counts_every_delegation::<FutexLock, BufferQueue<16384>>();
    }

    #[test]
    fn counts_every_delegation_small_queue() {
        counts_every_delegation::<FutexLock, Small>();
    }

    #[test]
    fn counts_every_delegation_tatas() {
        counts_every_delegation::<TatasLock<Yield>, Small>();
    }

    #[test]
    fn counts_every_delegation_mcs() {
        counts_every_delegation::<McsFutexLock, Small>();
    }

    #[test]
    fn counts_every_delegation_ticket() {
        counts_every_delegation::<TicketFutexLock, Small>();
    }

    #[test]
    fn counts_every_delegation_locked_queue() {
        counts_every_delegation::<FutexLock, SimpleLockedQueue>();
    }

    #[test]
    fn uncontended_delegation_runs_inline() {
        let lock = QdLock::<u32>::new(1);
        lock.delegate_no_result(|n| *n += 1);
        // Nobody else was combining, so the caller ran the operation itself.
        assert_eq!(*lock.lock(), 2);
        assert!(!lock.is_locked());
    }

    #[test]
    fn four_shapes() {
        let lock = QdLock::<Vec<u32>>::new(Vec::new());
        lock.delegate_no_result(|log| log.push(1));
        assert_eq!(lock.delegate_with_result(|log| log.len()).get(), 1);

        let (promise, handle) = crate::promise::channel();
        lock.delegate_with_sink(promise, |log, promise| {
            log.push(2);
            promise.set(log.clone());
        });
        assert_eq!(handle.get(), [1, 2]);

        let handle = lock.delegate_with_promise(|log, promise| promise.set(log.iter().sum::<u32>()));
        assert_eq!(handle.get(), 3);

        let broken = lock.delegate_with_promise(|_, promise: crate::promise::Promise<u32>| drop(promise));
        assert_eq!(broken.try_get(), None);
    }

    #[test]
    fn delegations_under_guard_run_before_unlock() {
        let lock = Arc::new(QdLock::<Vec<u32>>::new(Vec::new()));
        let ran = Arc::new(AtomicUsize::new(0));
        let mut guard = lock.lock();
        guard.push(0);
        let c_lock = Arc::clone(&lock);
        let c_ran = Arc::clone(&ran);
        thread::spawn(move || {
            c_lock.delegate_no_result(move |log| {
                log.push(1);
                c_ran.fetch_add(1, Ordering::Relaxed);
            });
        })
        .join()
        .unwrap();
        // The queue is open while the guard is alive, so the delegation
        // was accepted without running.
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        drop(guard);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert_eq!(*lock.lock(), [0, 1]);
    }

    #[test]
    fn guard_holder_delegation_is_queued() {
        let lock = QdLock::<Vec<u32>>::new(Vec::new());
        let mut guard = lock.lock();
        guard.push(0);
        lock.delegate_no_result(|log| log.push(1));
        assert_eq!(*guard, [0]);
        drop(guard);
        assert_eq!(*lock.lock(), [0, 1]);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = QdLock::<u32>::new(0);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn get_mut_and_into_inner() {
        let mut lock = QdLock::<String>::new(String::from("a"));
        lock.get_mut().push('b');
        lock.delegate_no_result(|s| s.push('c'));
        assert_eq!(lock.into_inner(), "abc");
    }

    #[test]
    fn combiner_panic_releases_lock() {
        let lock = Arc::new(QdLock::<u32>::new(0));
        let c_lock = Arc::clone(&lock);
        let result = thread::spawn(move || c_lock.delegate_no_result(|_| panic!("boom"))).join();
        assert!(result.is_err());
        assert!(!lock.is_locked());
        assert_eq!(lock.delegate_with_result(|n| *n + 1).get(), 1);
    }
}
