use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::lock::RawLock;
use crate::queue::DelegationQueue;
use crate::relax::{Relax, Spin};

/// Failed combine or enqueue rounds before a delegating thread blocks on
/// the backing lock instead of spinning.
const BLOCK_AFTER: u32 = 32;

/// Synchronization between the delegation engine and readers that bypass
/// the queue.
pub trait ReaderSync {
    /// Blocks new writers while readers ask for priority.
    fn wait_writers(&self);

    /// Called by a new combiner that already holds the backing lock, blocks
    /// until every reader that got in before it has left.
    fn wait_readers(&self);
}

/// The reader policy of locks that have no readers.
pub struct NoReaders;

impl ReaderSync for NoReaders {
    #[inline(always)]
    fn wait_writers(&self) {}

    #[inline(always)]
    fn wait_readers(&self) {}
}

/// The delegation engine: a backing lock, a delegation queue and the data
/// they protect.
///
/// Whoever acquires the backing lock becomes the combiner. It opens the
/// queue, runs its own operation, drains every operation other threads
/// managed to enqueue in the meantime and only then releases the lock. The
/// drain and release happen when the [`QdGuard`] is dropped.
pub struct QdBase<T, L, Q> {
    lock: L,
    queue: Q,
    data: UnsafeCell<T>,
}

// SAFETY: The data is only accessed by the combiner, which is unique while
// it holds the backing lock, and delegated operations are `Send`.
unsafe impl<T: Send, L: Sync, Q: Sync> Sync for QdBase<T, L, Q> {}

impl<T, L, Q> QdBase<T, L, Q> {
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    pub fn raw(&self) -> &L {
        &self.lock
    }
}

impl<T, L: RawLock, Q: DelegationQueue> QdBase<T, L, Q> {
    pub fn new(value: T) -> Self {
        Self { lock: L::new(), queue: Q::new(), data: UnsafeCell::new(value) }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Turns the current thread into the combiner.
    ///
    /// # Safety
    ///
    /// The backing lock must be held by the caller.
    unsafe fn enter<S: ReaderSync>(&self, sync: &S) -> QdGuard<'_, T, L, Q> {
        self.queue.open();
        sync.wait_readers();
        QdGuard { base: self, marker: PhantomData }
    }

    /// Acquires the backing lock for a plain critical section.
    pub fn lock<S: ReaderSync>(&self, sync: &S) -> QdGuard<'_, T, L, Q> {
        sync.wait_writers();
        self.lock.lock();
        // SAFETY: The lock was just acquired.
        unsafe { self.enter(sync) }
    }

    /// Acquires the backing lock if it is free.
    pub fn try_lock<S: ReaderSync>(&self, sync: &S) -> Option<QdGuard<'_, T, L, Q>> {
        // SAFETY: The lock is held if `try_lock` succeeded.
        self.lock.try_lock().then(|| unsafe { self.enter(sync) })
    }

    /// Runs `op` either as the combiner or through the current combiner.
    ///
    /// Returns once `op` has either run or been accepted by the queue.
    pub fn delegate<S, F>(&self, sync: &S, op: F)
    where
        S: ReaderSync,
        F: FnOnce(&mut T) + Send + 'static,
    {
        sync.wait_writers();
        let mut op = op;
        let mut relax = Spin::new();
        let mut rounds = 0;
        loop {
            let acquired = if rounds < BLOCK_AFTER {
                self.lock.try_lock()
            } else {
                rounds = 0;
                log::trace!("delegating thread blocks until the combiner unlocks");
                self.lock.try_lock_or_wait()
            };
            if acquired {
                // SAFETY: The lock was just acquired.
                let mut guard = unsafe { self.enter(sync) };
                op(&mut *guard);
                return;
            }
            match self.queue.enqueue::<T, F>(op) {
                Ok(()) => return,
                Err(rejected) => op = rejected.into_inner(),
            }
            rounds += 1;
            relax.relax();
        }
    }
}

impl<T: fmt::Debug, L: RawLock, Q: DelegationQueue> fmt::Debug for QdBase<T, L, Q> {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("QdLock");
        match self.lock.try_lock() {
            true => {
                // SAFETY: The lock is held, and the queue is closed so no
                // operation can be pending for it.
                d.field("data", unsafe { &&*self.data.get() });
                // SAFETY: Acquired above.
                unsafe { self.lock.unlock() };
            }
            false => {
                d.field("data", &format_args!("<locked>"));
            }
        }
        d.finish()
    }
}

/// An RAII guard over the data of a delegation lock, held by the combiner.
///
/// Dropping the guard runs every operation delegated while it was alive and
/// then releases the lock.
#[must_use = "if unused the lock will immediately unlock"]
pub struct QdGuard<'a, T, L: RawLock, Q: DelegationQueue> {
    base: &'a QdBase<T, L, Q>,
    marker: PhantomData<&'a mut T>,
}

impl<T, L: RawLock, Q: DelegationQueue> Deref for QdGuard<'_, T, L, Q> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard holds the backing lock.
        unsafe { &*self.base.data.get() }
    }
}

impl<T, L: RawLock, Q: DelegationQueue> DerefMut for QdGuard<'_, T, L, Q> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard holds the backing lock.
        unsafe { &mut *self.base.data.get() }
    }
}

impl<T, L: RawLock, Q: DelegationQueue> Drop for QdGuard<'_, T, L, Q> {
    fn drop(&mut self) {
        let base = self.base;
        // SAFETY: The guard holds the backing lock, which makes this thread
        // the only flusher, and the engine only enqueues operations on `T`.
        unsafe { base.queue.flush(&mut *base.data.get()) };
        // SAFETY: The guard holds the backing lock.
        unsafe { base.lock.unlock() };
    }
}

impl<T: fmt::Debug, L: RawLock, Q: DelegationQueue> fmt::Debug for QdGuard<'_, T, L, Q> {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display, L: RawLock, Q: DelegationQueue> fmt::Display for QdGuard<'_, T, L, Q> {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}
