//! The reader/writer queue delegation lock.
//!
//! [`MrQdLock`] extends [`QdLock`](crate::QdLock) with read sections that
//! bypass the delegation queue entirely. Readers only announce themselves
//! in a [`ReaderIndicator`]; a new combiner waits for the readers that got
//! in before it to leave, and readers stay out while the backing lock is
//! held.
//!
//! Writers are preferred until a reader has waited for [`PATIENCE`] spins.
//! That reader then raises the write barrier, which keeps new writers from
//! acquiring the lock until the reader got its turn.
//!
//! [`PATIENCE`]: DEFAULT_READ_PATIENCE

use core::fmt;
use core::ops::Deref;
use core::sync::atomic::Ordering::{Acquire, Relaxed, SeqCst};

use crossbeam_utils::CachePadded;

use crate::cfg::atomic::{fence, AtomicUsize};
use crate::delegate::Delegate;
use crate::lock::RawLock;
use crate::locks::FutexLock;
use crate::qd::base::{QdBase, ReaderSync};
use crate::qd::{QdGuard, DEFAULT_QUEUE_SIZE};
use crate::queue::{BufferQueue, DelegationQueue};
use crate::reader::{ReaderGroups, ReaderIndicator, ThreadIndex};
use crate::relax::{Relax, Spin};

/// Shard count of the default reader indicator.
pub const DEFAULT_READER_GROUPS: usize = 64;

/// Spins a reader waits for a writer before raising the write barrier.
pub const DEFAULT_READ_PATIENCE: usize = 65536;

/// A reader/writer queue delegation lock protecting a `T`.
///
/// Writes go through [`Delegate`] or [`lock`](MrQdLock::lock) exactly as
/// with [`QdLock`](crate::QdLock). Reads take a [`ReadGuard`] with
/// [`rlock`](MrQdLock::rlock) and run concurrently with each other, never
/// with a combining pass.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use qdlock::{Delegate, MrQdLock};
///
/// let config = Arc::new(MrQdLock::<Vec<u32>>::new(vec![1, 2]));
/// let c_config = Arc::clone(&config);
/// thread::spawn(move || c_config.delegate_no_result(|v| v.push(3)))
///     .join()
///     .unwrap();
///
/// let sum: u32 = config.rlock().iter().sum();
/// assert_eq!(sum, 6);
/// ```
pub struct MrQdLock<
    T,
    L = FutexLock,
    Q = BufferQueue<DEFAULT_QUEUE_SIZE>,
    R = ReaderGroups<DEFAULT_READER_GROUPS>,
    const PATIENCE: usize = DEFAULT_READ_PATIENCE,
> {
    base: QdBase<T, L, Q>,
    write_barrier: CachePadded<AtomicUsize>,
    readers: R,
}

// SAFETY: Read guards hand out `&T` to several threads at once, so on top
// of the delegation engine's requirements `T` must be `Sync`.
unsafe impl<T, L, Q, R, const PATIENCE: usize> Sync for MrQdLock<T, L, Q, R, PATIENCE>
where
    T: Send + Sync,
    L: Sync,
    Q: Sync,
    R: Sync,
{
}

impl<T, L, Q, R, const PATIENCE: usize> MrQdLock<T, L, Q, R, PATIENCE>
where
    L: RawLock,
    Q: DelegationQueue,
    R: ReaderIndicator,
{
    /// Creates a new, unlocked reader/writer delegation lock protecting
    /// `value`.
    pub fn new(value: T) -> Self {
        let write_barrier = CachePadded::new(AtomicUsize::new(0));
        Self { base: QdBase::new(value), write_barrier, readers: R::new() }
    }

    /// Consumes the lock, returning the protected data.
    pub fn into_inner(self) -> T {
        self.base.into_inner()
    }

    /// Returns a mutable reference to the protected data.
    pub fn get_mut(&mut self) -> &mut T {
        self.base.get_mut()
    }

    /// Acquires the lock for a plain write section.
    ///
    /// Waits for the write barrier to clear, acquires the backing lock and
    /// then waits for every active reader to leave.
    ///
    /// As with [`QdLock::lock`](crate::QdLock::lock), delegating to this lock
    /// while holding the guard deadlocks once the queue is full.
    pub fn lock(&self) -> QdGuard<'_, T, L, Q> {
        self.base.lock(self)
    }

    /// Attempts to acquire the lock for a write section without waiting for
    /// the backing lock.
    ///
    /// Readers already inside are still waited for.
    pub fn try_lock(&self) -> Option<QdGuard<'_, T, L, Q>> {
        self.base.try_lock(self)
    }

    /// Returns `true` if a writer currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.base.raw().is_locked()
    }

    /// Enters a read section, counting the reader in the shard of the
    /// calling thread.
    pub fn rlock(&self) -> ReadGuard<'_, T, L, Q, R, PATIENCE> {
        self.rlock_in(ThreadIndex::current())
    }

    /// Enters a read section, counting the reader in the shard picked by
    /// `index`.
    pub fn rlock_in(&self, index: ThreadIndex) -> ReadGuard<'_, T, L, Q, R, PATIENCE> {
        let lock = self.base.raw();
        let mut raised = false;
        let mut patience = 0;
        let mut relax = Spin::new();
        loop {
            self.readers.arrive(index);
            // Orders the arrival before the lock probe, pairs with the fence
            // a new combiner issues before querying the readers.
            fence(SeqCst);
            if !lock.is_locked() {
                break;
            }
            // Never stay counted while a writer holds the lock, it would wait
            // for this reader forever.
            self.readers.depart(index);
            while lock.is_locked() {
                relax.relax();
                if patience == PATIENCE && !raised {
                    self.write_barrier.fetch_add(1, Relaxed);
                    raised = true;
                    log::debug!("reader out of patience, raising the write barrier");
                }
                patience += 1;
            }
        }
        // Synchronizes with the release in the last writer's unlock.
        fence(Acquire);
        if raised {
            self.write_barrier.fetch_sub(1, Relaxed);
        }
        ReadGuard { lock: self, index }
    }
}

impl<T, L, Q, R, const PATIENCE: usize> ReaderSync for MrQdLock<T, L, Q, R, PATIENCE>
where
    R: ReaderIndicator,
{
    fn wait_writers(&self) {
        let mut relax = Spin::new();
        while self.write_barrier.load(Relaxed) > 0 {
            relax.relax();
        }
    }

    fn wait_readers(&self) {
        // Pairs with the fence readers issue between arriving and probing
        // the lock: either they see it held or this query sees them.
        fence(SeqCst);
        let mut relax = Spin::new();
        while self.readers.query() {
            relax.relax();
        }
        // Synchronizes with the release of the departing readers.
        fence(Acquire);
    }
}

impl<T, L, Q, R, const PATIENCE: usize> Delegate for MrQdLock<T, L, Q, R, PATIENCE>
where
    L: RawLock,
    Q: DelegationQueue,
    R: ReaderIndicator,
{
    type Target = T;

    fn delegate_no_result<F>(&self, op: F)
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.base.delegate(self, op);
    }
}

impl<T, L, Q, R, const PATIENCE: usize> Default for MrQdLock<T, L, Q, R, PATIENCE>
where
    T: Default,
    L: RawLock,
    Q: DelegationQueue,
    R: ReaderIndicator,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, L, Q, R, const PATIENCE: usize> fmt::Debug for MrQdLock<T, L, Q, R, PATIENCE>
where
    T: fmt::Debug,
    L: RawLock,
    Q: DelegationQueue,
    R: ReaderIndicator,
{
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.base, f)
    }
}

/// An RAII guard over a read section of a [`MrQdLock`].
///
/// The reader is counted out when the guard is dropped.
#[must_use = "if unused the read section ends immediately"]
pub struct ReadGuard<'a, T, L, Q, R: ReaderIndicator, const PATIENCE: usize> {
    lock: &'a MrQdLock<T, L, Q, R, PATIENCE>,
    index: ThreadIndex,
}

impl<T, L, Q, R: ReaderIndicator, const PATIENCE: usize> Deref for ReadGuard<'_, T, L, Q, R, PATIENCE> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The reader is counted in, so no combiner can start before
        // the guard is dropped, and any earlier combiner has unlocked.
        unsafe { &*self.lock.base.data_ptr() }
    }
}

impl<T, L, Q, R: ReaderIndicator, const PATIENCE: usize> Drop for ReadGuard<'_, T, L, Q, R, PATIENCE> {
    fn drop(&mut self) {
        self.lock.readers.depart(self.index);
    }
}

impl<T, L, Q, R, const PATIENCE: usize> fmt::Debug for ReadGuard<'_, T, L, Q, R, PATIENCE>
where
    T: fmt::Debug,
    R: ReaderIndicator,
{
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::MrQdLock;
    use crate::delegate::Delegate;
    use crate::locks::{FutexLock, TatasLock};
    use crate::queue::BufferQueue;
    use crate::reader::{ReaderGroups, ThreadIndex};
    use crate::relax::Yield;

    type Impatient<T> = MrQdLock<T, FutexLock, BufferQueue<1024>, ReaderGroups<4>, 16>;

    #[derive(Default)]
    struct Pair {
        a: u64,
        b: u64,
    }

    #[test]
    fn readers_share_the_data() {
        let lock = MrQdLock::<u32>::new(7);
        let first = lock.rlock();
        let second = lock.rlock_in(ThreadIndex::new(3));
        assert_eq!(*first + *second, 14);
        assert!(!lock.is_locked());
    }

    #[test]
    fn read_guard_derefs_and_formats() {
        let lock = MrQdLock::<Vec<u32>>::new(vec![1, 2]);
        let guard = lock.rlock();
        assert_eq!(guard.len(), 2);
        assert_eq!(format!("{guard:?}"), "[1, 2]");
    }

    #[test]
    fn writer_waits_for_readers() {
        let lock = Arc::new(MrQdLock::<u32>::new(0));
        let written = Arc::new(AtomicBool::new(false));
        let guard = lock.rlock();
        let c_lock = Arc::clone(&lock);
        let c_written = Arc::clone(&written);
        let writer = thread::spawn(move || {
            *c_lock.lock() = 1;
            c_written.store(true, Ordering::Release);
        });
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!written.load(Ordering::Acquire));
        assert_eq!(*guard, 0);
        drop(guard);
        writer.join().unwrap();
        assert_eq!(*lock.rlock(), 1);
    }

    #[test]
    fn reader_waits_for_writer() {
        let lock = Arc::new(MrQdLock::<u32>::new(0));
        let mut guard = lock.lock();
        let c_lock = Arc::clone(&lock);
        let reader = thread::spawn(move || *c_lock.rlock());
        thread::sleep(std::time::Duration::from_millis(50));
        *guard = 5;
        drop(guard);
        assert_eq!(reader.join().unwrap(), 5);
    }

    #[test]
    fn impatient_reader_raises_barrier() {
        let lock = Arc::new(Impatient::<u32>::new(0));
        let guard = lock.lock();
        let c_lock = Arc::clone(&lock);
        let reader = thread::spawn(move || *c_lock.rlock());
        while lock.write_barrier.load(Ordering::Relaxed) == 0 {
            thread::yield_now();
        }
        drop(guard);
        reader.join().unwrap();
        assert_eq!(lock.write_barrier.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn readers_never_see_torn_pairs() {
        let lock = Arc::new(Impatient::<Pair>::default());
        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut reads = 0_u64;
                    while !done.load(Ordering::Relaxed) || reads == 0 {
                        let pair = lock.rlock();
                        assert_eq!(pair.a, pair.b);
                        reads += 1;
                    }
                    reads
                })
            })
            .collect();
        let writers: Vec<_> = (0..2)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        lock.delegate_no_result(|pair| {
                            pair.a += 1;
                            pair.b += 1;
                        });
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        let pair = lock.delegate_with_result(|pair| (pair.a, pair.b)).get();
        assert_eq!(pair, (4000, 4000));
    }

    #[test]
    fn spinning_backing_lock() {
        let lock = Arc::new(MrQdLock::<u64, TatasLock<Yield>>::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..250 {
                        lock.delegate_no_result(|n| *n += 1);
                        let _ = *lock.rlock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.delegate_with_result(|n| *n).get(), 1000);
    }
}
