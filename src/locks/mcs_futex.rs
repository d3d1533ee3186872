use core::cell::UnsafeCell;
use core::fmt;
use core::ptr;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};

use crate::cfg::atomic::{fence, AtomicPtr, AtomicU32};
use crate::cfg::futex;
use crate::lock::RawLock;
use crate::relax::{Relax, Spin};

const FREE: u32 = 0;
const TAKEN: u32 = 1;
const CONTENDED: u32 = 2;

/// An MCS queue lock whose waiters park on their own queue node.
///
/// Every acquisition takes a node from a thread local pool, swaps it onto
/// the tail of the lock's queue and links it behind the previous tail.
/// Waiters spin briefly on their own node and then block on it through a
/// futex, so each hand-off wakes exactly the one thread that is next in
/// line.
///
/// Threads that only want to know when the lock is released, without
/// joining the queue, call [`try_lock_or_wait`]. They are counted in a
/// sleeper counter that is kept apart from the queue tail, every unlock
/// that observes sleepers bumps a wake sequence word and wakes them.
///
/// # Example
///
/// ```
/// use qdlock::locks::McsFutexLock;
/// use qdlock::RawLock;
///
/// let first = McsFutexLock::new();
/// let second = McsFutexLock::new();
/// first.lock();
/// second.lock();
/// // SAFETY: Both locks are held by this thread.
/// unsafe {
///     first.unlock();
///     second.unlock();
/// }
/// ```
///
/// [`try_lock_or_wait`]: RawLock::try_lock_or_wait
pub struct McsFutexLock {
    tail: AtomicPtr<Node>,
    holder: UnsafeCell<*mut Node>,
    sleepers: AtomicU32,
    wake_seq: AtomicU32,
}

// SAFETY: `holder` is only accessed by the thread that currently holds the
// lock, every other field is atomic.
unsafe impl Send for McsFutexLock {}
// SAFETY: Same as above.
unsafe impl Sync for McsFutexLock {}

impl McsFutexLock {
    /// Number of spins on the own node before parking.
    const SPINS: u32 = 512;

    /// Creates a new unlocked `McsFutexLock`.
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
            holder: UnsafeCell::new(ptr::null_mut()),
            sleepers: AtomicU32::new(0),
            wake_seq: AtomicU32::new(0),
        }
    }

    /// Creates a new unlocked `McsFutexLock` with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn new() -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
            holder: UnsafeCell::new(ptr::null_mut()),
            sleepers: AtomicU32::new(0),
            wake_seq: AtomicU32::new(0),
        }
    }

    /// Records `node` as the node of the current holder.
    ///
    /// # Safety
    ///
    /// Caller must hold the lock.
    unsafe fn set_holder(&self, node: *mut Node) {
        // SAFETY: Only the holder touches `holder`, caller holds the lock.
        unsafe { *self.holder.get() = node };
    }

    /// Blocks until the predecessor hands the lock over to `node`.
    fn wait_handoff(node: &Node) {
        let mut relax = Spin::new();
        for _ in 0..Self::SPINS {
            if node.is_locked.load(Acquire) == FREE {
                return;
            }
            relax.relax();
        }
        if node.is_locked.swap(CONTENDED, Acquire) == FREE {
            return;
        }
        while node.is_locked.load(Acquire) != FREE {
            futex::wait(&node.is_locked, CONTENDED);
        }
    }

    /// Wakes threads blocked in `try_lock_or_wait`, if any.
    fn wake_sleepers(&self) {
        // Pairs with the fence in `try_lock_or_wait`: either the sleeper
        // sees the lock state published by this unlock, or this unlock
        // sees the sleeper.
        fence(SeqCst);
        if self.sleepers.load(Relaxed) != 0 {
            let wake_seq = &self.wake_seq;
            let ptr = ptr::addr_of!(*wake_seq);
            wake_seq.fetch_add(1, Release);
            futex::wake_all(ptr);
        }
    }
}

impl Default for McsFutexLock {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: The lock is acquired either by installing a node on an empty tail
// or by receiving a release hand-off on the own node, both with acquire
// ordering. Only the holder removes its node or hands off.
unsafe impl RawLock for McsFutexLock {
    fn new() -> Self {
        Self::new()
    }

    fn try_lock(&self) -> bool {
        if !self.tail.load(Relaxed).is_null() {
            return false;
        }
        let node = pool::acquire();
        let null = ptr::null_mut();
        if self.tail.compare_exchange(null, node, AcqRel, Relaxed).is_ok() {
            // SAFETY: The lock was just acquired.
            unsafe { self.set_holder(node) };
            true
        } else {
            pool::release(node);
            false
        }
    }

    fn lock(&self) {
        let node = pool::acquire();
        let pred = self.tail.swap(node, AcqRel);
        if !pred.is_null() {
            // SAFETY: The predecessor can not release its node before it has
            // observed this link, since it is no longer the tail.
            unsafe { &*pred }.next.store(node, Release);
            // SAFETY: The node is owned by this thread until it is released
            // back to the pool.
            Self::wait_handoff(unsafe { &*node });
        }
        // SAFETY: The lock was just acquired.
        unsafe { self.set_holder(node) };
    }

    unsafe fn unlock(&self) {
        // SAFETY: Caller holds the lock, so `holder` is its node.
        let node = unsafe { *self.holder.get() };
        // SAFETY: Our node is alive until we release it to the pool.
        let this = unsafe { &*node };
        let mut next = this.next.load(Acquire);
        if next.is_null() {
            let null = ptr::null_mut();
            if self.tail.compare_exchange(node, null, Release, Relaxed).is_ok() {
                pool::release(node);
                self.wake_sleepers();
                return;
            }
            // A successor swapped itself onto the tail but has not linked yet.
            let mut relax = Spin::new();
            loop {
                next = this.next.load(Acquire);
                if !next.is_null() {
                    break;
                }
                relax.relax();
            }
        }
        // SAFETY: The successor blocks until its flag is set to `FREE`, so its
        // node is alive at least until the swap below. After the swap only
        // the address is used.
        let is_locked = unsafe { &(*next).is_locked };
        let ptr = ptr::addr_of!(*is_locked);
        if is_locked.swap(FREE, Release) == CONTENDED {
            futex::wake_one(ptr);
        }
        pool::release(node);
        self.wake_sleepers();
    }

    fn is_locked(&self) -> bool {
        !self.tail.load(Relaxed).is_null()
    }

    fn try_lock_or_wait(&self) -> bool {
        if RawLock::try_lock(self) {
            return true;
        }
        let seq = self.wake_seq.load(Acquire);
        self.sleepers.fetch_add(1, Relaxed);
        fence(SeqCst);
        if RawLock::is_locked(self) {
            futex::wait(&self.wake_seq, seq);
        }
        self.sleepers.fetch_sub(1, Relaxed);
        false
    }
}

impl fmt::Debug for McsFutexLock {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McsFutexLock")
            .field("locked", &RawLock::is_locked(self))
            .field("sleepers", &self.sleepers.load(Relaxed))
            .finish()
    }
}

/// A queue record, owned by one thread at a time.
struct Node {
    is_locked: AtomicU32,
    next: AtomicPtr<Node>,
}

impl Node {
    fn new() -> Self {
        Self { is_locked: AtomicU32::new(TAKEN), next: AtomicPtr::new(ptr::null_mut()) }
    }
}

/// Thread local free list of queue nodes.
///
/// Nodes are heap allocated so that their address stays stable while they
/// are linked into a queue, and recycled so the common path does not
/// allocate.
mod pool {
    use core::cell::RefCell;
    use core::ptr;
    use core::sync::atomic::Ordering::Relaxed;

    use super::{Node, TAKEN};

    std::thread_local! {
        static NODES: RefCell<Vec<Box<Node>>> = const { RefCell::new(Vec::new()) };
    }

    /// Returns a node ready to be linked into a queue.
    pub fn acquire() -> *mut Node {
        let node = NODES.try_with(|nodes| nodes.borrow_mut().pop()).ok().flatten();
        let node = node.unwrap_or_else(|| {
            log::trace!("allocating a new MCS queue node");
            Box::new(Node::new())
        });
        node.next.store(ptr::null_mut(), Relaxed);
        node.is_locked.store(TAKEN, Relaxed);
        Box::into_raw(node)
    }

    /// Gives a node back to the current thread's free list.
    ///
    /// If the thread local storage is already gone the node is freed.
    pub fn release(node: *mut Node) {
        // SAFETY: `node` was created by `acquire` and is no longer linked.
        let node = unsafe { Box::from_raw(node) };
        let _ = NODES.try_with(move |nodes| nodes.borrow_mut().push(node));
    }

    #[cfg(all(not(loom), test))]
    pub fn len() -> usize {
        NODES.with(|nodes| nodes.borrow().len())
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::{pool, McsFutexLock};
    use crate::lock::RawLock;
    use crate::test::tests;

    #[test]
    fn smoke() {
        tests::smoke::<McsFutexLock>();
    }

    #[test]
    fn try_lock_fails_while_held() {
        tests::try_lock_while_held::<McsFutexLock>();
    }

    #[test]
    fn try_lock_or_wait_acquires_free() {
        tests::try_lock_or_wait_acquires_free::<McsFutexLock>();
    }

    #[test]
    fn try_lock_or_wait_blocks_until_unlock() {
        tests::try_lock_or_wait_returns_after_unlock::<McsFutexLock>();
    }

    #[test]
    fn lots_and_lots() {
        tests::lots_and_lots::<McsFutexLock>();
    }

    #[test]
    fn one_thread_per_increment() {
        tests::thread_per_increment::<McsFutexLock>(1);
        tests::thread_per_increment::<McsFutexLock>(128);
        tests::thread_per_increment::<McsFutexLock>(10_000);
    }

    #[test]
    fn nodes_are_recycled() {
        let lock = McsFutexLock::new();
        RawLock::lock(&lock);
        // SAFETY: The lock is held by this thread.
        unsafe { lock.unlock() };
        let pooled = pool::len();
        assert!(pooled >= 1);
        for _ in 0..16 {
            RawLock::lock(&lock);
            // SAFETY: The lock is held by this thread.
            unsafe { lock.unlock() };
        }
        assert_eq!(pool::len(), pooled);
    }

    #[test]
    fn nested_locks_keep_their_own_nodes() {
        let outer = Arc::new(McsFutexLock::new());
        let inner = Arc::new(McsFutexLock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let outer = Arc::clone(&outer);
                let inner = Arc::clone(&inner);
                thread::spawn(move || {
                    for _ in 0..500 {
                        RawLock::lock(&*outer);
                        RawLock::lock(&*inner);
                        // SAFETY: Both locks are held by this thread.
                        unsafe {
                            inner.unlock();
                            outer.unlock();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!outer.is_locked());
        assert!(!inner.is_locked());
    }
}
