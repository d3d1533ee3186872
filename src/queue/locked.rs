use core::cell::UnsafeCell;
use core::fmt;
use std::collections::VecDeque;

use super::{DelegationQueue, Rejected, State};
use crate::cfg::debug_abort;
use crate::lock::RawLock;
use crate::locks::FutexLock;

/// A type erased operation, called with a pointer to the protected data.
type Entry = Box<dyn FnOnce(*mut ()) + Send>;

struct Inner {
    open: bool,
    entries: VecDeque<Entry>,
}

/// An unbounded delegation queue protected by a lock.
///
/// Once open, `enqueue` never refuses an operation, which makes this queue
/// suitable for wait queues where a bounded capacity would turn into
/// blocking. Every operation is boxed. Besides draining everything with
/// `flush`, single operations can be run with [`flush_one`].
///
/// [`flush_one`]: SimpleLockedQueue::flush_one
pub struct SimpleLockedQueue {
    lock: FutexLock,
    inner: UnsafeCell<Inner>,
}

// SAFETY: `inner` is only accessed while `lock` is held, and every entry is
// `Send`.
unsafe impl Send for SimpleLockedQueue {}
// SAFETY: Same as above.
unsafe impl Sync for SimpleLockedQueue {}

impl SimpleLockedQueue {
    /// Creates a new, closed queue.
    pub fn new() -> Self {
        let inner = Inner { open: false, entries: VecDeque::new() };
        Self { lock: FutexLock::new(), inner: UnsafeCell::new(inner) }
    }

    /// Runs `f` against the queue contents with the queue lock held.
    fn with_inner<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut Inner) -> Ret,
    {
        RawLock::lock(&self.lock);
        // SAFETY: The queue lock is held for the lifetime of the reference.
        let ret = f(unsafe { &mut *self.inner.get() });
        // SAFETY: The queue lock was acquired above.
        unsafe { self.lock.unlock() };
        ret
    }

    /// Runs the oldest pending operation against `data`, if there is one.
    ///
    /// Returns `true` if an operation was run. The queue state is left
    /// unchanged.
    ///
    /// # Safety
    ///
    /// Same as [`DelegationQueue::flush`].
    pub unsafe fn flush_one<T>(&self, data: &mut T) -> bool {
        let Some(entry) = self.with_inner(|inner| inner.entries.pop_front()) else {
            return false;
        };
        let ctx = (data as *mut T).cast::<()>();
        debug_abort::on_unwind(|| entry(ctx));
        true
    }

    /// Returns the number of pending operations.
    pub fn len(&self) -> usize {
        self.with_inner(|inner| inner.entries.len())
    }

    /// Returns `true` if there are no pending operations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DelegationQueue for SimpleLockedQueue {
    fn new() -> Self {
        Self::new()
    }

    fn open(&self) {
        self.with_inner(|inner| inner.open = true);
    }

    fn enqueue<T, F>(&self, op: F) -> Result<(), Rejected<F>>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.with_inner(|inner| {
            if !inner.open {
                return Err(Rejected::new(op, State::Closed));
            }
            inner.entries.push_back(Box::new(move |ctx: *mut ()| {
                // SAFETY: Flush callers guarantee that `ctx` points to the `T`
                // this operation was enqueued for, with no other references.
                op(unsafe { &mut *ctx.cast::<T>() })
            }));
            Ok(())
        })
    }

    unsafe fn flush<T>(&self, data: &mut T) {
        // Closing and taking the entries under the same lock acquisition
        // means nothing can be added after the take.
        let entries = self.with_inner(|inner| {
            inner.open = false;
            core::mem::take(&mut inner.entries)
        });
        let ctx = (data as *mut T).cast::<()>();
        for entry in entries {
            debug_abort::on_unwind(|| entry(ctx));
        }
    }

    fn state(&self) -> State {
        if self.with_inner(|inner| inner.open) {
            State::Open
        } else {
            State::Closed
        }
    }
}

impl Default for SimpleLockedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimpleLockedQueue {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (open, len) = self.with_inner(|inner| (inner.open, inner.entries.len()));
        f.debug_struct("SimpleLockedQueue").field("open", &open).field("len", &len).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::SimpleLockedQueue;
    use crate::queue::{DelegationQueue, State};

    #[test]
    fn rejects_until_open() {
        let queue = SimpleLockedQueue::new();
        assert_eq!(queue.state(), State::Closed);
        let rejected = queue.enqueue(|n: &mut u32| *n += 1).unwrap_err();
        assert_eq!(rejected.state(), State::Closed);
        queue.open();
        assert_eq!(queue.state(), State::Open);
        queue.enqueue(rejected.into_inner()).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn never_full() {
        let queue = SimpleLockedQueue::new();
        queue.open();
        for value in 0..10_000 {
            queue.enqueue(move |log: &mut Vec<u32>| log.push(value)).unwrap();
        }
        let mut log: Vec<u32> = Vec::new();
        // SAFETY: Single flusher, all operations act on `Vec<u32>`.
        unsafe { queue.flush(&mut log) };
        assert_eq!(log, (0..10_000).collect::<Vec<_>>());
        assert_eq!(queue.state(), State::Closed);
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_one_runs_oldest_first() {
        let queue = SimpleLockedQueue::new();
        queue.open();
        for value in 0..3 {
            queue.enqueue(move |log: &mut Vec<u32>| log.push(value)).unwrap();
        }
        let mut log: Vec<u32> = Vec::new();
        // SAFETY: Single flusher, all operations act on `Vec<u32>`.
        unsafe {
            assert!(queue.flush_one(&mut log));
            assert!(queue.flush_one(&mut log));
        }
        assert_eq!(log, [0, 1]);
        assert_eq!(queue.state(), State::Open);
        assert_eq!(queue.len(), 1);
        // SAFETY: Same as above.
        unsafe {
            assert!(queue.flush_one(&mut log));
            assert!(!queue.flush_one(&mut log));
        }
        assert_eq!(log, [0, 1, 2]);
    }

    #[test]
    fn concurrent_enqueue() {
        let queue = Arc::new(SimpleLockedQueue::new());
        queue.open();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for _ in 0..500 {
                        queue.enqueue(|n: &mut usize| *n += 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let mut count: usize = 0;
        // SAFETY: Single flusher, all operations act on `usize`.
        unsafe { queue.flush(&mut count) };
        assert_eq!(count, 4000);
    }
}
