use core::fmt;
use std::sync::Arc;

use crate::delegate::Delegate;
use crate::lock::RawLock;
use crate::locks::FutexLock;
use crate::queue::{DelegationQueue, SimpleLockedQueue};
use crate::relax::{Relax, Spin};

/// A condition variable for delegation locks.
///
/// Instead of parking threads, waiting parks an operation: [`wait_redelegate`]
/// stores the operation together with the lock it targets, and a later
/// notification delegates it to that lock. The waiting thread never blocks.
///
/// Notifications run on the notifying thread. Operations parked after a
/// notification started are kept for the next one.
///
/// [`wait_redelegate`]: QdCondvar::wait_redelegate
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use qdlock::{Delegate, QdCondvar, QdLock};
///
/// let ready = Arc::new(QdLock::<Vec<&str>>::new(Vec::new()));
/// let condvar = QdCondvar::new();
/// condvar.wait_redelegate(&ready, |log| log.push("woken"));
/// assert!(ready.delegate_with_result(|log| log.is_empty()).get());
///
/// condvar.notify_one();
/// assert_eq!(ready.delegate_with_result(|log| log.clone()).get(), ["woken"]);
/// ```
pub struct QdCondvar {
    lock: FutexLock,
    waiters: SimpleLockedQueue,
}

impl QdCondvar {
    /// Creates a condition variable with no waiting operations.
    pub fn new() -> Self {
        let waiters = SimpleLockedQueue::new();
        waiters.open();
        Self { lock: FutexLock::new(), waiters }
    }

    /// Parks `op` until the next notification, which delegates it to
    /// `lock`.
    pub fn wait_redelegate<D, F>(&self, lock: &Arc<D>, op: F)
    where
        D: Delegate + Send + Sync + 'static,
        F: FnOnce(&mut D::Target) + Send + 'static,
    {
        let lock = Arc::clone(lock);
        let mut parked = move |_: &mut ()| lock.delegate_no_result(op);
        let mut relax = Spin::new();
        // Only rejected in the window where `notify_all` reopens the queue.
        while let Err(rejected) = self.waiters.enqueue::<(), _>(parked) {
            parked = rejected.into_inner();
            relax.relax();
        }
    }

    /// Delegates the oldest parked operation, if there is one.
    pub fn notify_one(&self) {
        self.lock.lock();
        // SAFETY: The condvar lock makes this thread the only flusher, and
        // every parked operation takes `()`.
        unsafe { self.waiters.flush_one(&mut ()) };
        // SAFETY: Acquired above.
        unsafe { self.lock.unlock() };
    }

    /// Delegates every parked operation.
    pub fn notify_all(&self) {
        self.lock.lock();
        // SAFETY: Same as in `notify_one`.
        unsafe { self.waiters.flush(&mut ()) };
        self.waiters.open();
        // SAFETY: Acquired above.
        unsafe { self.lock.unlock() };
    }

    /// Returns the number of parked operations.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }
}

impl Default for QdCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QdCondvar {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QdCondvar").field("waiting", &self.waiting()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::QdCondvar;
    use crate::delegate::Delegate;
    use crate::mrqd::MrQdLock;
    use crate::qd::QdLock;

    fn snapshot(lock: &QdLock<Vec<u32>>) -> Vec<u32> {
        lock.delegate_with_result(|log| log.clone()).get()
    }

    #[test]
    fn notify_one_wakes_oldest() {
        let lock = Arc::new(QdLock::<Vec<u32>>::new(Vec::new()));
        let condvar = QdCondvar::new();
        for value in 0..3 {
            condvar.wait_redelegate(&lock, move |log| log.push(value));
        }
        assert_eq!(condvar.waiting(), 3);
        assert!(snapshot(&lock).is_empty());
        condvar.notify_one();
        assert_eq!(snapshot(&lock), [0]);
        condvar.notify_one();
        assert_eq!(snapshot(&lock), [0, 1]);
        assert_eq!(condvar.waiting(), 1);
    }

    #[test]
    fn notify_all_wakes_everyone_and_reopens() {
        let lock = Arc::new(QdLock::<Vec<u32>>::new(Vec::new()));
        let condvar = QdCondvar::new();
        for value in 0..4 {
            condvar.wait_redelegate(&lock, move |log| log.push(value));
        }
        condvar.notify_all();
        assert_eq!(snapshot(&lock), [0, 1, 2, 3]);
        assert_eq!(condvar.waiting(), 0);

        condvar.wait_redelegate(&lock, |log| log.push(4));
        condvar.notify_all();
        assert_eq!(snapshot(&lock), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn notify_without_waiters() {
        let condvar = QdCondvar::new();
        condvar.notify_one();
        condvar.notify_all();
        assert_eq!(condvar.waiting(), 0);
    }

    #[test]
    fn redelegates_to_reader_writer_lock() {
        let lock = Arc::new(MrQdLock::<u32>::new(0));
        let condvar = QdCondvar::new();
        condvar.wait_redelegate(&lock, |n| *n += 10);
        condvar.notify_all();
        assert_eq!(*lock.rlock(), 10);
    }

    #[test]
    fn concurrent_waiters_and_notifier() {
        let lock = Arc::new(QdLock::<u64>::new(0));
        let condvar = Arc::new(QdCondvar::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let condvar = Arc::clone(&condvar);
                thread::spawn(move || {
                    for _ in 0..250 {
                        condvar.wait_redelegate(&lock, |n| *n += 1);
                    }
                })
            })
            .collect();
        let c_condvar = Arc::clone(&condvar);
        let notifier = thread::spawn(move || {
            for _ in 0..100 {
                c_condvar.notify_all();
                thread::yield_now();
            }
        });
        for waiter in waiters {
            waiter.join().unwrap();
        }
        notifier.join().unwrap();
        condvar.notify_all();
        assert_eq!(lock.delegate_with_result(|n| *n).get(), 1000);
    }
}
