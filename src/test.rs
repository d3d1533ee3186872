use core::cell::UnsafeCell;

use crate::lock::RawLock;

/// An arbitrary unsigned integer type.
pub type Int = u32;

/// A raw lock paired with the integer it protects.
pub struct Counter<L> {
    lock: L,
    value: UnsafeCell<Int>,
}

// SAFETY: `value` is only accessed while `lock` is held.
unsafe impl<L: Sync> Sync for Counter<L> {}

impl<L: RawLock> Counter<L> {
    pub fn new(value: Int) -> Self {
        Self { lock: L::new(), value: UnsafeCell::new(value) }
    }

    pub fn raw(&self) -> &L {
        &self.lock
    }

    /// Runs `f` against the integer with the lock held.
    pub fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut Int) -> Ret,
    {
        self.lock.lock();
        // SAFETY: The lock was just acquired.
        unsafe { self.then_unlock(f) }
    }

    /// Runs `f` against the integer if the lock can be acquired right away.
    pub fn try_lock_then<F, Ret>(&self, f: F) -> Option<Ret>
    where
        F: FnOnce(&mut Int) -> Ret,
    {
        // SAFETY: The lock is held if `try_lock` succeeded.
        self.lock.try_lock().then(|| unsafe { self.then_unlock(f) })
    }

    /// # Safety
    ///
    /// The lock must be held by the caller, it is released here.
    unsafe fn then_unlock<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut Int) -> Ret,
    {
        // SAFETY: Held by the caller.
        let ret = f(unsafe { &mut *self.value.get() });
        // SAFETY: Held by the caller.
        unsafe { self.lock.unlock() };
        ret
    }

    pub fn get(&self) -> Int {
        self.lock_then(|value| *value)
    }

    pub fn inc(&self) {
        self.lock_then(|value| *value += 1);
    }

    pub fn try_inc(&self) {
        self.try_lock_then(|value| *value += 1);
    }
}

#[cfg(all(not(loom), test))]
pub mod tests {
    // Modified test suite from the Rust's Mutex implementation with minor changes
    // since the API is not compatible with this crate implementation and some
    // new tests as well.
    //
    // Copyright 2014 The Rust Project Developers.
    //
    // Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
    // http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
    // <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
    // option. This file may not be copied, modified, or distributed
    // except according to those terms.

    use core::ops::RangeInclusive;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;

    use super::{Counter, Int};
    use crate::lock::RawLock;

    const ITERS: Int = 1000;
    const THREADS: Int = 4;
    const EXPECTED_VALUE: Int = ITERS * THREADS;
    const EXPECTED_RANGE: RangeInclusive<Int> = 1..=EXPECTED_VALUE;

    fn run_threads<L>(threads: Int, f: fn(&Counter<L>)) -> Int
    where
        L: RawLock + Send + Sync + 'static,
    {
        let counter = Arc::new(Counter::<L>::new(0));
        let (tx, rx) = channel();
        for _ in 0..threads {
            let c_counter = Arc::clone(&counter);
            let c_tx = tx.clone();
            thread::spawn(move || {
                f(&c_counter);
                c_tx.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..threads {
            rx.recv().unwrap();
        }
        counter.get()
    }

    pub fn smoke<L: RawLock>() {
        let counter = Counter::<L>::new(1);
        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 3);
        assert!(!counter.raw().is_locked());
    }

    pub fn try_lock_while_held<L: RawLock>() {
        let counter = Counter::<L>::new(0);
        counter.lock_then(|_| {
            assert!(counter.raw().is_locked());
            assert!(!counter.raw().try_lock());
        });
        assert!(!counter.raw().is_locked());
        assert_eq!(counter.try_lock_then(|value| *value + 1), Some(1));
    }

    pub fn try_lock_or_wait_acquires_free<L: RawLock>() {
        let lock = L::new();
        assert!(lock.try_lock_or_wait());
        assert!(lock.is_locked());
        // SAFETY: Acquired above.
        unsafe { lock.unlock() };
        assert!(!lock.is_locked());
    }

    pub fn try_lock_or_wait_returns_after_unlock<L>()
    where
        L: RawLock + Send + Sync + 'static,
    {
        let lock = Arc::new(L::new());
        lock.lock();
        let released = Arc::new(AtomicBool::new(false));
        let c_lock = Arc::clone(&lock);
        let c_released = Arc::clone(&released);
        let waiter = thread::spawn(move || {
            while !c_lock.try_lock_or_wait() {}
            // Whatever the waits in between, the lock only becomes free
            // through the unlock below.
            assert!(c_released.load(Ordering::Acquire));
            // SAFETY: `try_lock_or_wait` returned `true`.
            unsafe { c_lock.unlock() };
        });
        thread::sleep(std::time::Duration::from_millis(20));
        released.store(true, Ordering::Release);
        // SAFETY: Acquired above.
        unsafe { lock.unlock() };
        waiter.join().unwrap();
        assert!(!lock.is_locked());
    }

    pub fn lots_and_lots<L>()
    where
        L: RawLock + Send + Sync + 'static,
    {
        fn inc_for<L: RawLock>(counter: &Counter<L>) {
            for _ in 0..ITERS {
                counter.inc();
            }
        }
        fn try_inc_for<L: RawLock>(counter: &Counter<L>) {
            for _ in 0..ITERS {
                counter.try_inc();
            }
        }
        fn mixed_inc_for<L: RawLock>(counter: &Counter<L>) {
            for run in 0..ITERS {
                let f = if run % 2 == 0 { Counter::inc } else { Counter::try_inc };
                f(counter);
            }
        }
        assert_eq!(run_threads::<L>(THREADS, inc_for::<L>), EXPECTED_VALUE);
        assert!(EXPECTED_RANGE.contains(&run_threads::<L>(THREADS, try_inc_for::<L>)));
        assert!(EXPECTED_RANGE.contains(&run_threads::<L>(THREADS, mixed_inc_for::<L>)));
    }

    /// Every one of `threads` threads increments the counter exactly once.
    pub fn thread_per_increment<L>(threads: Int)
    where
        L: RawLock + Send + Sync + 'static,
    {
        assert_eq!(run_threads::<L>(threads, Counter::inc), threads);
    }
}
