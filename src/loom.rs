pub mod models {
    use core::array;

    use loom::cell::UnsafeCell;
    use loom::sync::Arc;
    use loom::{model, thread};

    use crate::lock::RawLock;

    /// A raw lock paired with a Loom tracked integer it protects.
    struct Guarded<L> {
        lock: L,
        value: UnsafeCell<usize>,
    }

    // SAFETY: `value` is only accessed while `lock` is held.
    unsafe impl<L: Sync> Sync for Guarded<L> {}

    impl<L: RawLock> Guarded<L> {
        fn new() -> Self {
            Self { lock: L::new(), value: UnsafeCell::new(0) }
        }

        /// Increments the value with the lock held.
        ///
        /// # Safety
        ///
        /// The lock must be held by the caller, it is released here.
        unsafe fn inc_and_unlock(&self) {
            self.value.with_mut(|value| unsafe { *value += 1 });
            // SAFETY: Held by the caller.
            unsafe { self.lock.unlock() };
        }

        fn inc(&self) {
            self.lock.lock();
            // SAFETY: Just acquired.
            unsafe { self.inc_and_unlock() };
        }

        fn try_inc(&self) {
            if self.lock.try_lock() {
                // SAFETY: Just acquired.
                unsafe { self.inc_and_unlock() };
            }
        }

        fn get(&self) -> usize {
            self.lock.lock();
            let value = self.value.with(|value| unsafe { *value });
            // SAFETY: Acquired above.
            unsafe { self.lock.unlock() };
            value
        }
    }

    // Three or more threads make lock models run for too long.
    const LOCKS: usize = 2;
    const TRY_LOCKS: usize = 3;

    /// Evaluates that concurrent `try_lock` calls will serialize all mutations
    /// against the shared data, therefore no data races.
    pub fn try_lock_join<L>()
    where
        L: RawLock + Send + Sync + 'static,
    {
        model(|| {
            const RUNS: usize = TRY_LOCKS;
            let lock = Arc::new(Guarded::<L>::new());
            let handles: [_; RUNS] = array::from_fn(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || lock.try_inc())
            });
            for handle in handles {
                handle.join().unwrap();
            }
            let value = lock.get();
            assert!((1..=RUNS).contains(&value));
        });
    }

    /// Evaluates that concurrent `lock` calls will serialize all mutations
    /// against the shared data, therefore no data races.
    pub fn lock_join<L>()
    where
        L: RawLock + Send + Sync + 'static,
    {
        model(|| {
            const RUNS: usize = LOCKS;
            let lock = Arc::new(Guarded::<L>::new());
            let handles: [_; RUNS] = array::from_fn(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || lock.inc())
            });
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(RUNS, lock.get());
        });
    }

    /// Evaluates that concurrent `lock` and `try_lock` calls will serialize
    /// all mutations against the shared data, therefore no data races.
    pub fn mixed_lock_join<L>()
    where
        L: RawLock + Send + Sync + 'static,
    {
        model(|| {
            const RUNS: usize = LOCKS;
            let lock = Arc::new(Guarded::<L>::new());
            let handles: [_; RUNS] = array::from_fn(|run| {
                let lock = Arc::clone(&lock);
                let f = if run % 2 == 0 { Guarded::inc } else { Guarded::try_inc };
                thread::spawn(move || f(&lock))
            });
            for handle in handles {
                handle.join().unwrap();
            }
            let value = lock.get();
            assert!((1..=RUNS).contains(&value));
        });
    }
}
