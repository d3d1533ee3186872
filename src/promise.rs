//! Write-once result sinks for delegated operations.
//!
//! A [`Promise`] is moved into the delegated operation and fulfilled by
//! whichever thread ends up running it, the matching [`ResultHandle`] stays
//! with the delegating thread, which can block on it. A promise that is
//! dropped without a value breaks the handle, and [`ResultHandle::get`]
//! panics instead of blocking forever.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::Arc;

use crate::cfg::atomic::AtomicU32;
use crate::cfg::futex;
use crate::relax::{Relax, Spin};

const EMPTY: u32 = 0;
const WAITING: u32 = 1;
const READY: u32 = 2;
const BROKEN: u32 = 3;
const TAKEN: u32 = 4;

/// Creates a connected promise and result handle pair.
///
/// # Example
///
/// ```
/// use std::thread;
///
/// let (promise, handle) = qdlock::promise::channel();
/// thread::spawn(move || promise.set(23));
/// assert_eq!(handle.get(), 23);
/// ```
pub fn channel<T>() -> (Promise<T>, ResultHandle<T>) {
    let slot = Arc::new(Slot::new());
    (Promise { slot: Arc::clone(&slot) }, ResultHandle { slot })
}

struct Slot<T> {
    state: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: The value is written once by the promise before the release store
// of `READY` and read once by the handle after observing it with acquire.
unsafe impl<T: Send> Send for Slot<T> {}
// SAFETY: Same as above.
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    fn new() -> Self {
        Self { state: AtomicU32::new(EMPTY), value: UnsafeCell::new(MaybeUninit::uninit()) }
    }

    /// Moves the slot into a final state and wakes a blocked handle.
    fn complete(&self, state: u32) {
        let word = &self.state;
        let ptr = ptr::addr_of!(*word);
        if word.swap(state, Release) == WAITING {
            futex::wake_one(ptr);
        }
    }

    /// Blocks until the slot reached a final state, returns that state.
    fn wait(&self) -> u32 {
        let mut relax = Spin::new();
        for _ in 0..64 {
            let state = self.state.load(Acquire);
            if state >= READY {
                return state;
            }
            relax.relax();
        }
        loop {
            match self.state.compare_exchange(EMPTY, WAITING, Acquire, Acquire) {
                Ok(_) | Err(WAITING) => futex::wait(&self.state, WAITING),
                Err(state) => return state,
            }
        }
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if self.state.load(Relaxed) == READY {
            // SAFETY: `READY` means the value was written and never taken.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

/// The producing side of a result sink.
///
/// Consumed by [`set`](Promise::set), so it can be fulfilled at most once.
pub struct Promise<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Promise<T> {
    /// Fulfills the promise, waking the thread waiting on the handle.
    pub fn set(self, value: T) {
        // SAFETY: Only the promise writes the value, and it is consumed here.
        unsafe { (*self.slot.value.get()).write(value) };
        self.slot.complete(READY);
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        // Only the promise moves the slot out of `EMPTY` or `WAITING`.
        if self.slot.state.load(Relaxed) < READY {
            self.slot.complete(BROKEN);
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

/// The consuming side of a result sink, returned by the delegation entry
/// points that produce a value.
pub struct ResultHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> ResultHandle<T> {
    /// Blocks until the result is available (or the promise is broken).
    pub fn wait(&self) {
        self.slot.wait();
    }

    /// Returns `true` if the result can be taken without blocking.
    pub fn is_ready(&self) -> bool {
        self.slot.state.load(Acquire) >= READY
    }

    /// Blocks until the result is available and returns it.
    ///
    /// # Panics
    ///
    /// Panics if the promise was dropped without being fulfilled.
    pub fn get(self) -> T {
        match self.try_get() {
            Some(value) => value,
            None => panic!("delegated operation dropped its promise without a value"),
        }
    }

    /// Blocks until the promise is fulfilled or dropped, returning the value
    /// in the first case.
    pub fn try_get(self) -> Option<T> {
        match self.slot.wait() {
            READY => {
                self.slot.state.store(TAKEN, Relaxed);
                // SAFETY: `READY` was observed with acquire ordering, and the
                // handle is consumed so the value is read exactly once.
                Some(unsafe { (*self.slot.value.get()).assume_init_read() })
            }
            _ => None,
        }
    }
}

impl<T> fmt::Debug for ResultHandle<T> {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle").field("ready", &self.is_ready()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::channel;

    #[test]
    fn set_then_get() {
        let (promise, handle) = channel();
        promise.set(String::from("ready"));
        assert!(handle.is_ready());
        assert_eq!(handle.get(), "ready");
    }

    #[test]
    fn get_blocks_until_set() {
        let (promise, handle) = channel();
        let producer = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            promise.set(42_u64);
        });
        handle.wait();
        assert_eq!(handle.get(), 42);
        producer.join().unwrap();
    }

    #[test]
    fn dropped_promise_breaks_handle() {
        let (promise, handle) = channel::<u32>();
        thread::spawn(move || drop(promise)).join().unwrap();
        assert!(handle.is_ready());
        assert_eq!(handle.try_get(), None);
    }

    #[test]
    #[should_panic(expected = "dropped its promise")]
    fn get_panics_on_broken_promise() {
        let (promise, handle) = channel::<u32>();
        drop(promise);
        handle.get();
    }

    #[test]
    fn untaken_value_is_dropped() {
        let token = Arc::new(());
        let (promise, handle) = channel();
        promise.set(Arc::clone(&token));
        assert_eq!(Arc::strong_count(&token), 2);
        drop(handle);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn many_handles_many_threads() {
        let handles: Vec<_> = (0..64_u32)
            .map(|tag| {
                let (promise, handle) = channel();
                thread::spawn(move || promise.set(tag));
                handle
            })
            .collect();
        let values: Vec<_> = handles.into_iter().map(|handle| handle.get()).collect();
        assert_eq!(values, (0..64).collect::<Vec<_>>());
    }
}
