pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{fence, AtomicBool, AtomicIsize, AtomicPtr, AtomicU32, AtomicUsize};

    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::{fence, AtomicBool, AtomicIsize, AtomicPtr, AtomicU32, AtomicUsize};
}

pub mod hint {
    #[cfg(not(all(loom, test)))]
    pub use core::hint::spin_loop;

    #[cfg(all(loom, test))]
    pub use loom::hint::spin_loop;
}

pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::yield_now;

    #[cfg(all(loom, test))]
    pub use loom::thread::yield_now;
}

/// Futex style wait and wake over a 32 bit atomic word.
///
/// Outside of Loom models this forwards to `atomic_wait`, which maps onto
/// `futex(2)` on Linux and the equivalent address based waiting primitives
/// on other major platforms. Loom cannot model blocking system calls, so
/// waiting is replaced by a yield that lets another modelled thread run.
pub mod futex {
    use super::atomic::AtomicU32;

    // The futex word must be exactly a `u32` for `atomic_wait`.
    #[cfg(not(all(loom, test)))]
    const _: () = assert!(core::mem::size_of::<AtomicU32>() == core::mem::size_of::<u32>());

    /// Blocks while `atomic` holds `expected`. May return spuriously.
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub fn wait(atomic: &AtomicU32, expected: u32) {
        atomic_wait::wait(atomic, expected);
    }

    /// Wakes one thread blocked on `ptr`.
    ///
    /// Takes a raw pointer since the memory may already have been reused by
    /// the time the wake is issued, no dereference happens here.
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub fn wake_one(ptr: *const AtomicU32) {
        atomic_wait::wake_one(ptr);
    }

    /// Wakes all threads blocked on `ptr`.
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub fn wake_all(ptr: *const AtomicU32) {
        atomic_wait::wake_all(ptr);
    }

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn wait(atomic: &AtomicU32, expected: u32) {
        use core::sync::atomic::Ordering::Relaxed;
        if atomic.load(Relaxed) == expected {
            loom::thread::yield_now();
        }
    }

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn wake_one(_ptr: *const AtomicU32) {}

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn wake_all(_ptr: *const AtomicU32) {}
}

/// Aborts the process if a closure unwinds.
///
/// Used around user operations that run inside a combining pass, where
/// unwinding would leave the remaining delegated operations neither run
/// nor released.
pub mod debug_abort {
    /// Runs `f`, aborting the process if it panics.
    pub fn on_unwind<F: FnOnce() -> R, R>(f: F) -> R {
        let guard = AbortOnDrop;
        let ret = f();
        core::mem::forget(guard);
        ret
    }

    struct AbortOnDrop;

    impl Drop for AbortOnDrop {
        #[cfg(not(tarpaulin_include))]
        fn drop(&mut self) {
            std::process::abort();
        }
    }
}
