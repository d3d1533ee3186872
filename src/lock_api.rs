//! Locking interfaces for the backing locks that are compatible with
//! [lock_api].
//!
//! Every lock in [`locks`] implements [`lock_api::RawMutex`] when this
//! feature is enabled, so it can also be used as a plain mutex without
//! delegation. The following modules provide [`lock_api::Mutex`] and
//! [`lock_api::MutexGuard`] aliases for each of them.
//!
//! [`locks`]: crate::locks
//! [lock_api]: https://crates.io/crates/lock_api
//! [`lock_api::Mutex`]: https://docs.rs/lock_api/latest/lock_api/struct.Mutex.html
//! [`lock_api::MutexGuard`]: https://docs.rs/lock_api/latest/lock_api/struct.MutexGuard.html
//! [`lock_api::RawMutex`]: https://docs.rs/lock_api/latest/lock_api/trait.RawMutex.html

use crate::lock::RawLock;
use crate::locks::{FutexLock, McsFutexLock, TatasLock, TicketFutexLock};
use crate::relax::Relax;

macro_rules! raw_mutex {
    ($(#[$attr:meta])* impl[$($gen:tt)*] for $lock:ty) => {
        $(#[$attr])*
        unsafe impl<$($gen)*> lock_api::RawMutex for $lock {
            type GuardMarker = lock_api::GuardSend;

            // Const initialization is fine, the lock is not shared until it
            // has been moved into place.
            #[allow(clippy::declare_interior_mutable_const)]
            const INIT: Self = Self::new();

            #[inline]
            fn lock(&self) {
                RawLock::lock(self);
            }

            #[inline]
            fn try_lock(&self) -> bool {
                RawLock::try_lock(self)
            }

            #[inline]
            unsafe fn unlock(&self) {
                // SAFETY: Same contract as `RawMutex::unlock`.
                unsafe { RawLock::unlock(self) };
            }

            #[inline]
            fn is_locked(&self) -> bool {
                RawLock::is_locked(self)
            }
        }
    };
}

raw_mutex!(impl[R: Relax] for TatasLock<R>);
raw_mutex!(impl[] for FutexLock);
raw_mutex!(impl[] for McsFutexLock);
raw_mutex!(impl[] for TicketFutexLock);

/// A test-and-test-and-set lock alias that signals the processor that it is
/// running a busy-wait spin-loop during lock contention.
pub mod tatas {
    use crate::locks::TatasLock;
    use crate::relax::Spin;

    /// A spinning mutex compatible with the `lock_api` crate.
    ///
    /// # Example
    ///
    /// ```
    /// use qdlock::lock_api::tatas::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// *mutex.lock() += 1;
    /// assert_eq!(*mutex.lock(), 1);
    /// ```
    pub type Mutex<T> = lock_api::Mutex<TatasLock<Spin>, T>;

    /// A guard of a spinning mutex compatible with the `lock_api` crate.
    pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, TatasLock<Spin>, T>;
}

/// A futex lock alias that blocks in the kernel during sustained contention.
pub mod futex {
    use crate::locks::FutexLock;

    /// A futex mutex compatible with the `lock_api` crate.
    ///
    /// # Example
    ///
    /// ```
    /// use qdlock::lock_api::futex::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// *mutex.lock() += 1;
    /// assert_eq!(*mutex.lock(), 1);
    /// ```
    pub type Mutex<T> = lock_api::Mutex<FutexLock, T>;

    /// A guard of a futex mutex compatible with the `lock_api` crate.
    pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, FutexLock, T>;
}

/// An MCS queue lock alias whose waiters park on their own queue node.
pub mod mcs {
    use crate::locks::McsFutexLock;

    /// An MCS mutex compatible with the `lock_api` crate.
    ///
    /// # Example
    ///
    /// ```
    /// use qdlock::lock_api::mcs::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// *mutex.lock() += 1;
    /// assert_eq!(*mutex.lock(), 1);
    /// ```
    pub type Mutex<T> = lock_api::Mutex<McsFutexLock, T>;

    /// A guard of an MCS mutex compatible with the `lock_api` crate.
    pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, McsFutexLock, T>;
}

/// A ticket lock alias that serves waiters in arrival order.
pub mod ticket {
    use crate::locks::TicketFutexLock;

    /// A ticket mutex compatible with the `lock_api` crate.
    ///
    /// # Example
    ///
    /// ```
    /// use qdlock::lock_api::ticket::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// *mutex.lock() += 1;
    /// assert_eq!(*mutex.lock(), 1);
    /// ```
    pub type Mutex<T> = lock_api::Mutex<TicketFutexLock, T>;

    /// A guard of a ticket mutex compatible with the `lock_api` crate.
    pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, TicketFutexLock, T>;
}
