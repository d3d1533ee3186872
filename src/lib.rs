//! Queue delegation locks: flat combining mutual exclusion where contending
//! threads hand their critical sections to the current lock holder instead
//! of waiting for the lock.
//!
//! A delegation lock owns the data it protects. Threads submit operations,
//! closures receiving `&mut T`, through the [`Delegate`] trait. The first
//! thread to acquire the backing lock becomes the *combiner*: it runs its
//! own operation and then every operation other threads deposited in the
//! lock's delegation queue in the meantime, and only then releases the
//! lock. A thread whose operation was accepted by the queue returns
//! immediately, it never waits for the critical section itself. Results
//! flow back through [`ResultHandle`]s.
//!
//! Because one combining pass drains its queue in order before unlocking,
//! waiting on the result of a later delegation also orders every earlier
//! delegation from the same thread before it.
//!
//! ## Locks
//!
//! - [`QdLock`]: the queue delegation lock, also usable for plain critical
//!   sections through [`QdLock::lock`].
//! - [`MrQdLock`]: a reader/writer variant whose readers bypass the queue
//!   and only announce themselves in a sharded reader indicator.
//! - [`QdCondvar`]: a condition variable that parks operations instead of
//!   threads and re-delegates them when notified.
//!
//! Both delegation locks are generic over their backing [`RawLock`]
//! (see [`locks`]) and their [`DelegationQueue`](queue::DelegationQueue).
//! The defaults are a [`FutexLock`](locks::FutexLock) and a 16 KiB
//! [`BufferQueue`](queue::BufferQueue). The [`tatas`], [`futex`], [`mcs`]
//! and [`ticket`] modules provide aliases for each backing lock.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use qdlock::{Delegate, QdLock};
//!
//! let totals = Arc::new(QdLock::<[u64; 4]>::new([0; 4]));
//! let handles: Vec<_> = (0..4)
//!     .map(|worker| {
//!         let totals = Arc::clone(&totals);
//!         thread::spawn(move || {
//!             for n in 0..100 {
//!                 totals.delegate_no_result(move |totals| totals[worker] += n);
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! let totals = totals.delegate_with_result(|totals| *totals).get();
//! assert_eq!(totals, [4950; 4]);
//! ```
//!
//! ## Features
//!
//! This crate does not provide any default features. Features that can be
//! enabled are:
//!
//! ### lock_api
//!
//! Implements [`lock_api::RawMutex`] for every backing lock and exports
//! `lock_api::Mutex` aliases for them under the `lock_api` module.
//!
//! [`lock_api::RawMutex`]: https://docs.rs/lock_api/latest/lock_api/trait.RawMutex.html

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod cfg;

pub mod lock;
pub mod locks;
pub mod promise;
pub mod queue;
pub mod reader;
pub mod relax;

mod condvar;
mod delegate;
pub mod mrqd;
pub mod qd;

pub use condvar::QdCondvar;
pub use delegate::Delegate;
pub use lock::RawLock;
pub use mrqd::{MrQdLock, ReadGuard};
pub use promise::{Promise, ResultHandle};
pub use qd::{QdGuard, QdLock};
pub use reader::ThreadIndex;

#[cfg(all(feature = "lock_api", not(loom)))]
#[cfg_attr(docsrs, doc(cfg(feature = "lock_api")))]
pub mod lock_api;

/// Delegation locks backed by a test-and-test-and-set spin lock.
///
/// Contending threads never block in the kernel. Suited to short critical
/// sections on machines that are not oversubscribed.
pub mod tatas {
    use crate::locks::TatasLock;
    use crate::relax::Spin;

    /// A [`QdLock`](crate::QdLock) backed by a [`TatasLock`].
    ///
    /// # Example
    ///
    /// ```
    /// use qdlock::tatas::QdLock;
    /// use qdlock::Delegate;
    ///
    /// let lock = QdLock::new(0);
    /// lock.delegate_no_result(|n| *n += 1);
    /// assert_eq!(lock.into_inner(), 1);
    /// ```
    pub type QdLock<T> = crate::QdLock<T, TatasLock<Spin>>;

    /// A [`MrQdLock`](crate::MrQdLock) backed by a [`TatasLock`].
    pub type MrQdLock<T> = crate::MrQdLock<T, TatasLock<Spin>>;
}

/// Delegation locks backed by a three state futex lock.
///
/// These are the same as the crate root defaults.
pub mod futex {
    use crate::locks::FutexLock;

    /// A [`QdLock`](crate::QdLock) backed by a [`FutexLock`].
    ///
    /// # Example
    ///
    /// ```
    /// use qdlock::futex::QdLock;
    /// use qdlock::Delegate;
    ///
    /// let lock = QdLock::new(0);
    /// lock.delegate_no_result(|n| *n += 1);
    /// assert_eq!(lock.into_inner(), 1);
    /// ```
    pub type QdLock<T> = crate::QdLock<T, FutexLock>;

    /// A [`MrQdLock`](crate::MrQdLock) backed by a [`FutexLock`].
    pub type MrQdLock<T> = crate::MrQdLock<T, FutexLock>;
}

/// Delegation locks backed by an MCS queue lock with futex parking.
pub mod mcs {
    use crate::locks::McsFutexLock;

    /// A [`QdLock`](crate::QdLock) backed by a [`McsFutexLock`].
    ///
    /// # Example
    ///
    /// ```
    /// use qdlock::mcs::QdLock;
    /// use qdlock::Delegate;
    ///
    /// let lock = QdLock::new(0);
    /// lock.delegate_no_result(|n| *n += 1);
    /// assert_eq!(lock.into_inner(), 1);
    /// ```
    pub type QdLock<T> = crate::QdLock<T, McsFutexLock>;

    /// A [`MrQdLock`](crate::MrQdLock) backed by a [`McsFutexLock`].
    pub type MrQdLock<T> = crate::MrQdLock<T, McsFutexLock>;
}

/// Delegation locks backed by a FIFO ticket lock with futex parking.
pub mod ticket {
    use crate::locks::TicketFutexLock;

    /// A [`QdLock`](crate::QdLock) backed by a [`TicketFutexLock`].
    ///
    /// # Example
    ///
    /// ```
    /// use qdlock::ticket::QdLock;
    /// use qdlock::Delegate;
    ///
    /// let lock = QdLock::new(0);
    /// lock.delegate_no_result(|n| *n += 1);
    /// assert_eq!(lock.into_inner(), 1);
    /// ```
    pub type QdLock<T> = crate::QdLock<T, TicketFutexLock>;

    /// A [`MrQdLock`](crate::MrQdLock) backed by a [`TicketFutexLock`].
    pub type MrQdLock<T> = crate::MrQdLock<T, TicketFutexLock>;
}

#[cfg(all(not(loom), test))]
mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin_include))]
mod loom;
