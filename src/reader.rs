//! Reader indicators: "is anyone reading?" counters for reader/writer
//! delegation locks.
//!
//! Readers [`arrive`](ReaderIndicator::arrive) before reading and
//! [`depart`](ReaderIndicator::depart) afterwards, writers only ask whether
//! any reader is present through [`query`](ReaderIndicator::query). Each
//! reader names the shard it counts itself in with a [`ThreadIndex`], so
//! readers running on different threads touch different cache lines.

use core::fmt;
use core::sync::atomic::Ordering::{Relaxed, Release};

use crossbeam_utils::CachePadded;

use crate::cfg::atomic::AtomicIsize;

/// An opaque per thread index used to pick a reader indicator shard.
///
/// [`ThreadIndex::current`] hands out consecutive indices the first time
/// each thread asks for one. Callers that manage their own threads (for
/// example a fixed worker pool) can assign indices explicitly with
/// [`ThreadIndex::new`] to spread readers evenly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadIndex(usize);

impl ThreadIndex {
    /// Creates an index from an explicit value.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the index registered for the calling thread, registering one
    /// on first use.
    pub fn current() -> Self {
        use core::cell::Cell;
        use core::sync::atomic::AtomicUsize;

        static NEXT: AtomicUsize = AtomicUsize::new(0);
        std::thread_local! {
            static INDEX: Cell<Option<usize>> = const { Cell::new(None) };
        }

        let index = INDEX.try_with(|index| match index.get() {
            Some(value) => value,
            None => {
                let value = NEXT.fetch_add(1, Relaxed);
                index.set(Some(value));
                value
            }
        });
        // Threads tearing down their locals share shard zero.
        Self(index.unwrap_or(0))
    }

    /// Returns the raw index value.
    pub const fn get(self) -> usize {
        self.0
    }
}

/// A concurrent indicator of whether any readers are active.
///
/// A reader must `depart` with the same index it used to `arrive`.
pub trait ReaderIndicator {
    /// Creates an indicator with no readers.
    fn new() -> Self;

    /// Registers a reader.
    fn arrive(&self, index: ThreadIndex);

    /// Deregisters a reader previously registered with the same index.
    ///
    /// Implementations must release the reader's prior accesses, so a writer
    /// that observes the departure through `query` and an acquire fence
    /// does not race with them.
    fn depart(&self, index: ThreadIndex);

    /// Returns `true` if any reader may be active.
    ///
    /// This function does not guarantee strong ordering, only atomicity.
    /// Callers pair it with a fence when they need to order it against
    /// their own writes.
    fn query(&self) -> bool;
}

/// A reader indicator split into `GROUPS` cache padded counters.
///
/// Readers are spread over the counters by their thread index, so only
/// readers that share a group contend with each other. A single counter can
/// go negative if a reader departs through a different group than it
/// arrived on, `query` treats any nonzero counter as a present reader.
pub struct ReaderGroups<const GROUPS: usize> {
    counters: [CachePadded<AtomicIsize>; GROUPS],
}

impl<const GROUPS: usize> ReaderGroups<GROUPS> {
    const CHECK: () = assert!(GROUPS > 0, "reader groups need at least one group");

    /// Creates an indicator with no readers.
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CHECK;
        let counters = core::array::from_fn(|_| CachePadded::new(AtomicIsize::new(0)));
        Self { counters }
    }

    fn group(&self, index: ThreadIndex) -> &AtomicIsize {
        &self.counters[index.get() % GROUPS]
    }
}

impl<const GROUPS: usize> ReaderIndicator for ReaderGroups<GROUPS> {
    fn new() -> Self {
        Self::new()
    }

    fn arrive(&self, index: ThreadIndex) {
        self.group(index).fetch_add(1, Relaxed);
    }

    fn depart(&self, index: ThreadIndex) {
        self.group(index).fetch_sub(1, Release);
    }

    fn query(&self) -> bool {
        self.counters.iter().any(|counter| counter.load(Relaxed) != 0)
    }
}

impl<const GROUPS: usize> Default for ReaderGroups<GROUPS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const GROUPS: usize> fmt::Debug for ReaderGroups<GROUPS> {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderGroups").field("groups", &GROUPS).field("readers", &self.query()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::{ReaderGroups, ReaderIndicator, ThreadIndex};

    #[test]
    fn arrive_depart_query() {
        let readers = ReaderGroups::<4>::new();
        assert!(!readers.query());
        readers.arrive(ThreadIndex::new(1));
        readers.arrive(ThreadIndex::new(6));
        assert!(readers.query());
        readers.depart(ThreadIndex::new(1));
        assert!(readers.query());
        readers.depart(ThreadIndex::new(6));
        assert!(!readers.query());
    }

    #[test]
    fn indices_wrap_over_groups() {
        let readers = ReaderGroups::<2>::new();
        readers.arrive(ThreadIndex::new(3));
        readers.depart(ThreadIndex::new(5));
        assert!(!readers.query());
    }

    #[test]
    fn current_index_is_stable_per_thread() {
        let first = ThreadIndex::current();
        assert_eq!(first, ThreadIndex::current());
        let other = thread::spawn(ThreadIndex::current).join().unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn concurrent_readers_balance_out() {
        let readers = Arc::new(ReaderGroups::<8>::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let readers = Arc::clone(&readers);
                thread::spawn(move || {
                    let index = ThreadIndex::current();
                    for _ in 0..1000 {
                        readers.arrive(index);
                        assert!(readers.query());
                        readers.depart(index);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!readers.query());
    }
}
