//! Delegation queues: where contending threads deposit operations for the
//! current combiner to run.
//!
//! A queue goes through three states. It starts [`Closed`](State::Closed),
//! the combiner [`open`](DelegationQueue::open)s it once it holds the
//! backing lock, other threads [`enqueue`](DelegationQueue::enqueue)
//! operations while it is [`Open`](State::Open), and the combiner finally
//! [`flush`](DelegationQueue::flush)es it, running every accepted operation
//! exactly once and closing it again. A bounded queue that ran out of room
//! reports [`Full`](State::Full) until it is flushed.
//!
//! Operations are closures that receive exclusive access to the data the
//! delegation lock protects.

use core::fmt;

mod buffer;
mod locked;

pub use buffer::BufferQueue;
pub use locked::SimpleLockedQueue;

/// The logical state of a delegation queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Accepting operations.
    Open,
    /// Out of capacity, rejecting operations until the next flush.
    Full,
    /// Drained or never opened, rejecting operations until the next open.
    Closed,
}

/// An operation the queue refused, handed back to the caller along with
/// the state that caused the refusal.
pub struct Rejected<F> {
    op: F,
    state: State,
}

impl<F> Rejected<F> {
    pub(crate) const fn new(op: F, state: State) -> Self {
        Self { op, state }
    }

    /// The state of the queue when the operation was refused, either
    /// [`State::Full`] or [`State::Closed`].
    pub const fn state(&self) -> State {
        self.state
    }

    /// Returns the refused operation.
    pub fn into_inner(self) -> F {
        self.op
    }

    pub(crate) fn map<G>(self, f: impl FnOnce(F) -> G) -> Rejected<G> {
        Rejected { op: f(self.op), state: self.state }
    }
}

impl<F> fmt::Debug for Rejected<F> {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected").field("state", &self.state).finish_non_exhaustive()
    }
}

/// A queue of delegated operations drained by a single combiner.
pub trait DelegationQueue {
    /// Creates a new, closed queue.
    fn new() -> Self;

    /// Opens the queue for new operations.
    ///
    /// Must only be called by the combiner, while the queue is closed.
    fn open(&self);

    /// Tries to store `op` so that the current combiner runs it.
    ///
    /// On success the operation is guaranteed to run exactly once, during
    /// the next `flush`. On failure it is handed back untouched.
    fn enqueue<T, F>(&self, op: F) -> Result<(), Rejected<F>>
    where
        F: FnOnce(&mut T) + Send + 'static;

    /// Runs every accepted operation against `data`, in the order they were
    /// accepted, and closes the queue.
    ///
    /// # Safety
    ///
    /// Only one thread may flush at a time, and every operation enqueued
    /// since the last `open` must have been enqueued with the same `T`.
    unsafe fn flush<T>(&self, data: &mut T);

    /// Returns the current state of the queue.
    ///
    /// This is only a snapshot, it may be outdated by the time it returns.
    fn state(&self) -> State;
}
