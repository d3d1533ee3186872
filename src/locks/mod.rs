//! Mutual exclusion locks that back the delegation locks.
//!
//! All of them implement [`RawLock`](crate::RawLock):
//!
//! - [`TatasLock`]: test-and-test-and-set spin lock, never blocks in the
//!   kernel.
//! - [`FutexLock`]: three state futex lock, spins and then blocks.
//! - [`McsFutexLock`]: MCS queue lock whose waiters park on their own queue
//!   node.
//! - [`TicketFutexLock`]: FIFO ticket lock with futex parking.

mod futex;
mod mcs_futex;
mod tatas;
mod ticket_futex;

pub use futex::FutexLock;
pub use mcs_futex::McsFutexLock;
pub use tatas::TatasLock;
pub use ticket_futex::TicketFutexLock;
