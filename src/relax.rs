// Modified version of relax.rs from spin-rs to support Loom yielding and
// exponential backoff.
//
// Original file at its most recent change (at the time of writing):
// https://github.com/mvdnes/spin-rs/blob/5860ee114094cf200b97348ff332155fbd7159b4/src/relax.rs
//
// Copyright (c) 2014 Mathijs van de Nes
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Back-off strategies applied by busy-wait loops while a lock or a
//! delegation queue is contended.
//!
//! Every spinning loop in this crate is generic over [`Relax`] or uses
//! [`Spin`] directly, which is the pause hint the delegation engine issues
//! between retries.

use crate::cfg::{hint, thread};

/// A trait implemented by spinning relax strategies.
pub trait Relax {
    /// Initialize the state for the relaxing operation, if any.
    fn new() -> Self;

    /// Perform the relaxing operation during a period of contention.
    fn relax(&mut self);
}

/// Issues a single CPU pause hint via [`core::hint::spin_loop`].
///
/// This is the relax strategy used by the delegation engine and by the
/// spin phase of the futex backed locks. Spinning for long periods is
/// subject to [priority inversion], prefer one of the futex backed locks
/// when critical sections are long.
///
/// [priority inversion]: https://matklad.github.io/2020/01/02/spinlocks-considered-harmful.html
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        hint::spin_loop();
    }
}

/// Gives up the current time slice to the OS scheduler.
pub struct Yield;

impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline]
    fn relax(&mut self) {
        thread::yield_now();
    }
}

/// Busy-waits without any hint to the processor.
///
/// Only useful on targets where the spin hint is known to misbehave.
pub struct Loop;

impl Relax for Loop {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {}
}

// Exponential backoff is based on the crossbeam-utils implementation.
// link to most recent change (as the time of writing):
// https://github.com/crossbeam-rs/crossbeam/blob/371de8c2d304db07662450995848f3dc9598ac99/crossbeam-utils/src/backoff.rs
//
// Copyright (c) 2019 The Crossbeam Project Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

/// Spins with exponential backoff, doubling the number of pause hints on
/// each call up to `2^SPIN_LIMIT`.
pub struct SpinBackoff {
    step: Step,
}

impl SpinBackoff {
    const SPIN_LIMIT: u32 = 6;
}

impl Relax for SpinBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { step: Step(0) }
    }

    #[inline(always)]
    fn relax(&mut self) {
        self.step.spin_to(Self::SPIN_LIMIT);
        self.step.step_to(Self::SPIN_LIMIT);
    }
}

/// Spins with exponential backoff and starts yielding to the scheduler
/// once the spin limit is reached.
pub struct YieldBackoff {
    step: Step,
}

impl YieldBackoff {
    const SPIN_LIMIT: u32 = SpinBackoff::SPIN_LIMIT;
}

impl Relax for YieldBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { step: Step(0) }
    }

    #[inline(always)]
    fn relax(&mut self) {
        if self.step.0 < Self::SPIN_LIMIT {
            self.step.spin_to(Self::SPIN_LIMIT);
            self.step.step_to(Self::SPIN_LIMIT);
        } else {
            thread::yield_now();
        }
    }
}

/// Number of backoff steps taken so far.
struct Step(u32);

impl Step {
    fn spin_to(&self, max: u32) {
        for _ in 0..1u32 << self.0.min(max) {
            hint::spin_loop();
        }
    }

    fn step_to(&mut self, end: u32) {
        if self.0 < end {
            self.0 += 1;
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Loop, Relax, Spin, SpinBackoff, Yield, YieldBackoff};

    fn relax_many<R: Relax>() {
        let mut relax = R::new();
        for _ in 0..64 {
            relax.relax();
        }
    }

    #[test]
    fn strategies_terminate() {
        relax_many::<Spin>();
        relax_many::<Yield>();
        relax_many::<Loop>();
        relax_many::<SpinBackoff>();
        relax_many::<YieldBackoff>();
    }

    #[test]
    fn backoff_step_is_bounded() {
        let mut relax = SpinBackoff::new();
        for _ in 0..100 {
            relax.relax();
        }
        assert_eq!(relax.step.0, SpinBackoff::SPIN_LIMIT);
    }
}
