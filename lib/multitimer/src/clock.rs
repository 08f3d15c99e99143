// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Time sources for the scheduler.

use std::cell::Cell;
use std::time::{Duration, Instant};

/// A monotonic millisecond clock.
///
/// `now_ms` must never go backward. The unit is only a convention: the
/// scheduler compares and adds timestamps and never interprets them, so a
/// finer clock works as long as intervals are given in the same unit.
pub trait Clock {
    fn now_ms(&self) -> u64;

    /// Blocks for roughly `ms`. Used when the scheduler has nothing due.
    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        (**self).sleep_ms(ms)
    }
}

/// Wall-clock time since construction, from [`Instant`].
#[derive(Copy, Clone, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        // 2^64 ms is half a billion years; saturate rather than wrap anyway.
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// A clock that only moves when told to.
///
/// Sleeping on a `SimClock` advances it instead of blocking, so a run loop
/// with an idle policy of [`Idle::Sleep`](crate::Idle::Sleep) skips straight
/// to the next deadline.
#[derive(Debug, Default)]
pub struct SimClock {
    now: Cell<u64>,
}

impl SimClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get().saturating_add(ms));
    }

    /// Moves the clock to `t`.
    ///
    /// # Panics
    ///
    /// If `t` is earlier than the current time.
    pub fn set(&self, t: u64) {
        let now = self.now.get();
        assert!(t >= now, "SimClock moved backward from {now} to {t}");
        self.now.set(t);
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }
}
