//! Lock-free counters sampled by the governor.
//!
//! The dispatch pipeline measures back-pressure by counting how often its
//! actors block on channel sends. Writers are many and hot, the reader is
//! a single control loop, so every counter here is a single atomic word
//! with a drain-style read.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts `tick` and `tock` calls in the two halves of one 64-bit word.
///
/// Balancing ticks and tocks can be folded: both counts are reduced by
/// the number of tocks, so 4 ticks and 3 tocks fold down to 1 and 0.
/// A tick marks entry into a blocking send, the matching tock marks its
/// completion; ticks surviving a fold are sends still in flight.
///
/// Constraints: a `tock` must be preceded by its completed `tick`
/// (callers pair them serially on one task), and `fold` must not be
/// called concurrently with itself.
#[derive(Debug, Default)]
pub struct TickTockCounter(AtomicU64);

impl TickTockCounter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Atomically increment the tick half.
    pub fn tick(&self) {
        self.0.fetch_add(1 << 32, Ordering::AcqRel);
    }

    /// Atomically increment the tock half.
    pub fn tock(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Collapse balanced ticks and tocks and return the pre-fold counts.
    ///
    /// Counts may grow between the load and the subtraction; subtracting
    /// only the previously read tock count is still safe since neither
    /// half ever decreases outside this method. Any ticks or tocks that
    /// land in between are picked up by the next fold, none are dropped
    /// or double-counted.
    pub fn fold(&self) -> (u32, u32) {
        let word = self.0.load(Ordering::Acquire);
        let tocks = word as u32;
        let ticks = (word >> 32) as u32;
        self.0
            .fetch_sub(((tocks as u64) << 32) + tocks as u64, Ordering::AcqRel);
        (ticks, tocks)
    }
}

/// Additive counter with a draining read.
///
/// Safe for any number of concurrent writers; `draw` is restricted to a
/// single concurrent consumer.
#[derive(Debug, Default)]
pub struct DrainCounter(AtomicU64);

impl DrainCounter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn add(&self, v: u64) {
        self.0.fetch_add(v, Ordering::AcqRel);
    }

    /// Reset the counter to zero and return its previous value.
    ///
    /// The count may have grown since the load; only the value read is
    /// subtracted, so late increments survive into the next draw.
    pub fn draw(&self) -> u64 {
        let v = self.0.load(Ordering::Acquire);
        self.0.fetch_sub(v, Ordering::AcqRel);
        v
    }
}

/// Rolling sum over a fixed window of samples.
///
/// Owned and driven by a single task; no interior synchronization.
#[derive(Debug)]
pub struct MovingAccumulator {
    samples: Vec<u64>,
    sum: u64,
    pos: usize,
}

impl MovingAccumulator {
    /// A window of zero samples is meaningless, so `None` is returned.
    pub fn new(window: usize) -> Option<Self> {
        if window == 0 {
            return None;
        }
        Some(Self {
            samples: vec![0; window],
            sum: 0,
            pos: 0,
        })
    }

    /// Evict the oldest sample, add `v`, and return the current sum.
    pub fn accumulate(&mut self, v: u64) -> u64 {
        self.sum = self.sum + v - self.samples[self.pos];
        self.samples[self.pos] = v;
        self.pos = (self.pos + 1) % self.samples.len();
        self.sum
    }
}

/// Tracks how many consecutive sampling periods saw blocking and how many
/// did not. Feeding any non-zero observation resets the no-wait streak
/// and vice versa.
#[derive(Debug, Default)]
pub struct WaitCounter {
    pub waits: u32,
    pub no_waits: u32,
}

impl WaitCounter {
    pub fn acc(&mut self, observed: u32) {
        if observed > 0 {
            self.waits += 1;
            self.no_waits = 0;
        } else {
            self.waits = 0;
            self.no_waits += 1;
        }
    }
}
