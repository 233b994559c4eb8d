//! Tick-driven logical timeouts with multiplicative backoff.
//!
//! A [`Timeout`] counts ticks rather than wall-clock time: the embedder
//! decides how long a tick is and advances every timeout from its scheduler.
//! This keeps the protocol deterministic under simulation: the same tick
//! sequence always produces the same firing pattern.

use rand::rngs::SmallRng;
use rand::Rng;

/// Cap on the backoff exponent: intervals stop doubling after this many
/// attempts (64x the base interval).
const BACKOFF_EXPONENT_MAX: u8 = 6;

/// A logical timeout.
///
/// The timeout fires once `after` ticks have elapsed since it was started,
/// reset, or backed off. `attempts` counts consecutive backoffs and doubles
/// as the replica rotation offset for retransmission.
#[derive(Debug, Clone)]
pub struct Timeout {
    name: &'static str,
    /// Base interval in ticks.
    base: u64,
    /// Current effective interval in ticks (base, or backed-off).
    after: u64,
    attempts: u8,
    ticks: u64,
    ticking: bool,
}

impl Timeout {
    /// Creates a stopped timeout with the given base interval.
    ///
    /// # Panics
    ///
    /// Panics if `after` is zero.
    #[must_use]
    pub fn new(name: &'static str, after: u64) -> Self {
        assert!(after > 0, "timeout interval must be positive");
        Self {
            name,
            base: after,
            after,
            attempts: 0,
            ticks: 0,
            ticking: false,
        }
    }

    /// Returns the timeout's name, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the number of consecutive backoffs since the last start.
    #[must_use]
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// Returns true if the timeout is counting.
    #[must_use]
    pub fn ticking(&self) -> bool {
        self.ticking
    }

    /// Starts counting from zero at the base interval.
    pub fn start(&mut self) {
        self.attempts = 0;
        self.ticks = 0;
        self.after = self.base;
        self.ticking = true;
    }

    /// Stops counting and clears all state.
    pub fn stop(&mut self) {
        self.attempts = 0;
        self.ticks = 0;
        self.after = self.base;
        self.ticking = false;
    }

    /// Restarts the count without stopping.
    ///
    /// # Panics
    ///
    /// Panics if the timeout is not ticking.
    pub fn reset(&mut self) {
        assert!(self.ticking, "cannot reset a stopped timeout");
        self.attempts = 0;
        self.ticks = 0;
        self.after = self.base;
    }

    /// Advances the count by one tick if ticking.
    pub fn tick(&mut self) {
        if self.ticking {
            self.ticks += 1;
        }
    }

    /// Returns true if the timeout has elapsed.
    #[must_use]
    pub fn fired(&self) -> bool {
        self.ticking && self.ticks >= self.after
    }

    /// Applies multiplicative backoff with PRNG jitter.
    ///
    /// The count restarts at zero, `attempts` increments, and the next
    /// interval doubles per attempt (capped at 64x the base) plus a jitter
    /// of up to half the interval so that clients do not retransmit in
    /// lockstep.
    ///
    /// # Panics
    ///
    /// Panics if the timeout is not ticking.
    pub fn backoff(&mut self, prng: &mut SmallRng) {
        assert!(self.ticking, "cannot back off a stopped timeout");
        self.ticks = 0;
        self.attempts = self.attempts.saturating_add(1);

        let exponent = self.attempts.min(BACKOFF_EXPONENT_MAX);
        let delay = self.base.saturating_mul(1 << exponent);
        let jitter = prng.gen_range(0..=delay / 2);
        self.after = delay + jitter;
    }
}
