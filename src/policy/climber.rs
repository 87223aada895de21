//! Adaptive hill climber for the window/main partition.
//!
//! A fixed window size favours either recency (large window) or frequency
//! (large main region); real workloads drift between the two. The climber
//! samples the hit rate and nudges the window size in whichever direction
//! last improved it: if the hit rate rose, keep going; if it fell, reverse
//! and decay the step. Large swings restart the climb at full step size.
//!
//! ```text
//!   every sample_size requests:
//!     hit_rate = hits / (hits + misses)
//!     delta    = hit_rate - previous_hit_rate
//!
//!     amount = delta >= 0 ?  step_size : -step_size
//!     step   = |delta| >= 5% ? ±6.25% of maximum (restart)
//!                            : amount × 0.98     (decay)
//!
//!   amount > 0 → grow window  (recency-biased workload)
//!   amount < 0 → grow main    (frequency-biased workload)
//! ```
//!
//! The climber only computes the adjustment; applying it (moving quota and
//! entries between regions) is the maintenance pass's job.

/// Restart the climb when the hit rate moved by at least this much.
const HILL_CLIMBER_RESTART_THRESHOLD: f64 = 0.05;

/// Fresh step size, as a fraction of the maximum weighted size.
const HILL_CLIMBER_STEP_PERCENT: f64 = 0.0625;

/// Multiplicative step decay while the climb converges.
const HILL_CLIMBER_STEP_DECAY_RATE: f64 = 0.98;

/// Hit-rate sampling hill climber.
#[derive(Debug)]
pub struct HillClimber {
    step_size: f64,
    previous_sample_hit_rate: f64,
    hits_in_sample: u64,
    misses_in_sample: u64,
    sample_size: u64,
}

impl HillClimber {
    /// Creates a climber for a cache bounded at `maximum`.
    pub fn new(maximum: u64) -> Self {
        let mut climber = Self {
            step_size: 0.0,
            previous_sample_hit_rate: 0.0,
            hits_in_sample: 0,
            misses_in_sample: 0,
            sample_size: 0,
        };
        climber.set_maximum(maximum);
        climber
    }

    /// Re-derives the sample size and fresh step for a new maximum.
    pub fn set_maximum(&mut self, maximum: u64) {
        self.sample_size = maximum.saturating_mul(10).max(10);
        self.step_size = HILL_CLIMBER_STEP_PERCENT * maximum as f64;
    }

    /// Records a policy hit (an access to a resident entry).
    #[inline]
    pub fn on_hit(&mut self) {
        self.hits_in_sample += 1;
    }

    /// Records a policy miss (an insertion of an absent entry).
    #[inline]
    pub fn on_miss(&mut self) {
        self.misses_in_sample += 1;
    }

    /// Completes a sample if enough requests accumulated, returning the
    /// signed window adjustment in weight units. Zero means "not yet".
    pub fn adjustment(&mut self, maximum: u64) -> f64 {
        let request_count = self.hits_in_sample + self.misses_in_sample;
        if request_count < self.sample_size {
            return 0.0;
        }

        let hit_rate = self.hits_in_sample as f64 / request_count as f64;
        let delta = hit_rate - self.previous_sample_hit_rate;
        let amount = if delta >= 0.0 {
            self.step_size
        } else {
            -self.step_size
        };
        let next_step = if delta.abs() >= HILL_CLIMBER_RESTART_THRESHOLD {
            HILL_CLIMBER_STEP_PERCENT * maximum as f64 * amount.signum()
        } else {
            HILL_CLIMBER_STEP_DECAY_RATE * amount
        };

        self.previous_sample_hit_rate = hit_rate;
        self.step_size = next_step;
        self.hits_in_sample = 0;
        self.misses_in_sample = 0;
        amount
    }

    // Test hooks mirroring the adaptation scenarios, which pin the sample
    // state rather than replaying ten-thousand-request traces.

    #[cfg(test)]
    pub(crate) fn set_step_size(&mut self, step: f64) {
        self.step_size = step;
    }

    #[cfg(test)]
    pub(crate) fn set_previous_sample_hit_rate(&mut self, rate: f64) {
        self.previous_sample_hit_rate = rate;
    }

    #[cfg(test)]
    pub(crate) fn set_sample(&mut self, hits: u64, misses: u64) {
        self.hits_in_sample = hits;
        self.misses_in_sample = misses;
    }

    #[cfg(test)]
    pub(crate) fn step_size(&self) -> f64 {
        self.step_size
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
