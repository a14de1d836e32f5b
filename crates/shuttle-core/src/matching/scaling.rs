//! Poller-scaling advisor.
//!
//! Annotates poll responses with a hint for the worker's pool size. Advisory only:
//! the engine never changes worker counts itself.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::MatchingConfig;

/// Signed hint returned to a polling worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "by")]
pub enum ScalingDecision {
    Increase(u32),
    Decrease(u32),
    NoChange,
}

impl ScalingDecision {
    pub fn delta(self) -> i64 {
        match self {
            ScalingDecision::Increase(n) => i64::from(n),
            ScalingDecision::Decrease(n) => -i64::from(n),
            ScalingDecision::NoChange => 0,
        }
    }
}

/// Everything the policy looks at, gathered by the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingInputs {
    pub average_wait: Duration,
    pub occupancy: usize,
    pub backlog_len: u64,
    pub consecutive_timeouts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingBounds {
    pub target_latency: Duration,
    pub high_water: usize,
    pub low_water: usize,
    pub timeout_streak: u32,
    pub max_step: u32,
}

impl From<&MatchingConfig> for ScalingBounds {
    fn from(c: &MatchingConfig) -> Self {
        Self {
            target_latency: c.target_poll_latency,
            high_water: c.occupancy_high_water,
            low_water: c.occupancy_low_water,
            timeout_streak: c.timeout_streak,
            max_step: c.max_scale_step,
        }
    }
}

/// A match counts as "well under target" below a tenth of the target latency.
const FAST_MATCH_DIVISOR: u32 = 10;

/// Pure decision policy.
///
/// - up: timeouts keep happening, or too few pollers, while the backlog is non-empty
/// - down: matches are fast and occupancy is above the high-water mark
/// - both or neither: no change
pub fn decide(bounds: &ScalingBounds, inputs: &ScalingInputs) -> ScalingDecision {
    let backlog = inputs.backlog_len > 0;
    let starving = inputs.consecutive_timeouts >= bounds.timeout_streak;
    let want_up = backlog && (starving || inputs.occupancy < bounds.low_water);

    let fast = inputs.average_wait < bounds.target_latency / FAST_MATCH_DIVISOR;
    let want_down = fast && inputs.occupancy > bounds.high_water;

    match (want_up, want_down) {
        (true, false) => {
            let short = bounds.low_water.saturating_sub(inputs.occupancy).max(1);
            let step = u32::try_from(short).unwrap_or(u32::MAX).min(bounds.max_step);
            ScalingDecision::Increase(step)
        }
        (false, true) => {
            let excess = inputs.occupancy - bounds.high_water;
            let step = u32::try_from(excess).unwrap_or(u32::MAX).min(bounds.max_step);
            ScalingDecision::Decrease(step)
        }
        _ => ScalingDecision::NoChange,
    }
}

/// Weight of the newest sample in the moving average of poll waits.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Default)]
struct Samples {
    average_wait: Option<Duration>,
    consecutive_timeouts: u32,
}

fn blend(average: Option<Duration>, wait: Duration) -> Duration {
    match average {
        None => wait,
        Some(avg) => avg.mul_f64(1.0 - EWMA_ALPHA) + wait.mul_f64(EWMA_ALPHA),
    }
}

/// Keeps the running poll statistics the policy needs.
#[derive(Debug)]
pub struct ScalingAdvisor {
    bounds: ScalingBounds,
    samples: Mutex<Samples>,
}

impl ScalingAdvisor {
    pub fn new(bounds: ScalingBounds) -> Self {
        Self {
            bounds,
            samples: Mutex::new(Samples::default()),
        }
    }

    /// Feed the outcome of one finished poll.
    pub fn record_poll(&self, wait: Duration, matched: bool) {
        let mut s = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if matched {
            s.consecutive_timeouts = 0;
        } else {
            s.consecutive_timeouts = s.consecutive_timeouts.saturating_add(1);
        }
        s.average_wait = Some(blend(s.average_wait, wait));
    }

    /// Decide for a poll that started `wait` ago.
    ///
    /// `wait` is weighed into the moving average for this decision only; it is
    /// not recorded as a sample.
    pub fn decide(&self, wait: Duration, occupancy: usize, backlog_len: u64) -> ScalingDecision {
        let inputs = {
            let s = self.samples.lock().unwrap_or_else(|e| e.into_inner());
            ScalingInputs {
                average_wait: blend(s.average_wait, wait),
                occupancy,
                backlog_len,
                consecutive_timeouts: s.consecutive_timeouts,
            }
        };
        decide(&self.bounds, &inputs)
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_timeouts
    }
}
