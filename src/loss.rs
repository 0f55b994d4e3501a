//! Turning per-buffer device status into loss statistics.
//!
//! An overflow episode starts at the first overflow report and ends at the next
//! clean buffer; the gap in device time between the two, at the stream's
//! sample rate, is our estimate of what the device threw away.
//!
//! Everything here runs inline in the capture loop, so it only does arithmetic.

use hifitime::Duration;
use num_traits::ToPrimitive;

use crate::radio::{DeviceStatus, ErrorCode};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LossCounters {
    /// Estimated from overflow episodes
    pub dropped_samples: u64,
    pub overruns: u64,
    pub sequence_errors: u64,
    pub late: u64,
    pub timeouts: u64,
    pub other_errors: u64,
}

impl LossCounters {
    /// Buffers that came back with any error
    pub fn anomalies(&self) -> u64 {
        self.overruns + self.sequence_errors + self.late + self.timeouts + self.other_errors
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OverflowTracker {
    pub in_progress: bool,
    /// Device time of the first overflow of the current episode
    pub since: Duration,
}

impl Default for OverflowTracker {
    fn default() -> Self {
        Self {
            in_progress: false,
            since: Duration::ZERO,
        }
    }
}

/// What the capture loop should do after a status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// The stream went idle, ask the adapter to start it again
    RestartStream,
}

#[derive(Debug)]
pub struct LossAccountant {
    sample_rate: f64,
    tracker: OverflowTracker,
    counters: LossCounters,
}

impl LossAccountant {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            tracker: OverflowTracker::default(),
            counters: LossCounters::default(),
        }
    }

    pub fn observe(&mut self, status: &DeviceStatus) -> Verdict {
        match status.error {
            ErrorCode::None => {
                if self.tracker.in_progress {
                    self.tracker.in_progress = false;
                    let dropped = self.ticks_between(self.tracker.since, status.time);
                    self.counters.dropped_samples += dropped;
                }
            }
            ErrorCode::Overflow => {
                if !self.tracker.in_progress {
                    self.tracker.in_progress = true;
                    // Duration is Copy, the status can be reused by the caller
                    self.tracker.since = status.time;
                }
                if status.out_of_sequence {
                    self.counters.sequence_errors += 1;
                } else {
                    self.counters.overruns += 1;
                }
            }
            ErrorCode::Late => {
                self.counters.late += 1;
                return Verdict::RestartStream;
            }
            ErrorCode::Timeout => self.counters.timeouts += 1,
            ErrorCode::Other(_) => self.counters.other_errors += 1,
        }
        Verdict::Continue
    }

    /// Samples in the device-time interval `[from, to)`, zero if the clock
    /// went backwards
    fn ticks_between(&self, from: Duration, to: Duration) -> u64 {
        ((to - from).to_seconds() * self.sample_rate)
            .round()
            .to_u64()
            .unwrap_or(0)
    }

    pub fn counters(&self) -> &LossCounters {
        &self.counters
    }

    pub fn tracker(&self) -> &OverflowTracker {
        &self.tracker
    }

    pub fn overflow_in_progress(&self) -> bool {
        self.tracker.in_progress
    }
}
