//! In this module, we implement the runtime stats for the capture.
//! The capture thread can't log, so it publishes counters here with relaxed
//! atomic stores and the main thread turns them into periodic status lines.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use tracing::{info, warn};

use crate::loss::LossCounters;

#[derive(Debug, Default)]
pub struct Telemetry {
    cycles: AtomicU64,
    dropped_samples: AtomicU64,
    anomalies: AtomicU64,
    stalls: AtomicU64,
    written: AtomicU64,
    queue_depth: AtomicUsize,
    max_queue_depth: AtomicUsize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Buffers received and queued
    pub cycles: u64,
    pub dropped_samples: u64,
    /// Buffers that came back with an error status
    pub anomalies: u64,
    /// Times the capture thread had to wait on the writer
    pub stalls: u64,
    /// Buffers stored in the output region
    pub written: u64,
    pub queue_depth: usize,
    pub max_queue_depth: usize,
}

impl Telemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called by the capture thread once per buffer
    pub fn record_cycle(&self, cycles: u64, loss: &LossCounters) {
        self.cycles.store(cycles, Ordering::Relaxed);
        self.dropped_samples
            .store(loss.dropped_samples, Ordering::Relaxed);
        self.anomalies.store(loss.anomalies(), Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Called by the writer once per stored buffer, with the queue depth it
    /// saw after popping
    pub fn record_written(&self, depth: usize) {
        self.written.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.store(depth, Ordering::Relaxed);
        self.max_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
        }
    }
}

/// Periodic human-readable progress lines
pub struct StatusReporter {
    telemetry: Arc<Telemetry>,
    planned_cycles: u64,
    buffer_len: usize,
    sample_rate: f64,
    queue_capacity: usize,
    started: Instant,
    last: TelemetrySnapshot,
}

impl StatusReporter {
    pub fn new(
        telemetry: Arc<Telemetry>,
        planned_cycles: u64,
        buffer_len: usize,
        sample_rate: f64,
        queue_capacity: usize,
    ) -> Self {
        Self {
            telemetry,
            planned_cycles,
            buffer_len,
            sample_rate,
            queue_capacity,
            started: Instant::now(),
            last: TelemetrySnapshot::default(),
        }
    }

    /// Log one status line and return what it was built from
    pub fn report(&mut self) -> TelemetrySnapshot {
        let now = self.telemetry.snapshot();
        let newly_dropped = now.dropped_samples.saturating_sub(self.last.dropped_samples);
        if newly_dropped > 0 {
            warn!("{newly_dropped} samples dropped!");
        }
        let captured_secs = (now.cycles * self.buffer_len as u64) as f64 / self.sample_rate;
        info!(
            "{:5.1}% {:.2} s captured in {:.1} s, queue {}/{} (max {}), dropped {}, anomalies {}, stalls {}",
            100.0 * now.cycles as f64 / self.planned_cycles.max(1) as f64,
            captured_secs,
            self.started.elapsed().as_secs_f64(),
            now.queue_depth,
            self.queue_capacity,
            now.max_queue_depth,
            now.dropped_samples,
            now.anomalies,
            now.stalls,
        );
        self.last = now;
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_tracks_peak_depth() {
        let telemetry = Telemetry::new();
        telemetry.record_written(3);
        telemetry.record_written(7);
        telemetry.record_written(1);
        telemetry.record_stall();
        let loss = LossCounters {
            dropped_samples: 10,
            timeouts: 2,
            ..Default::default()
        };
        telemetry.record_cycle(5, &loss);
        let snap = telemetry.snapshot();
        assert_eq!(snap.written, 3);
        assert_eq!(snap.queue_depth, 1);
        assert_eq!(snap.max_queue_depth, 7);
        assert_eq!(snap.stalls, 1);
        assert_eq!((snap.cycles, snap.dropped_samples, snap.anomalies), (5, 10, 2));
    }

    #[test]
    fn test_reporter_reads_latest() {
        let telemetry = Telemetry::new();
        let mut reporter = StatusReporter::new(telemetry.clone(), 10, 100, 1000.0, 4);
        telemetry.record_cycle(4, &LossCounters::default());
        assert_eq!(reporter.report().cycles, 4);
        telemetry.record_cycle(9, &LossCounters::default());
        assert_eq!(reporter.report().cycles, 9);
    }
}
