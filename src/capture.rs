//! This module contains all the capture logic

// The capture thread does one thing, as fast as possible: pull buffers from
// the radio into free ring slots and hand them to the writer. No allocation,
// no logging and no I/O happens inside the loop; counters go to the shared
// telemetry and everything else waits until the loop is over.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::{
    control::StopSignal,
    error::CaptureError,
    loss::{LossAccountant, LossCounters, Verdict},
    monitoring::Telemetry,
    pool::{Slot, SlotSource},
    queue::{HandoffSender, QueueEntry},
    radio::{RadioError, RadioFrontEnd},
    sched::{EffectiveScheduling, PlatformScheduler, ScopedScheduling, SchedulingRequest},
};

/// How many device buffers to capture
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapturePlan {
    /// Complex samples per device buffer
    pub buffer_len: usize,
    pub cycles: u64,
}

impl CapturePlan {
    /// At least `sample_rate * duration` samples, rounded up to whole buffers
    pub fn from_duration(
        sample_rate: f64,
        duration_secs: f64,
        buffer_len: usize,
    ) -> Result<Self, CaptureError> {
        if !(sample_rate > 0.0 && duration_secs > 0.0) {
            return Err(CaptureError::EmptyPlan(format!(
                "{duration_secs} s at {sample_rate} Sa/s"
            )));
        }
        Self::from_samples((sample_rate * duration_secs) as u64, buffer_len)
    }

    pub fn from_samples(min_samples: u64, buffer_len: usize) -> Result<Self, CaptureError> {
        if min_samples == 0 || buffer_len == 0 {
            return Err(CaptureError::EmptyPlan(format!(
                "{min_samples} samples in buffers of {buffer_len}"
            )));
        }
        Ok(Self {
            buffer_len,
            cycles: min_samples.div_ceil(buffer_len as u64),
        })
    }

    pub fn total_samples(&self) -> u64 {
        self.cycles * self.buffer_len as u64
    }
}

/// Why the capture loop stopped
#[derive(Debug)]
pub enum Outcome {
    Completed,
    /// Someone requested a stop
    Interrupted,
    /// The radio failed in a way we can't continue from
    DeviceFault(RadioError),
    /// The writer end of the queue disappeared
    WriterGone,
}

#[derive(Debug)]
pub struct AcquisitionReport {
    /// Buffers received and queued
    pub cycles: u64,
    pub outcome: Outcome,
    pub loss: LossCounters,
    /// Times the loop had to wait for the writer
    pub stalls: u64,
    /// What the capture thread ran under
    pub scheduling: EffectiveScheduling,
}

/// One receive: fill the slot and account for the status the device sent
/// with it
fn receive_one<R: RadioFrontEnd>(
    radio: &mut R,
    slot: &mut Slot,
    accountant: &mut LossAccountant,
) -> Result<(), RadioError> {
    let status = radio.receive_next(slot.samples_mut())?;
    if accountant.observe(&status) == Verdict::RestartStream {
        radio.restart_streaming()?;
    }
    Ok(())
}

/// The producer half of the pipeline
pub struct Acquisition<R> {
    radio: R,
    slots: SlotSource,
    queue: HandoffSender,
    accountant: LossAccountant,
    plan: CapturePlan,
    stop: StopSignal,
    telemetry: Arc<Telemetry>,
    stalls: u64,
}

impl<R: RadioFrontEnd> Acquisition<R> {
    pub fn new(
        radio: R,
        slots: SlotSource,
        queue: HandoffSender,
        plan: CapturePlan,
        stop: StopSignal,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let accountant = LossAccountant::new(radio.sample_rate());
        Self {
            radio,
            slots,
            queue,
            accountant,
            plan,
            stop,
            telemetry,
            stalls: 0,
        }
    }

    fn stalled(&mut self) {
        self.stalls += 1;
        self.telemetry.record_stall();
    }

    fn cycle_loop(&mut self) -> (u64, Outcome) {
        let pool_size = self.slots.pool_size() as u64;
        let mut cycles = 0u64;
        while cycles < self.plan.cycles {
            if self.stop.is_requested() {
                return (cycles, Outcome::Interrupted);
            }
            // Whole pool in flight, the writer is behind
            if self.slots.available() == 0 {
                self.stalled();
            }
            let Some((mut slot, _)) = self.slots.acquire(&self.stop) else {
                return (cycles, Outcome::Interrupted);
            };
            debug_assert_eq!(slot.index() as u64, cycles % pool_size);
            if let Err(e) = receive_one(&mut self.radio, &mut slot, &mut self.accountant) {
                return (cycles, Outcome::DeviceFault(e));
            }
            slot.stamp();
            match self.queue.push(QueueEntry {
                index: cycles,
                slot,
            }) {
                Ok(true) => self.stalled(),
                Ok(false) => (),
                Err(_) => return (cycles, Outcome::WriterGone),
            }
            cycles += 1;
            self.telemetry
                .record_cycle(cycles, self.accountant.counters());
        }
        (cycles, Outcome::Completed)
    }

    /// Run the capture on the calling thread.
    ///
    /// Applies `request` first, streams until the plan is done or something
    /// stops us, then drops back to the thread's previous scheduling, stops the
    /// stream and sends the sentinel. Hands the radio back when done.
    pub fn run(
        mut self,
        scheduler: Arc<dyn PlatformScheduler>,
        request: &SchedulingRequest,
    ) -> (R, AcquisitionReport) {
        let scoped = ScopedScheduling::apply(scheduler, "capture", request);
        let scheduling = scoped.effective().clone();
        let (cycles, outcome) = match self.radio.start_streaming() {
            Ok(()) => self.cycle_loop(),
            Err(e) => (0, Outcome::DeviceFault(e)),
        };
        drop(scoped);

        if let Err(e) = self.radio.stop_streaming() {
            warn!("failed to stop the stream: {e}");
        }
        let samples = cycles * self.plan.buffer_len as u64;
        let seconds = samples as f64 / self.radio.sample_rate();
        match &outcome {
            Outcome::Completed => info!("capture complete: {samples} samples ({seconds:.3} s)"),
            Outcome::Interrupted => warn!(
                "recording interrupted after {seconds:.3} seconds ({samples} samples)"
            ),
            Outcome::DeviceFault(e) => {
                error!("{e}, stopping after {seconds:.3} seconds ({samples} samples)")
            }
            Outcome::WriterGone => error!("writer went away after {samples} samples"),
        }
        if self.queue.close().is_err() {
            warn!("writer gone before the sentinel could be sent");
        }
        let report = AcquisitionReport {
            cycles,
            outcome,
            loss: *self.accountant.counters(),
            stalls: self.stalls,
            scheduling,
        };
        (self.radio, report)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::{
        pool::ring_pool,
        queue::{handoff_queue, Handoff, HandoffReceiver},
        radio::ErrorCode,
        sched::BestEffortScheduler,
        sim::{Scripted, SimulatedRadio},
    };

    fn normal() -> SchedulingRequest {
        SchedulingRequest::housekeeper(None)
    }

    fn acquisition(
        radio: SimulatedRadio,
        pool: usize,
        cycles: u64,
    ) -> (Acquisition<SimulatedRadio>, HandoffReceiver, crate::pool::SlotSink) {
        let buffer_len = radio.max_buffer_length();
        let (source, sink) = ring_pool(pool, buffer_len);
        let (tx, rx) = handoff_queue(pool);
        let plan = CapturePlan { buffer_len, cycles };
        let acq = Acquisition::new(radio, source, tx, plan, StopSignal::new(), Telemetry::new());
        (acq, rx, sink)
    }

    #[test]
    fn test_plan_rounds_up_to_whole_buffers() {
        let plan = CapturePlan::from_duration(1000.0, 1.0, 100).unwrap();
        assert_eq!(plan.cycles, 10);
        assert_eq!(plan.total_samples(), 1000);
        let plan = CapturePlan::from_duration(1000.0, 1.05, 100).unwrap();
        assert_eq!(plan.cycles, 11);
        assert_eq!(CapturePlan::from_samples(1, 2040).unwrap().total_samples(), 2040);
        assert!(CapturePlan::from_duration(0.0, 1.0, 100).is_err());
        assert!(CapturePlan::from_samples(10, 0).is_err());
    }

    #[test]
    fn test_entries_arrive_in_order_then_sentinel() {
        let (acq, rx, mut sink) = acquisition(SimulatedRadio::new(100), 4, 10);
        let consumer = thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(Handoff::Block(entry)) = rx.pop() {
                assert_eq!(entry.slot.index() as u64, entry.index % 4);
                assert_eq!(entry.slot.generation(), Slot::expected_generation(entry.index, 4));
                // Counter waveform: I carries the cycle number
                assert_eq!(entry.slot.samples()[0], entry.index as f32);
                seen.push(entry.index);
                sink.release(entry.slot);
            }
            seen
        });
        let (radio, report) = acq.run(Arc::new(BestEffortScheduler), &normal());
        assert!(matches!(report.outcome, Outcome::Completed));
        assert_eq!(report.cycles, 10);
        assert!(!radio.is_streaming());
        assert_eq!(consumer.join().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_late_restarts_stream() {
        let radio = SimulatedRadio::new(8).with_event(
            3,
            Scripted::Status {
                error: ErrorCode::Late,
                out_of_sequence: false,
            },
        );
        let (acq, rx, mut sink) = acquisition(radio, 4, 6);
        let consumer = thread::spawn(move || {
            while let Some(Handoff::Block(entry)) = rx.pop() {
                sink.release(entry.slot);
            }
        });
        let (radio, report) = acq.run(Arc::new(BestEffortScheduler), &normal());
        consumer.join().unwrap();
        assert_eq!(radio.restarts(), 1);
        assert_eq!(report.loss.late, 1);
        // The restart means no timeouts follow the late report
        assert_eq!(report.loss.timeouts, 0);
        assert_eq!(report.cycles, 6);
    }

    #[test]
    fn test_fault_ends_capture_with_sentinel() {
        let radio = SimulatedRadio::new(8).with_event(2, Scripted::Fault("usb gone".into()));
        let (acq, rx, _sink) = acquisition(radio, 4, 6);
        let (_, report) = acq.run(Arc::new(BestEffortScheduler), &normal());
        assert!(matches!(report.outcome, Outcome::DeviceFault(RadioError::Runtime(_))));
        assert_eq!(report.cycles, 2);
        assert!(matches!(rx.pop(), Some(Handoff::Block(QueueEntry { index: 0, .. }))));
        assert!(matches!(rx.pop(), Some(Handoff::Block(QueueEntry { index: 1, .. }))));
        assert!(matches!(rx.pop(), Some(Handoff::Sentinel)));
    }

    #[test]
    fn test_stop_before_start() {
        let (acq, rx, _sink) = acquisition(SimulatedRadio::new(8), 2, 100);
        acq.stop.request();
        let (_, report) = acq.run(Arc::new(BestEffortScheduler), &normal());
        assert!(matches!(report.outcome, Outcome::Interrupted));
        assert_eq!(report.cycles, 0);
        assert!(matches!(rx.pop(), Some(Handoff::Sentinel)));
    }

    #[test]
    fn test_blocks_instead_of_overwriting() {
        // Nobody drains the queue: the producer must stop at the pool size
        let (acq, rx, _sink) = acquisition(SimulatedRadio::new(8), 2, 1000);
        let stop = acq.stop.clone();
        let telemetry = acq.telemetry.clone();
        let producer = thread::spawn(move || acq.run(Arc::new(BestEffortScheduler), &normal()));
        while telemetry.snapshot().cycles < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(telemetry.snapshot().cycles, 2);
        assert_eq!(rx.depth(), 2);
        assert!(rx.depth() <= rx.capacity());

        stop.request();
        stop.request();
        let (_, report) = producer.join().unwrap();
        assert!(matches!(report.outcome, Outcome::Interrupted));
        assert_eq!(report.cycles, 2);
        assert_eq!(report.stalls, 1);
        for expected in 0..2 {
            match rx.pop() {
                Some(Handoff::Block(entry)) => assert_eq!(entry.index, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(rx.pop(), Some(Handoff::Sentinel)));
        assert!(rx.pop().is_none());
    }
}
