//! Wiring the workers together: sizing, startup, monitoring and the ordered
//! shutdown.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::{
    capture::{Acquisition, AcquisitionReport, CapturePlan, Outcome},
    control::{RunFlag, StopSignal},
    error::CaptureError,
    exfil::{StorageWriter, WriterReport},
    format::SampleFormat,
    housekeeping::{CacheControl, Housekeeper, HousekeepingReport, DEFAULT_INTERVAL},
    monitoring::{StatusReporter, Telemetry},
    output::{check_write_speed, output_path, CaptureMetadata, OutputRegion},
    pool::ring_pool,
    queue::handoff_queue,
    radio::{RadioConfig, RadioFrontEnd},
    sched::{configure_current_thread, EffectiveScheduling, PlatformScheduler, SchedulingRequest},
};

/// The producer runs at the top of the round-robin range (99 on Linux), the
/// writer has to stay under it
pub const MAX_WRITER_PRIORITY: i32 = 98;

// How often the main thread checks on the capture thread
const MONITOR_POLL: Duration = Duration::from_millis(50);

/// How many slots the ring gets
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PoolSizing {
    /// Enough buffers to hold this much signal
    Seconds(f64),
    Slots(usize),
}

impl PoolSizing {
    pub fn slots(self, sample_rate: f64, buffer_len: usize) -> usize {
        match self {
            PoolSizing::Seconds(secs) => {
                ((sample_rate * secs / buffer_len as f64).ceil() as usize).max(2)
            }
            PoolSizing::Slots(n) => n,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaptureConfig {
    pub radio: RadioConfig,
    pub duration_secs: f64,
    /// Output path without the format suffix
    pub output_stem: PathBuf,
    pub format: SampleFormat,
    pub pool: PoolSizing,
    pub capture_core: Option<usize>,
    pub writer_core: Option<usize>,
    pub sync_core: Option<usize>,
    pub writer_priority: i32,
    pub sync_interval: Duration,
    /// Background flush every this many blocks, 0 to only flush at the end
    pub flush_every: u64,
    pub preallocate: bool,
    pub status_interval: Duration,
}

impl CaptureConfig {
    pub fn new(radio: RadioConfig, duration_secs: f64, output_stem: impl Into<PathBuf>) -> Self {
        Self {
            radio,
            duration_secs,
            output_stem: output_stem.into(),
            format: SampleFormat::Cf32,
            pool: PoolSizing::Seconds(1.0),
            capture_core: None,
            writer_core: None,
            sync_core: None,
            writer_priority: 10,
            sync_interval: DEFAULT_INTERVAL,
            flush_every: 0,
            preallocate: false,
            status_interval: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        let bad = |msg: String| Err(CaptureError::Config(msg));
        if !(self.radio.sample_rate.is_finite() && self.radio.sample_rate > 0.0) {
            return bad(format!("sample rate must be positive, got {}", self.radio.sample_rate));
        }
        if !(self.duration_secs.is_finite() && self.duration_secs > 0.0) {
            return bad(format!("duration must be positive, got {}", self.duration_secs));
        }
        match self.pool {
            PoolSizing::Seconds(s) if !(s.is_finite() && s > 0.0) => {
                return bad(format!("pool must hold a positive time span, got {s} s"))
            }
            PoolSizing::Slots(n) if n < 2 => {
                return bad(format!("pool needs at least 2 slots, got {n}"))
            }
            _ => (),
        }
        if !(1..=MAX_WRITER_PRIORITY).contains(&self.writer_priority) {
            return bad(format!(
                "writer priority must be in 1..={MAX_WRITER_PRIORITY}, got {}",
                self.writer_priority
            ));
        }
        if self.sync_interval.is_zero() || self.status_interval.is_zero() {
            return bad("intervals must be non-zero".to_owned());
        }
        Ok(())
    }
}

/// Everything we know once the capture is over
#[derive(Debug)]
pub struct CaptureSummary {
    pub plan: CapturePlan,
    pub pool_size: usize,
    pub output: PathBuf,
    pub metadata: PathBuf,
    pub acquisition: AcquisitionReport,
    pub writer: WriterReport,
    pub housekeeping: HousekeepingReport,
    pub writer_scheduling: EffectiveScheduling,
    pub housekeeper_scheduling: EffectiveScheduling,
}

impl CaptureSummary {
    pub fn samples_written(&self) -> u64 {
        self.writer.blocks_written * self.plan.buffer_len as u64
    }

    /// Every planned block made it to the output
    pub fn is_complete(&self) -> bool {
        matches!(self.acquisition.outcome, Outcome::Completed)
            && self.writer.blocks_written == self.plan.cycles
    }

    pub fn log(&self) {
        let loss = &self.acquisition.loss;
        info!(
            "wrote {} of {} samples to {}",
            self.samples_written(),
            self.plan.total_samples(),
            self.output.display()
        );
        info!(
            "overruns {}, sequence errors {}, late {}, timeouts {}, other {}",
            loss.overruns, loss.sequence_errors, loss.late, loss.timeouts, loss.other_errors
        );
        if loss.dropped_samples > 0 {
            warn!("{} samples dropped!", loss.dropped_samples);
        }
        info!(
            "queue max = {}/{}, stalls {}",
            self.writer.max_depth, self.writer.capacity, self.acquisition.stalls
        );
        if self.writer.generation_mismatches > 0 || self.writer.write_errors > 0 {
            error!(
                "{} slot generation mismatches, {} failed block writes",
                self.writer.generation_mismatches, self.writer.write_errors
            );
        }
        info!(
            "cache housekeeping: {} passes, {} sync failures{}",
            self.housekeeping.passes,
            self.housekeeping.sync_failures,
            if self.housekeeping.drop_disabled {
                ", cache drops disabled"
            } else {
                ""
            }
        );
        info!("capture ran with {}", self.acquisition.scheduling);
        info!("writer ran with {}", self.writer_scheduling);
        info!("housekeeper ran with {}", self.housekeeper_scheduling);
    }
}

fn spawn<T, F>(role: &'static str, f: F) -> Result<JoinHandle<T>, CaptureError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(role.to_owned())
        .spawn(f)
        .map_err(|source| CaptureError::Spawn { role, source })
}

fn join<T>(role: &'static str, handle: JoinHandle<T>) -> Result<T, CaptureError> {
    handle.join().map_err(|_| CaptureError::WorkerPanicked(role))
}

fn open_output(
    config: &CaptureConfig,
    plan: &CapturePlan,
) -> Result<(OutputRegion, PathBuf), CaptureError> {
    let path = output_path(&config.output_stem, config.format);
    let mut region = OutputRegion::create(&path, config.format, plan.buffer_len, plan.cycles)?;
    info!(
        "output {} ({:.1} MB)",
        path.display(),
        region.len_bytes() as f64 / 1e6
    );
    if config.preallocate {
        let speed = region.preallocate()?;
        check_write_speed(speed, config.radio.sample_rate);
    }
    let metadata = CaptureMetadata {
        format: config.format,
        sample_rate: config.radio.sample_rate,
        center_frequency: config.radio.center_frequency,
        buffer_len: plan.buffer_len,
        samples: plan.total_samples(),
        utc_start: Utc::now(),
    }
    .write_sidecar(region.path())?;
    Ok((region, metadata))
}

fn stop_housekeeper(
    flag: &RunFlag,
    handle: JoinHandle<(HousekeepingReport, EffectiveScheduling)>,
) -> Result<(HousekeepingReport, EffectiveScheduling), CaptureError> {
    flag.clear();
    join("housekeeper", handle)
}

/// Run one capture to completion (or until `stop`), returning the summary.
///
/// The radio is configured here and moved onto the capture thread. Scheduling
/// failures only degrade the run; output and thread errors abort it.
pub fn run_capture<R, C>(
    mut radio: R,
    config: &CaptureConfig,
    stop: StopSignal,
    scheduler: Arc<dyn PlatformScheduler>,
    cache: C,
) -> Result<CaptureSummary, CaptureError>
where
    R: RadioFrontEnd + 'static,
    C: CacheControl + 'static,
{
    config.validate()?;
    radio.configure(&config.radio)?;
    let buffer_len = radio.max_buffer_length();
    let plan = CapturePlan::from_duration(config.radio.sample_rate, config.duration_secs, buffer_len)?;
    let pool_size = config.pool.slots(config.radio.sample_rate, buffer_len);
    info!(
        "capturing {} samples in {} buffers of {}, {} channel(s), ring of {} slots",
        plan.total_samples(),
        plan.cycles,
        buffer_len,
        radio.channel_count(),
        pool_size
    );
    let (region, metadata) = open_output(config, &plan)?;
    let output = region.path().to_path_buf();

    let (source, sink) = ring_pool(pool_size, buffer_len);
    let (tx, rx) = handoff_queue(pool_size);
    let telemetry = Telemetry::new();

    let hk_flag = RunFlag::running();
    let hk = {
        let flag = hk_flag.clone();
        let scheduler = scheduler.clone();
        let request = SchedulingRequest::housekeeper(config.sync_core);
        let housekeeper = Housekeeper::new(cache, config.sync_interval);
        spawn("housekeeper", move || {
            let (effective, _) =
                configure_current_thread(scheduler.as_ref(), "housekeeper", &request);
            (housekeeper.run(&flag), effective)
        })?
    };

    let writer_flag = RunFlag::running();
    let writer = {
        let flag = writer_flag.clone();
        let scheduler = scheduler.clone();
        let request = SchedulingRequest::writer(config.writer_priority, config.writer_core);
        let storage = StorageWriter::new(rx, sink, region, telemetry.clone())
            .with_flush_every(config.flush_every);
        match spawn("writer", move || {
            let (effective, _) = configure_current_thread(scheduler.as_ref(), "writer", &request);
            let (region, report) = storage.run(&flag);
            (region, report, effective)
        }) {
            Ok(handle) => handle,
            Err(e) => {
                stop_housekeeper(&hk_flag, hk)?;
                return Err(e);
            }
        }
    };

    let capture = {
        let scheduler = scheduler.clone();
        let request = SchedulingRequest::capture(config.capture_core);
        let acquisition = Acquisition::new(radio, source, tx, plan, stop, telemetry.clone());
        spawn("capture", move || {
            let (_, report) = acquisition.run(scheduler, &request);
            report
        })
    };
    let capture = match capture {
        Ok(handle) => handle,
        Err(e) => {
            // The acquisition (and its queue sender) died with the closure, so
            // the writer sees a disconnect and winds down on its own
            writer_flag.clear();
            join("writer", writer)?;
            stop_housekeeper(&hk_flag, hk)?;
            return Err(e);
        }
    };

    let mut reporter = StatusReporter::new(
        telemetry,
        plan.cycles,
        buffer_len,
        config.radio.sample_rate,
        pool_size,
    );
    let mut next_report = Instant::now() + config.status_interval;
    while !capture.is_finished() {
        thread::sleep(MONITOR_POLL);
        if Instant::now() >= next_report {
            reporter.report();
            next_report += config.status_interval;
        }
    }

    // Capture first (it sent the sentinel), then the writer drains, then the
    // final flush, then the housekeeper
    let acquisition = join("capture", capture);
    writer_flag.clear();
    let written = join("writer", writer);
    let flushed = match &written {
        Ok((region, _, _)) => region.flush(),
        Err(_) => Ok(()),
    };
    let (housekeeping, housekeeper_scheduling) = stop_housekeeper(&hk_flag, hk)?;
    let acquisition = acquisition?;
    let (_, writer, writer_scheduling) = written?;
    flushed?;
    reporter.report();

    Ok(CaptureSummary {
        plan,
        pool_size,
        output,
        metadata,
        acquisition,
        writer,
        housekeeping,
        writer_scheduling,
        housekeeper_scheduling,
    })
}

/// Where `run_capture` will put the data for `config`
pub fn planned_output(config: &CaptureConfig) -> PathBuf {
    output_path(Path::new(&config.output_stem), config.format)
}
