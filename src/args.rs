//! Argument parsing for running from the command line

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{
    format::SampleFormat,
    pipeline::{CaptureConfig, PoolSizing, MAX_WRITER_PRIORITY},
    radio::{Gain, RadioConfig},
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Sample rate in samples per second
    #[clap(short, long, default_value_t = 56e6)]
    pub rate: f64,
    /// Center frequency in Hz
    #[clap(short, long, default_value_t = 1e9)]
    pub freq: f64,
    /// Capture duration in seconds
    #[clap(short, long, default_value_t = 300.0)]
    pub duration: f64,
    /// Output file stem, the format suffix and `.bin` are appended
    #[clap(short, long, default_value = "capture")]
    pub output: PathBuf,
    /// Device initialization arguments (key=value,...)
    #[clap(short = 'a', long, default_value = "")]
    pub device_args: String,
    /// Output sample format (cf32 or ci16)
    #[clap(long, default_value = "cf32", value_parser = valid_format)]
    pub format: SampleFormat,
    /// Receive gain in dB, automatic gain control if absent
    #[clap(long)]
    pub gain: Option<f64>,
    /// Seconds of signal the buffer ring can hold
    #[clap(long, default_value_t = 1.0, value_parser = valid_pool_seconds)]
    pub pool_seconds: f64,
    /// CPU core for the capture thread
    #[clap(long, default_value_t = 5)]
    pub capture_core: usize,
    /// CPU core for the writer thread
    #[clap(long, default_value_t = 4)]
    pub writer_core: usize,
    /// CPU core for the cache housekeeper
    #[clap(long, default_value_t = 3)]
    pub sync_core: usize,
    /// Round-robin priority of the writer, below the capture thread's
    #[clap(long, default_value_t = 10)]
    #[clap(value_parser = clap::value_parser!(i32).range(1..=MAX_WRITER_PRIORITY as i64))]
    pub writer_priority: i32,
    /// Seconds between page cache syncs
    #[clap(long, default_value_t = 4)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub sync_interval: u64,
    /// Start a background flush of the output every N blocks
    #[clap(long)]
    pub flush_every: Option<u64>,
    /// Touch the whole output file and benchmark it before capturing
    #[clap(long)]
    pub preallocate: bool,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn radio_config(&self) -> RadioConfig {
        RadioConfig {
            sample_rate: self.rate,
            center_frequency: self.freq,
            gain: self.gain.map_or(Gain::Agc, Gain::Db),
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        let mut config = CaptureConfig::new(self.radio_config(), self.duration, &self.output);
        config.format = self.format;
        config.pool = PoolSizing::Seconds(self.pool_seconds);
        config.capture_core = Some(self.capture_core);
        config.writer_core = Some(self.writer_core);
        config.sync_core = Some(self.sync_core);
        config.writer_priority = self.writer_priority;
        config.sync_interval = Duration::from_secs(self.sync_interval);
        config.flush_every = self.flush_every.unwrap_or(0);
        config.preallocate = self.preallocate;
        config
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn valid_format(s: &str) -> Result<SampleFormat, String> {
    s.parse().map_err(|_| format!("Unknown sample format `{s}`, use cf32 or ci16"))
}

fn valid_pool_seconds(s: &str) -> Result<f64, String> {
    match s.parse::<f64>() {
        Ok(secs) if secs >= 1.0 => Ok(secs),
        Ok(_) => Err("The ring must hold at least a second of signal".to_string()),
        Err(_) => Err("Invalid number".to_string()),
    }
}
