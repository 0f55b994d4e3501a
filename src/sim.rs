//! A simulated front-end so the pipeline can run without hardware.
//!
//! The device clock advances by one buffer per delivered buffer, and by the
//! scripted gap on an overflow, so the dropped-sample estimate downstream sees
//! the same timestamps a real receiver would report.

use std::{
    collections::BTreeMap,
    f64::consts::TAU,
    thread,
    time::{Duration as StdDuration, Instant},
};

use hifitime::Duration;
use tracing::debug;

use crate::radio::{DeviceStatus, ErrorCode, Gain, RadioConfig, RadioError, RadioFrontEnd};

pub const DEFAULT_BUFFER_LEN: usize = 2040;

/// What the simulated receiver puts in the buffers
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Waveform {
    /// I = cycle number, Q = sample position within the buffer
    Counter,
    /// A complex exponential at the given offset from the center frequency
    Tone { offset_hz: f64 },
}

/// An anomaly injected at a given cycle
#[derive(Clone, Debug, PartialEq)]
pub enum Scripted {
    /// Report an error code with an empty buffer
    Status {
        error: ErrorCode,
        out_of_sequence: bool,
    },
    /// Report an overflow and skip `dropped` samples of device time
    Overflow { dropped: u64, out_of_sequence: bool },
    /// Fail the receive call outright
    Fault(String),
}

pub struct SimulatedRadio {
    buffer_len: usize,
    sample_rate: f64,
    center_frequency: f64,
    gain: Gain,
    waveform: Waveform,
    pace: bool,
    streaming: bool,
    cycle: u64,
    // Device clock in samples
    clock: u64,
    phase: f64,
    started: Option<Instant>,
    script: BTreeMap<u64, Scripted>,
    restarts: u64,
}

impl SimulatedRadio {
    pub fn new(buffer_len: usize) -> Self {
        Self {
            buffer_len,
            sample_rate: 1e6,
            center_frequency: 0.0,
            gain: Gain::Agc,
            waveform: Waveform::Counter,
            pace: false,
            streaming: false,
            cycle: 0,
            clock: 0,
            phase: 0.0,
            started: None,
            script: BTreeMap::new(),
            restarts: 0,
        }
    }

    /// Build from a `key=value,key=value` device argument string.
    ///
    /// Recognized keys are `buffer_len`, `pace`, `waveform` (`counter` or
    /// `tone`) and `tone_hz`. Anything else is meant for a real driver and is
    /// ignored.
    pub fn from_args(args: &str) -> Result<Self, RadioError> {
        let mut radio = Self::new(DEFAULT_BUFFER_LEN);
        let mut tone_hz = 0.0;
        let mut tone = false;
        for part in args.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, val) = part
                .split_once('=')
                .ok_or_else(|| RadioError::Arguments(format!("expected key=value, got `{part}`")))?;
            let (key, val) = (key.trim(), val.trim());
            let bad = || RadioError::Arguments(format!("bad value for {key}: `{val}`"));
            match key {
                "buffer_len" => {
                    radio.buffer_len = val.parse().map_err(|_| bad())?;
                    if radio.buffer_len == 0 {
                        return Err(bad());
                    }
                }
                "pace" => radio.pace = val.parse().map_err(|_| bad())?,
                "waveform" => match val {
                    "counter" => tone = false,
                    "tone" => tone = true,
                    _ => return Err(bad()),
                },
                "tone_hz" => {
                    tone_hz = val.parse().map_err(|_| bad())?;
                    tone = true;
                }
                _ => debug!(key, "ignoring device argument"),
            }
        }
        if tone {
            radio.waveform = Waveform::Tone { offset_hz: tone_hz };
        }
        Ok(radio)
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = waveform;
        self
    }

    /// Sleep so buffers come out no faster than the configured rate
    pub fn paced(mut self, pace: bool) -> Self {
        self.pace = pace;
        self
    }

    pub fn with_event(mut self, cycle: u64, event: Scripted) -> Self {
        self.script.insert(cycle, event);
        self
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn now(&self) -> Duration {
        Duration::from_seconds(self.clock as f64 / self.sample_rate)
    }

    fn fill(&mut self, buffer: &mut [f32]) {
        match self.waveform {
            Waveform::Counter => {
                let cycle = self.cycle as f32;
                for (k, iq) in buffer.chunks_exact_mut(2).enumerate() {
                    iq[0] = cycle;
                    iq[1] = k as f32;
                }
            }
            Waveform::Tone { offset_hz } => {
                let step = TAU * offset_hz / self.sample_rate;
                for iq in buffer.chunks_exact_mut(2) {
                    iq[0] = 0.5 * self.phase.cos() as f32;
                    iq[1] = 0.5 * self.phase.sin() as f32;
                    self.phase = (self.phase + step) % TAU;
                }
            }
        }
    }

    fn wait_for_clock(&self) {
        if let Some(started) = self.started {
            let due = started + StdDuration::from_secs_f64(self.clock as f64 / self.sample_rate);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
    }
}

impl RadioFrontEnd for SimulatedRadio {
    fn configure(&mut self, config: &RadioConfig) -> Result<(), RadioError> {
        if !(config.sample_rate.is_finite() && config.sample_rate > 0.0) {
            return Err(RadioError::Config(format!(
                "unsupported sample rate {}",
                config.sample_rate
            )));
        }
        if let Gain::Db(db) = config.gain {
            if !(0.0..=76.0).contains(&db) {
                return Err(RadioError::Config(format!("gain {db} dB out of range")));
            }
        }
        self.sample_rate = config.sample_rate;
        self.center_frequency = config.center_frequency;
        self.gain = config.gain;
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<(), RadioError> {
        self.streaming = true;
        debug!(
            rate = self.sample_rate,
            freq = self.center_frequency,
            gain = ?self.gain,
            "simulated stream started"
        );
        if self.pace && self.started.is_none() {
            self.started = Some(Instant::now());
        }
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), RadioError> {
        self.streaming = false;
        Ok(())
    }

    fn restart_streaming(&mut self) -> Result<(), RadioError> {
        self.restarts += 1;
        self.start_streaming()
    }

    fn receive_next(&mut self, buffer: &mut [f32]) -> Result<DeviceStatus, RadioError> {
        if buffer.len() != 2 * self.buffer_len {
            return Err(RadioError::Runtime(format!(
                "receive buffer holds {} floats, expected {}",
                buffer.len(),
                2 * self.buffer_len
            )));
        }
        let time = self.now();
        let event = self.script.remove(&self.cycle);
        if !self.streaming && event.is_none() {
            self.cycle += 1;
            buffer.fill(0.0);
            return Ok(DeviceStatus::with_error(ErrorCode::Timeout, time));
        }
        let status = match event {
            None => {
                if self.pace {
                    self.wait_for_clock();
                }
                self.fill(buffer);
                self.clock += self.buffer_len as u64;
                DeviceStatus::ok(time)
            }
            Some(Scripted::Fault(msg)) => {
                self.cycle += 1;
                return Err(RadioError::Runtime(msg));
            }
            Some(Scripted::Overflow {
                dropped,
                out_of_sequence,
            }) => {
                buffer.fill(0.0);
                self.clock += dropped;
                DeviceStatus {
                    error: ErrorCode::Overflow,
                    time,
                    out_of_sequence,
                }
            }
            Some(Scripted::Status {
                error,
                out_of_sequence,
            }) => {
                buffer.fill(0.0);
                if error == ErrorCode::Late {
                    self.streaming = false;
                }
                DeviceStatus {
                    error,
                    time,
                    out_of_sequence,
                }
            }
        };
        self.cycle += 1;
        Ok(status)
    }

    fn max_buffer_length(&self) -> usize {
        self.buffer_len
    }

    fn channel_count(&self) -> usize {
        1
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_args() {
        let radio = SimulatedRadio::from_args("num_recv_frames=1979, buffer_len=100,tone_hz=1e3")
            .unwrap();
        assert_eq!(radio.max_buffer_length(), 100);
        assert_eq!(radio.waveform, Waveform::Tone { offset_hz: 1e3 });
        assert!(SimulatedRadio::from_args("buffer_len=0").is_err());
        assert!(SimulatedRadio::from_args("pace").is_err());
    }

    #[test]
    fn test_counter_fill_and_clock() {
        let mut radio = SimulatedRadio::new(4);
        radio.start_streaming().unwrap();
        let mut buf = [0f32; 8];
        let first = radio.receive_next(&mut buf).unwrap();
        let second = radio.receive_next(&mut buf).unwrap();
        assert_eq!(first.time, Duration::ZERO);
        assert_eq!(second.time, Duration::from_seconds(4.0 / 1e6));
        assert_eq!(buf, [1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
    }

    #[test]
    fn test_late_idles_until_restart() {
        let late = Scripted::Status {
            error: ErrorCode::Late,
            out_of_sequence: false,
        };
        let mut radio = SimulatedRadio::new(2).with_event(0, late);
        radio.start_streaming().unwrap();
        let mut buf = [0f32; 4];
        assert_eq!(radio.receive_next(&mut buf).unwrap().error, ErrorCode::Late);
        assert_eq!(radio.receive_next(&mut buf).unwrap().error, ErrorCode::Timeout);
        radio.restart_streaming().unwrap();
        assert_eq!(radio.receive_next(&mut buf).unwrap().error, ErrorCode::None);
        assert_eq!(radio.restarts(), 1);
    }

    #[test]
    fn test_wrong_buffer_is_fatal() {
        let mut radio = SimulatedRadio::new(2);
        radio.start_streaming().unwrap();
        let mut buf = [0f32; 3];
        assert!(matches!(
            radio.receive_next(&mut buf),
            Err(RadioError::Runtime(_))
        ));
    }
}
