//! The boundary to the radio front-end.
//!
//! Tuning, gain and stream commands belong to the device driver; the capture
//! core only needs a synchronous "fill this buffer" call and the status the
//! device attaches to every buffer.

use hifitime::Duration;
use thiserror::Error;

/// How the device reports a buffer it just handed us
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    None,
    /// The device dropped samples because the host didn't read fast enough
    Overflow,
    /// A timed stream command arrived after its start time, the stream is idle
    Late,
    /// Nothing arrived within the receive timeout
    Timeout,
    /// Anything else the driver can report (raw driver code)
    Other(u32),
}

/// Per-buffer metadata returned by [`RadioFrontEnd::receive_next`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceStatus {
    pub error: ErrorCode,
    /// Device time of the first sample in the buffer
    pub time: Duration,
    pub out_of_sequence: bool,
}

impl DeviceStatus {
    pub fn ok(time: Duration) -> Self {
        Self {
            error: ErrorCode::None,
            time,
            out_of_sequence: false,
        }
    }

    pub fn with_error(error: ErrorCode, time: Duration) -> Self {
        Self {
            error,
            time,
            out_of_sequence: false,
        }
    }
}

/// Receive gain: either a fixed value or the device's automatic gain control
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Gain {
    Agc,
    Db(f64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RadioConfig {
    /// Samples per second
    pub sample_rate: f64,
    /// Hz
    pub center_frequency: f64,
    pub gain: Gain,
}

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("invalid device arguments: {0}")]
    Arguments(String),
    #[error("device rejected configuration: {0}")]
    Config(String),
    /// Unrecoverable runtime condition, the stream can't continue
    #[error("device runtime error: {0}")]
    Runtime(String),
}

/// A pull-based radio receiver.
///
/// `receive_next` blocks until the buffer is filled or the device reports an
/// error or timeout. Buffers are interleaved I/Q `f32` pairs, so a buffer of
/// `max_buffer_length()` samples is twice that many floats long.
pub trait RadioFrontEnd: Send {
    fn configure(&mut self, config: &RadioConfig) -> Result<(), RadioError>;

    fn start_streaming(&mut self) -> Result<(), RadioError>;

    fn stop_streaming(&mut self) -> Result<(), RadioError>;

    /// Bring the stream back after a `late` report. How long to wait before the
    /// new start time is the adapter's business.
    fn restart_streaming(&mut self) -> Result<(), RadioError> {
        self.start_streaming()
    }

    fn receive_next(&mut self, buffer: &mut [f32]) -> Result<DeviceStatus, RadioError>;

    /// Complex samples per buffer
    fn max_buffer_length(&self) -> usize;

    fn channel_count(&self) -> usize;

    /// The rate the device actually runs at after `configure`
    fn sample_rate(&self) -> f64;
}
