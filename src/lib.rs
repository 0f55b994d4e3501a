pub mod args;
pub mod capture;
pub mod control;
pub mod error;
pub mod exfil;
pub mod format;
pub mod housekeeping;
pub mod loss;
pub mod monitoring;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod radio;
pub mod sched;
pub mod sim;

pub use error::CaptureError;
pub use pipeline::{run_capture, CaptureConfig, CaptureSummary};
pub use radio::{DeviceStatus, ErrorCode, RadioFrontEnd};
