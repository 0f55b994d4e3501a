use std::{io, path::PathBuf};

use thiserror::Error;

use crate::radio::RadioError;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("output region {}: {source}", path.display())]
    Output { path: PathBuf, source: io::Error },
    #[error("block {index} lies outside the output region ({blocks} blocks)")]
    OutOfBounds { index: u64, blocks: u64 },
    #[error("block holds {got} bytes, the output region expects {expected}")]
    BlockSize { got: usize, expected: usize },
    #[error("nothing to capture: {0}")]
    EmptyPlan(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to spawn the {role} thread: {source}")]
    Spawn { role: &'static str, source: io::Error },
    #[error("the {0} thread panicked")]
    WorkerPanicked(&'static str),
    #[error(transparent)]
    Radio(#[from] RadioError),
}
