//! Cooperative shutdown.
//!
//! Nothing in the pipeline is cancelled mid-cycle. The capture thread checks a
//! [`StopSignal`] between buffers, while the writer and the cache housekeeper
//! each run while their own [`RunFlag`] is set. The writer also stops on the
//! queue sentinel.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A one-way "please stop" request. Requesting more than once is harmless.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call was the one that made the request
    pub fn request(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A worker keeps going while this is set
#[derive(Clone, Debug, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    /// A flag that starts out set
    pub fn running() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Lifecycle of a queue-draining worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// Saw the sentinel (or lost its run flag), finishing what's queued
    Draining,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let stop = StopSignal::new();
        let other = stop.clone();
        assert!(!other.is_requested());
        assert!(stop.request());
        assert!(!other.request());
        assert!(other.is_requested());
    }

    #[test]
    fn test_run_flag() {
        let flag = RunFlag::running();
        assert!(flag.is_set());
        flag.clear();
        assert!(!flag.clone().is_set());
        flag.set();
        assert!(flag.is_set());
    }
}
