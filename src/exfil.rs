//! This module is responsible for exfilling captured buffers to the output file

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{error, info, warn};

use crate::{
    control::{RunFlag, WorkerState},
    monitoring::Telemetry,
    output::OutputRegion,
    pool::{Slot, SlotSink},
    queue::{Handoff, HandoffReceiver, PopError, QueueEntry},
};

// How long to wait on an empty queue before looking at the run flag again
const POLL: Duration = Duration::from_millis(100);
// Don't warn about a deep queue more often than this
const BACKLOG_WARN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriterReport {
    pub blocks_written: u64,
    /// Deepest the queue got, counting the entry being popped
    pub max_depth: usize,
    pub capacity: usize,
    /// Entries whose slot didn't carry the generation their cycle implies
    pub generation_mismatches: u64,
    pub write_errors: u64,
    pub state: WorkerState,
}

/// Consumes the handoff queue into the memory-mapped output region
pub struct StorageWriter {
    queue: HandoffReceiver,
    sink: SlotSink,
    region: OutputRegion,
    telemetry: Arc<Telemetry>,
    flush_every: u64,
    last_backlog_warn: Option<Instant>,
    report: WriterReport,
}

impl StorageWriter {
    pub fn new(
        queue: HandoffReceiver,
        sink: SlotSink,
        region: OutputRegion,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let capacity = queue.capacity();
        Self {
            queue,
            sink,
            region,
            telemetry,
            flush_every: 0,
            last_backlog_warn: None,
            report: WriterReport {
                blocks_written: 0,
                max_depth: 0,
                capacity,
                generation_mismatches: 0,
                write_errors: 0,
                state: WorkerState::Running,
            },
        }
    }

    /// Start an asynchronous write-back every `blocks` stored blocks (0 never)
    pub fn with_flush_every(mut self, blocks: u64) -> Self {
        self.flush_every = blocks;
        self
    }

    fn store(&mut self, entry: QueueEntry) {
        let capacity = self.report.capacity;
        let depth = (self.queue.depth() + 1).min(capacity);
        self.report.max_depth = self.report.max_depth.max(depth);
        self.telemetry.record_written(depth);
        if depth > capacity / 2
            && self
                .last_backlog_warn
                .map_or(true, |t| t.elapsed() >= BACKLOG_WARN_INTERVAL)
        {
            warn!("writer falling behind, queue_size = {depth}/{capacity}");
            self.last_backlog_warn = Some(Instant::now());
        }

        let QueueEntry { index, slot } = entry;
        if slot.generation() != Slot::expected_generation(index, capacity) {
            self.report.generation_mismatches += 1;
            error!(
                "block {index} came in slot {} at generation {}, expected {}",
                slot.index(),
                slot.generation(),
                Slot::expected_generation(index, capacity)
            );
        }
        match self.region.write_block(index, slot.samples()) {
            Ok(()) => self.report.blocks_written += 1,
            Err(e) => {
                self.report.write_errors += 1;
                error!("dropping block {index}: {e}");
            }
        }
        self.sink.release(slot);

        if self.flush_every > 0 && self.report.blocks_written % self.flush_every == 0 {
            if let Err(e) = self.region.flush_async() {
                warn!("background flush failed: {e}");
            }
        }
    }

    /// Take whatever is still queued without waiting for more
    fn drain(&mut self) {
        loop {
            match self.queue.try_pop() {
                Ok(Handoff::Block(entry)) => self.store(entry),
                Ok(Handoff::Sentinel) => (),
                Err(_) => break,
            }
        }
    }

    /// Store blocks until the sentinel arrives or `running` is cleared, then
    /// drain the queue, flush, and hand the region back
    pub fn run(mut self, running: &RunFlag) -> (OutputRegion, WriterReport) {
        info!("writer starting, {} blocks", self.region.blocks());
        while self.report.state == WorkerState::Running {
            if !running.is_set() {
                self.report.state = WorkerState::Draining;
                break;
            }
            match self.queue.pop_timeout(POLL) {
                Ok(Handoff::Block(entry)) => self.store(entry),
                Ok(Handoff::Sentinel) => self.report.state = WorkerState::Draining,
                Err(PopError::Empty) => (),
                Err(PopError::Disconnected) => {
                    warn!("capture side went away without a sentinel");
                    self.report.state = WorkerState::Draining;
                }
            }
        }
        self.drain();
        if let Err(e) = self.region.flush() {
            error!("final flush failed: {e}");
        }
        self.report.state = WorkerState::Stopped;
        info!(
            "writer stopping, queue_size = {} max = {}/{}",
            self.queue.depth(),
            self.report.max_depth,
            self.report.capacity
        );
        (self.region, self.report)
    }
}
