//! The handoff queue between the capture thread and the writer.
//!
//! This is the only synchronization point between the two. It carries filled
//! slots in acquisition order, followed by exactly one [`Handoff::Sentinel`].
//! Capacity is one more than the pool, so the filled entries can never exceed
//! the pool and the sentinel always has room.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use thiserror::Error;

use crate::pool::Slot;

/// A filled buffer on its way to the output region
#[derive(Debug)]
pub struct QueueEntry {
    /// Absolute block number in the output region
    pub index: u64,
    pub slot: Slot,
}

#[derive(Debug)]
pub enum Handoff {
    Block(QueueEntry),
    /// Nothing follows, shut down
    Sentinel,
}

/// The writer went away; the entry that couldn't be delivered comes back
#[derive(Debug, Error)]
#[error("handoff queue receiver disconnected")]
pub struct Disconnected(pub Option<QueueEntry>);

pub struct HandoffSender {
    tx: Sender<Handoff>,
    closed: bool,
}

pub struct HandoffReceiver {
    rx: Receiver<Handoff>,
    pool_size: usize,
}

/// Build a queue for a pool of `pool_size` slots
pub fn handoff_queue(pool_size: usize) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = bounded(pool_size + 1);
    (
        HandoffSender { tx, closed: false },
        HandoffReceiver { rx, pool_size },
    )
}

impl HandoffSender {
    /// Enqueue a filled slot, blocking while the queue is full.
    ///
    /// Returns whether the push had to wait.
    pub fn push(&self, entry: QueueEntry) -> Result<bool, Disconnected> {
        match self.tx.try_send(Handoff::Block(entry)) {
            Ok(()) => Ok(false),
            Err(TrySendError::Full(item)) => match self.tx.send(item) {
                Ok(()) => Ok(true),
                Err(e) => Err(Disconnected(block_of(e.into_inner()))),
            },
            Err(TrySendError::Disconnected(item)) => Err(Disconnected(block_of(item))),
        }
    }

    /// Send the sentinel. Only the first call does anything.
    pub fn close(&mut self) -> Result<(), Disconnected> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.tx
            .send(Handoff::Sentinel)
            .map_err(|_| Disconnected(None))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn depth(&self) -> usize {
        self.tx.len()
    }
}

fn block_of(item: Handoff) -> Option<QueueEntry> {
    match item {
        Handoff::Block(entry) => Some(entry),
        Handoff::Sentinel => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopError {
    Empty,
    /// The sender is gone and nothing is left
    Disconnected,
}

impl HandoffReceiver {
    /// Block until something arrives, `None` once the sender is gone and the
    /// queue is empty
    pub fn pop(&self) -> Option<Handoff> {
        self.rx.recv().ok()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Result<Handoff, PopError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => PopError::Empty,
            RecvTimeoutError::Disconnected => PopError::Disconnected,
        })
    }

    pub fn try_pop(&self) -> Result<Handoff, PopError> {
        self.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => PopError::Empty,
            TryRecvError::Disconnected => PopError::Disconnected,
        })
    }

    /// Entries waiting right now
    pub fn depth(&self) -> usize {
        self.rx.len()
    }

    /// Most filled entries the queue can ever hold
    pub fn capacity(&self) -> usize {
        self.pool_size
    }
}
