//! The ring of receive buffers shared by the capture and writer threads.
//!
//! Slots are allocated once and then move between the two threads by value:
//! the capture thread takes a free slot, fills it and hands it to the writer
//! through the handoff queue; the writer copies it out and returns it here.
//! The return path is an `rtrb` ring sized to the pool, so returning can never
//! fail and the capture thread can pick slots back up without a lock.
//!
//! Because the writer consumes in FIFO order, slots come back in the order they
//! were handed out and cycle `n` always lands in slot `n % pool_size`.

use std::{thread, time::Duration};

use rtrb::{Consumer, Producer, RingBuffer};

use crate::control::StopSignal;

// Spin this long on an empty free ring, then park so a writer sharing the
// core gets to run.
const SPINS_BEFORE_PARK: u32 = 1 << 12;
const PARK_TIME: Duration = Duration::from_micros(50);

/// One receive buffer
#[derive(Debug)]
pub struct Slot {
    index: usize,
    generation: u64,
    samples: Box<[f32]>,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }

    /// How many times this slot has been filled
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Interleaved I/Q floats
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    /// Mark the slot as holding a new buffer
    pub(crate) fn stamp(&mut self) {
        self.generation += 1;
    }

    /// The generation a slot must carry when it holds `cycle`, if it came
    /// through a pool of `pool_size` slots in order
    pub fn expected_generation(cycle: u64, pool_size: usize) -> u64 {
        cycle / pool_size as u64 + 1
    }
}

/// Capture side of the pool: takes free slots
pub struct SlotSource {
    free: Consumer<Slot>,
    pool_size: usize,
}

/// Writer side of the pool: gives consumed slots back
pub struct SlotSink {
    free: Producer<Slot>,
}

/// Allocate `pool_size` slots of `buffer_len` complex samples each
pub fn ring_pool(pool_size: usize, buffer_len: usize) -> (SlotSource, SlotSink) {
    let (mut producer, consumer) = RingBuffer::new(pool_size);
    for index in 0..pool_size {
        let slot = Slot {
            index,
            generation: 0,
            samples: vec![0f32; 2 * buffer_len].into_boxed_slice(),
        };
        // The ring was sized for exactly these slots
        if producer.push(slot).is_err() {
            unreachable!("free ring smaller than the pool");
        }
    }
    (
        SlotSource {
            free: consumer,
            pool_size,
        },
        SlotSink { free: producer },
    )
}

impl SlotSource {
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.free.slots()
    }

    /// Take the next free slot without waiting
    pub fn try_acquire(&mut self) -> Option<Slot> {
        self.free.pop().ok()
    }

    /// Take the next free slot, waiting for the writer to return one if the
    /// whole pool is in flight.
    ///
    /// Returns the slot and whether we had to wait, or `None` if `stop` was
    /// requested while waiting.
    pub fn acquire(&mut self, stop: &StopSignal) -> Option<(Slot, bool)> {
        if let Ok(slot) = self.free.pop() {
            return Some((slot, false));
        }
        let mut spins = 0u32;
        loop {
            if let Ok(slot) = self.free.pop() {
                return Some((slot, true));
            }
            if stop.is_requested() {
                return None;
            }
            if spins < SPINS_BEFORE_PARK {
                spins += 1;
                std::hint::spin_loop();
            } else {
                thread::park_timeout(PARK_TIME);
            }
        }
    }
}

impl SlotSink {
    /// Return a consumed slot to the capture side
    pub fn release(&mut self, slot: Slot) {
        // Only pool_size slots exist and the ring holds pool_size, so this
        // can't be full
        if self.free.push(slot).is_err() {
            unreachable!("free ring overflowed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_cycle_in_order() {
        let (mut source, mut sink) = ring_pool(3, 4);
        assert_eq!(source.available(), 3);
        for cycle in 0..10u64 {
            let mut slot = source.try_acquire().unwrap();
            assert_eq!(slot.index(), (cycle % 3) as usize);
            assert_eq!(slot.samples().len(), 8);
            slot.stamp();
            assert_eq!(slot.generation(), Slot::expected_generation(cycle, 3));
            sink.release(slot);
        }
    }

    #[test]
    fn test_exhausted_pool_waits() {
        let (mut source, _sink) = ring_pool(2, 1);
        let _a = source.try_acquire().unwrap();
        let _b = source.try_acquire().unwrap();
        assert!(source.try_acquire().is_none());

        let stop = StopSignal::new();
        stop.request();
        assert!(source.acquire(&stop).is_none());
    }

    #[test]
    fn test_release_unblocks_acquire() {
        let (mut source, mut sink) = ring_pool(1, 1);
        let slot = source.try_acquire().unwrap();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sink.release(slot);
        });
        let (slot, _) = source.acquire(&StopSignal::new()).unwrap();
        assert_eq!(slot.index(), 0);
        handle.join().unwrap();
    }
}
