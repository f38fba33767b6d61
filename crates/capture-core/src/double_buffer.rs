//! Two equal-size sample buffers swapped between an interrupt-side producer
//! and a foreground consumer.
//!
//! The producer only ever writes `buffers[active]`; the consumer only reads
//! `buffers[active ^ 1]`, and only while `ready` is set. Flipping `active` and
//! raising `ready` happen together in [`DoubleBuffer::push`], which callers run
//! under the pipeline's critical section.

use alloc::vec::Vec;

use log::warn;

use crate::Sample;
use crate::error::{CaptureError, Result};

pub struct DoubleBuffer {
    buffers: [Vec<Sample>; 2],
    active: usize,
    fill_count: usize,
    capacity: usize,
    ready: bool,
    /// Overruns since the consumer last polled
    pending_overruns: u32,
    total_overruns: u32,
}

fn try_alloc(capacity: usize) -> Result<Vec<Sample>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(capacity)
        .map_err(|_| CaptureError::AllocationFailed {
            bytes: capacity.saturating_mul(core::mem::size_of::<Sample>()),
        })?;
    buf.resize(capacity, 0);
    Ok(buf)
}

impl DoubleBuffer {
    /// Allocate both buffers of `capacity` samples.
    ///
    /// If the second allocation fails the first is released before returning.
    pub fn try_new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CaptureError::AllocationFailed { bytes: 0 });
        }
        let first = try_alloc(capacity)?;
        let second = try_alloc(capacity)?;
        Ok(Self {
            buffers: [first, second],
            active: 0,
            fill_count: 0,
            capacity,
            ready: false,
            pending_overruns: 0,
            total_overruns: 0,
        })
    }

    /// Append samples to the active buffer, flipping every time it fills.
    ///
    /// Returns the number of flips this call performed.
    pub fn push(&mut self, samples: &[Sample]) -> usize {
        let mut flips = 0;
        let mut rest = samples;
        while !rest.is_empty() {
            let room = self.capacity - self.fill_count;
            let take = room.min(rest.len());
            let start = self.fill_count;
            self.buffers[self.active][start..start + take].copy_from_slice(&rest[..take]);
            self.fill_count += take;
            rest = &rest[take..];

            if self.fill_count == self.capacity {
                self.flip();
                flips += 1;
            }
        }
        flips
    }

    fn flip(&mut self) {
        if self.ready {
            self.pending_overruns += 1;
            self.total_overruns += 1;
            warn!(
                "Sample buffer overrun ({} total), consumer did not keep up",
                self.total_overruns
            );
        }
        self.active ^= 1;
        self.fill_count = 0;
        self.ready = true;
    }

    /// Consumer side: check for a full window and claim it.
    ///
    /// `Ok(true)` means a window is ready in [`DoubleBuffer::ready_window`].
    /// `Err(BufferOverrun)` also hands over a window, but at least one earlier
    /// window was overwritten, so its contents may be stale.
    pub fn poll_ready(&mut self) -> Result<bool> {
        if !self.ready {
            return Ok(false);
        }
        self.ready = false;
        if self.pending_overruns > 0 {
            let missed = core::mem::take(&mut self.pending_overruns);
            return Err(CaptureError::BufferOverrun { missed });
        }
        Ok(true)
    }

    /// The buffer the consumer may read (the one not being filled)
    pub fn ready_window(&self) -> &[Sample] {
        &self.buffers[self.active ^ 1]
    }

    /// Convert part of the ready window to `f32`, starting at `offset`.
    ///
    /// Returns the number of samples written to `out`.
    pub fn read_window(&self, offset: usize, out: &mut [f32]) -> usize {
        let window = self.ready_window();
        let Some(src) = window.get(offset..) else {
            return 0;
        };
        let n = src.len().min(out.len());
        for (dst, &s) in out[..n].iter_mut().zip(src) {
            *dst = s as f32;
        }
        n
    }

    /// Drop any partial fill and pending window.
    pub fn reset(&mut self) {
        self.fill_count = 0;
        self.ready = false;
        self.pending_overruns = 0;
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn fill_count(&self) -> usize {
        self.fill_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn total_overruns(&self) -> u32 {
        self.total_overruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn ramp(start: i16, n: usize) -> Vec<Sample> {
        (0..n).map(|i| start + i as i16).collect()
    }

    #[test]
    fn test_flip_exactly_at_capacity() {
        let mut db = DoubleBuffer::try_new(8).unwrap();
        assert_eq!(db.push(&ramp(0, 7)), 0);
        assert!(!db.is_ready());
        assert_eq!(db.active_index(), 0);

        assert_eq!(db.push(&ramp(7, 1)), 1);
        assert!(db.is_ready());
        assert_eq!(db.active_index(), 1);
        assert_eq!(db.fill_count(), 0);
        assert_eq!(db.ready_window(), &ramp(0, 8)[..]);
    }

    #[test]
    fn test_batch_spanning_flip() {
        let mut db = DoubleBuffer::try_new(4).unwrap();
        assert_eq!(db.push(&ramp(0, 6)), 1);
        assert_eq!(db.fill_count(), 2);
        assert_eq!(db.ready_window(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_poll_clears_ready() {
        let mut db = DoubleBuffer::try_new(4).unwrap();
        assert_eq!(db.poll_ready(), Ok(false));
        db.push(&ramp(0, 4));
        assert_eq!(db.poll_ready(), Ok(true));
        assert_eq!(db.poll_ready(), Ok(false));
    }

    #[test]
    fn test_overrun_reported_and_bounds_hold() {
        let mut db = DoubleBuffer::try_new(4).unwrap();
        // Three windows without consuming: two flips hit an unread window
        assert_eq!(db.push(&ramp(0, 12)), 3);
        assert_eq!(db.total_overruns(), 2);
        assert_eq!(db.fill_count(), 0);
        assert_eq!(db.active_index(), 1);
        assert_eq!(db.ready_window(), &[8, 9, 10, 11]);

        assert_eq!(
            db.poll_ready(),
            Err(CaptureError::BufferOverrun { missed: 2 })
        );
        // Reported once, pipeline keeps going
        db.push(&ramp(20, 4));
        assert_eq!(db.poll_ready(), Ok(true));
        assert_eq!(db.total_overruns(), 2);
    }

    #[test]
    fn test_read_window_converts() {
        let mut db = DoubleBuffer::try_new(4).unwrap();
        db.push(&[-2, -1, 0, 1000]);
        let mut out = vec![0.0f32; 3];
        assert_eq!(db.read_window(1, &mut out), 3);
        assert_eq!(out, vec![-1.0, 0.0, 1000.0]);
        assert_eq!(db.read_window(4, &mut out), 0);
        assert_eq!(db.read_window(9, &mut out), 0);
    }

    #[test]
    fn test_reset_discards_partial_fill() {
        let mut db = DoubleBuffer::try_new(4).unwrap();
        db.push(&ramp(0, 6));
        db.reset();
        assert!(!db.is_ready());
        assert_eq!(db.fill_count(), 0);
    }

    #[test]
    fn test_allocation_failure() {
        assert!(matches!(
            DoubleBuffer::try_new(0),
            Err(CaptureError::AllocationFailed { .. })
        ));
        assert!(matches!(
            DoubleBuffer::try_new(usize::MAX / 2),
            Err(CaptureError::AllocationFailed { .. })
        ));
    }
}
