//! Interface to the raw sample source (PDM/ADC/DMA driver)

use crate::Sample;
use crate::error::Result;

/// A fixed-rate sample source.
///
/// The driver owns its electrical configuration; the pipeline only starts it,
/// stops it, and drains completed DMA batches from it.
pub trait SampleProducer {
    /// The one rate this driver samples at
    fn sample_rate_hz(&self) -> u32;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    /// Copy the next completed batch into `buf`.
    ///
    /// Returns the number of samples copied, 0 if no batch is pending.
    fn read_batch(&mut self, buf: &mut [Sample]) -> usize;

    /// Throw away batches captured before the consumer was ready.
    fn drain(&mut self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::CaptureError;

    /// Deterministic producer emitting a ramp in fixed-size batches
    pub(crate) struct RampProducer {
        pub rate_hz: u32,
        pub batch: usize,
        pub next: i16,
        pub running: bool,
        pub fail_start: bool,
        pub starts: u32,
        pub stops: u32,
    }

    impl RampProducer {
        pub(crate) fn new(batch: usize) -> Self {
            Self {
                rate_hz: 16_000,
                batch,
                next: 0,
                running: false,
                fail_start: false,
                starts: 0,
                stops: 0,
            }
        }
    }

    impl SampleProducer for RampProducer {
        fn sample_rate_hz(&self) -> u32 {
            self.rate_hz
        }

        fn start(&mut self) -> Result<()> {
            if self.fail_start {
                return Err(CaptureError::ProducerFailed(CaptureError::message(
                    "pdm init error",
                )));
            }
            self.starts += 1;
            self.running = true;
            Ok(())
        }

        fn stop(&mut self) {
            self.stops += 1;
            self.running = false;
        }

        fn read_batch(&mut self, buf: &mut [Sample]) -> usize {
            if !self.running {
                return 0;
            }
            let n = self.batch.min(buf.len());
            for slot in &mut buf[..n] {
                *slot = self.next;
                self.next = self.next.wrapping_add(1);
            }
            n
        }
    }
}
