//! Continuous capture into a double buffer for a streaming classifier.

use log::{info, warn};

use crate::double_buffer::DoubleBuffer;
use crate::error::{CaptureError, Result};
use crate::pipeline::{AcquisitionPipeline, InferenceSink, Sink};
use crate::producer::SampleProducer;
use crate::signature::{HmacSha256Signer, Signer};
use crate::storage::FlashMedium;
use crate::Sample;

/// Handle to a running inference capture.
///
/// Windows are claimed with [`InferenceSession::poll_window`] and read with
/// [`InferenceSession::read_window`]. Dropping the handle without calling
/// [`InferenceSession::stop`] leaves the producer running.
pub struct InferenceSession<'s, 'p, M: FlashMedium, S: Signer = HmacSha256Signer> {
    pipeline: &'s AcquisitionPipeline<'p, M, S>,
    window_len: usize,
}

impl<'s, 'p, M: FlashMedium, S: Signer> InferenceSession<'s, 'p, M, S> {
    /// Allocate two windows of `n_samples`, register them on the pipeline
    /// and start `producer`.
    pub fn start<P: SampleProducer>(
        pipeline: &'s AcquisitionPipeline<'p, M, S>,
        producer: &mut P,
        n_samples: usize,
        interval_ms: f32,
    ) -> Result<Self> {
        let buffer = DoubleBuffer::try_new(n_samples)?;

        let supported_hz = producer.sample_rate_hz();
        let requested_hz = (1000.0 / interval_ms) as u32;
        if requested_hz != supported_hz {
            return Err(CaptureError::UnsupportedRate {
                requested_hz,
                supported_hz,
            });
        }

        pipeline.register(Sink::Inference(InferenceSink::new(buffer)))?;
        if let Err(e) = producer.start() {
            pipeline.deregister();
            return Err(e);
        }
        producer.drain();
        info!("Inference capture: {} sample windows at {} Hz", n_samples, requested_hz);

        Ok(Self {
            pipeline,
            window_len: n_samples,
        })
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// `Ok(true)` when a new window is ready. An overrun still hands over a
    /// window; the error says how many were lost before it.
    pub fn poll_window(&self) -> Result<bool> {
        self.pipeline.poll_window().inspect_err(|e| {
            if let CaptureError::BufferOverrun { missed } = e {
                warn!(
                    "Sample buffer overrun ({} missed). Decrease the number of slices per model window",
                    missed
                );
            }
        })
    }

    /// Copy the ready window from `offset` into `out` as `f32`.
    pub fn read_window(&self, offset: usize, out: &mut [f32]) -> usize {
        self.pipeline.read_window(offset, out)
    }

    pub fn with_window<R>(&self, f: impl FnOnce(&[Sample]) -> R) -> Option<R> {
        self.pipeline.with_window(f)
    }

    /// Flush stale batches and restart window filling from scratch.
    pub fn reset_buffers<P: SampleProducer>(&self, producer: &mut P) {
        producer.drain();
        self.pipeline.reset_window();
    }

    /// Deregister, stop the producer, then release both windows.
    pub fn stop<P: SampleProducer>(self, producer: &mut P) {
        let sink = self.pipeline.deregister();
        producer.stop();
        drop(sink);
        info!("Inference capture stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DMA_BATCH_SAMPLES;
    use crate::PipelineMode;
    use crate::producer::testing::RampProducer;
    use crate::storage::RamFlash;

    type Pipeline<'a> = AcquisitionPipeline<'a, RamFlash>;

    #[test]
    fn test_windows_arrive_in_order() {
        let pipeline = Pipeline::new();
        let mut producer = RampProducer::new(64);
        let session = InferenceSession::start(&pipeline, &mut producer, 128, 0.0625).unwrap();
        assert_eq!(pipeline.mode(), Some(PipelineMode::Inference));

        let mut dma = [0i16; DMA_BATCH_SAMPLES];
        let mut out = [0.0f32; 128];
        for window in 0..3 {
            assert_eq!(session.poll_window(), Ok(false));
            pipeline.pump(&mut producer, &mut dma);
            pipeline.pump(&mut producer, &mut dma);
            assert_eq!(session.poll_window(), Ok(true));
            assert_eq!(session.read_window(0, &mut out), 128);
            assert_eq!(out[0], (window * 128) as f32);
            assert_eq!(out[127], (window * 128 + 127) as f32);
        }
        session.stop(&mut producer);
        assert_eq!(producer.stops, 1);
        assert_eq!(pipeline.mode(), None);
    }

    #[test]
    fn test_slow_consumer_sees_overrun() {
        let pipeline = Pipeline::new();
        let mut producer = RampProducer::new(32);
        let session = InferenceSession::start(&pipeline, &mut producer, 32, 0.0625).unwrap();

        let mut dma = [0i16; DMA_BATCH_SAMPLES];
        for _ in 0..3 {
            pipeline.pump(&mut producer, &mut dma);
        }
        assert_eq!(
            session.poll_window(),
            Err(CaptureError::BufferOverrun { missed: 2 })
        );
        // The newest window is the one handed over
        assert_eq!(session.with_window(|w| w[0]), Some(64));
        pipeline.pump(&mut producer, &mut dma);
        assert_eq!(session.poll_window(), Ok(true));
        session.stop(&mut producer);
    }

    #[test]
    fn test_reset_buffers_drops_partial_window() {
        let pipeline = Pipeline::new();
        let mut producer = RampProducer::new(16);
        let session = InferenceSession::start(&pipeline, &mut producer, 32, 0.0625).unwrap();

        let mut dma = [0i16; DMA_BATCH_SAMPLES];
        pipeline.pump(&mut producer, &mut dma);
        session.reset_buffers(&mut producer);
        pipeline.pump(&mut producer, &mut dma);
        assert_eq!(session.poll_window(), Ok(false));
        pipeline.pump(&mut producer, &mut dma);
        assert_eq!(session.poll_window(), Ok(true));
        assert_eq!(session.with_window(|w| w[0]), Some(16));
        session.stop(&mut producer);
    }

    #[test]
    fn test_start_failures_leave_pipeline_free() {
        let pipeline = Pipeline::new();
        let mut producer = RampProducer::new(16);

        assert!(matches!(
            InferenceSession::start(&pipeline, &mut producer, 32, 0.25),
            Err(CaptureError::UnsupportedRate { requested_hz: 4000, .. })
        ));
        assert!(matches!(
            InferenceSession::start(&pipeline, &mut producer, 0, 0.0625),
            Err(CaptureError::AllocationFailed { .. })
        ));
        producer.fail_start = true;
        assert!(matches!(
            InferenceSession::start(&pipeline, &mut producer, 32, 0.0625),
            Err(CaptureError::ProducerFailed(_))
        ));
        assert_eq!(pipeline.mode(), None);
        assert!(!pipeline.is_armed());
    }
}
