//! Routing of producer callbacks into exactly one sink.
//!
//! The pipeline owns a single callback slot. A logging session registers a
//! [`LoggingSink`] (block store + signature), an inference session registers an
//! [`InferenceSink`] (double buffer). [`AcquisitionPipeline::deliver`] is the
//! entry point called from interrupt/DMA-completion context: it never blocks,
//! it copies bytes and does bookkeeping inside a short critical section.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{error, info, trace};

use crate::double_buffer::DoubleBuffer;
use crate::error::{CaptureError, Result};
use crate::producer::SampleProducer;
use crate::signature::{HmacSha256Signer, SignatureContext, Signer};
use crate::storage::{FlashMedium, SharedBlockStore};
use crate::{DMA_BATCH_SAMPLES, SAMPLE_WIDTH, Sample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Logging,
    Inference,
}

/// Writes each batch to the log and feeds it to the signer
pub struct LoggingSink<'a, M: FlashMedium, S: Signer = HmacSha256Signer> {
    store: &'a SharedBlockStore<M>,
    signature: SignatureContext<S>,
    header_offset: u32,
    bytes_written: u32,
    bytes_required: u32,
    fault: Option<CaptureError>,
}

impl<'a, M: FlashMedium, S: Signer> LoggingSink<'a, M, S> {
    /// `signature` must already hold the sealed header; payload is written
    /// right after it.
    pub fn new(
        store: &'a SharedBlockStore<M>,
        signature: SignatureContext<S>,
        bytes_required: u32,
    ) -> Self {
        let header_offset = signature.header_len() as u32;
        Self {
            store,
            signature,
            header_offset,
            bytes_written: 0,
            bytes_required,
            fault: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_written >= self.bytes_required
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    pub fn header_offset(&self) -> u32 {
        self.header_offset
    }

    /// Storage error latched by a callback, if any
    pub fn fault(&self) -> Option<&CaptureError> {
        self.fault.as_ref()
    }

    /// Hand back the signature for finalization.
    pub fn into_signature(self) -> SignatureContext<S> {
        self.signature
    }

    fn accept(&mut self, samples: &[Sample]) {
        if self.fault.is_some() || self.is_complete() {
            return;
        }
        let remaining = ((self.bytes_required - self.bytes_written) / SAMPLE_WIDTH) as usize;
        let samples = &samples[..samples.len().min(remaining)];

        let mut bytes = [0u8; DMA_BATCH_SAMPLES * SAMPLE_WIDTH as usize];
        for chunk in samples.chunks(DMA_BATCH_SAMPLES) {
            let n = chunk.len() * SAMPLE_WIDTH as usize;
            for (dst, s) in bytes.chunks_exact_mut(SAMPLE_WIDTH as usize).zip(chunk) {
                dst.copy_from_slice(&s.to_le_bytes());
            }

            let address = self.header_offset + self.bytes_written;
            let written = self
                .store
                .with(|store| store.write_sample_exact(address, &bytes[..n]));
            if let Err(e) = written {
                error!("Sample write failed: {}", e);
                self.fault = Some(e);
                return;
            }

            self.signature.update(&bytes[..n]);
            self.bytes_written += n as u32;
        }
        trace!("Logged {}/{} bytes", self.bytes_written, self.bytes_required);
    }
}

/// Fills the double buffer for an inference consumer
pub struct InferenceSink {
    buffer: DoubleBuffer,
}

impl InferenceSink {
    pub fn new(buffer: DoubleBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &DoubleBuffer {
        &self.buffer
    }
}

/// What the producer callback feeds. Exactly one is registered at a time.
pub enum Sink<'a, M: FlashMedium, S: Signer = HmacSha256Signer> {
    Logging(LoggingSink<'a, M, S>),
    Inference(InferenceSink),
}

impl<M: FlashMedium, S: Signer> Sink<'_, M, S> {
    pub fn mode(&self) -> PipelineMode {
        match self {
            Self::Logging(_) => PipelineMode::Logging,
            Self::Inference(_) => PipelineMode::Inference,
        }
    }
}

pub struct AcquisitionPipeline<'a, M: FlashMedium, S: Signer = HmacSha256Signer> {
    /// Cleared before the sink is torn down so a racing callback backs off
    armed: AtomicBool,
    slot: Mutex<CriticalSectionRawMutex, RefCell<Option<Sink<'a, M, S>>>>,
}

impl<M: FlashMedium, S: Signer> Default for AcquisitionPipeline<'_, M, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, M: FlashMedium, S: Signer> AcquisitionPipeline<'a, M, S> {
    pub const fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            slot: Mutex::new(RefCell::new(None)),
        }
    }

    /// Install `sink` as the callback target and arm the pipeline.
    pub fn register(&self, sink: Sink<'a, M, S>) -> Result<()> {
        let mode = sink.mode();
        self.slot.lock(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(CaptureError::SinkBusy);
            }
            *slot = Some(sink);
            Ok(())
        })?;
        self.armed.store(true, Ordering::Release);
        info!("Pipeline armed for {:?}", mode);
        Ok(())
    }

    /// Disarm, then take the sink out of the slot.
    pub fn deregister(&self) -> Option<Sink<'a, M, S>> {
        self.armed.store(false, Ordering::Release);
        self.slot.lock(|slot| slot.borrow_mut().take())
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> Option<PipelineMode> {
        self.slot
            .lock(|slot| slot.borrow().as_ref().map(Sink::mode))
    }

    /// Producer callback. Safe to call at any time: without an armed sink it
    /// does nothing and returns `false`.
    pub fn deliver(&self, samples: &[Sample]) -> bool {
        if !self.is_armed() {
            return false;
        }
        self.slot.lock(|slot| match slot.borrow_mut().as_mut() {
            Some(Sink::Logging(sink)) => {
                sink.accept(samples);
                true
            }
            Some(Sink::Inference(sink)) => {
                sink.buffer.push(samples);
                true
            }
            None => false,
        })
    }

    /// Move one pending batch from `producer` into the sink.
    ///
    /// Returns the number of samples moved.
    pub fn pump<P: SampleProducer>(&self, producer: &mut P, dma: &mut [Sample]) -> usize {
        let n = producer.read_batch(dma);
        if n > 0 {
            self.deliver(&dma[..n]);
        }
        n
    }

    /// Whether the logging target was reached. Surfaces a latched storage
    /// fault as an error.
    pub fn logging_complete(&self) -> Result<bool> {
        self.slot.lock(|slot| match slot.borrow().as_ref() {
            Some(Sink::Logging(sink)) => match sink.fault() {
                Some(fault) => Err(fault.clone()),
                None => Ok(sink.is_complete()),
            },
            _ => Err(CaptureError::InvalidState),
        })
    }

    pub fn bytes_written(&self) -> Option<u32> {
        self.slot.lock(|slot| match slot.borrow().as_ref() {
            Some(Sink::Logging(sink)) => Some(sink.bytes_written()),
            _ => None,
        })
    }

    /// Consumer side of inference mode, see [`DoubleBuffer::poll_ready`].
    pub fn poll_window(&self) -> Result<bool> {
        self.slot.lock(|slot| match slot.borrow_mut().as_mut() {
            Some(Sink::Inference(sink)) => sink.buffer.poll_ready(),
            _ => Err(CaptureError::InvalidState),
        })
    }

    /// Convert part of the ready window to `f32`. Returns samples written.
    pub fn read_window(&self, offset: usize, out: &mut [f32]) -> usize {
        self.slot.lock(|slot| match slot.borrow().as_ref() {
            Some(Sink::Inference(sink)) => sink.buffer.read_window(offset, out),
            _ => 0,
        })
    }

    /// Run `f` over the ready window while the producer is held off.
    pub fn with_window<R>(&self, f: impl FnOnce(&[Sample]) -> R) -> Option<R> {
        self.slot.lock(|slot| match slot.borrow().as_ref() {
            Some(Sink::Inference(sink)) => Some(f(sink.buffer.ready_window())),
            _ => None,
        })
    }

    pub fn reset_window(&self) {
        self.slot.lock(|slot| {
            if let Some(Sink::Inference(sink)) = slot.borrow_mut().as_mut() {
                sink.buffer.reset();
            }
        });
    }
}
