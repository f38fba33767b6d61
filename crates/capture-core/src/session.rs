//! One signed logging capture, from bulk erase to patched signature.
//!
//! ```text
//! Idle -> Armed -> Sampling -> Finalizing -> Done
//!   \________\________\___________\-------> Aborted
//! ```
//!
//! The session pre-clears the log, writes the header, registers a
//! [`LoggingSink`] on the pipeline and pumps the producer until the target
//! byte count is reached. It then tears the pipeline down, finishes the
//! digest and patches it into block 0 of the log.

use alloc::vec::Vec;

use log::{debug, error, info, warn};

use crate::config::DeviceIdentity;
use crate::error::{CaptureError, Result};
use crate::header::{PayloadInfo, PayloadKind, SIGNATURE_HEX_LEN, SensorAxis};
use crate::pipeline::{AcquisitionPipeline, LoggingSink, Sink};
use crate::producer::SampleProducer;
use crate::signature::{HmacSha256Signer, SignatureContext, Signer, digest_hex};
use crate::storage::{BlockStore, FlashMedium, SharedBlockStore};
use crate::{DMA_BATCH_SAMPLES, SAMPLE_WIDTH, Sample};

/// Extra bytes erased beyond the payload, covering the header
pub const ERASE_MARGIN_BYTES: u32 = 4096;

/// Shortest start delay reported to the operator
pub const MIN_START_DELAY_MS: u32 = 2000;

/// Rates the microphone is advertised at
pub const MICROPHONE_FREQUENCIES_HZ: [f32; 3] = [16000.0, 8000.0, 4000.0];

const MICROPHONE_RATE_HZ: u32 = 16_000;

const AUDIO_AXES: [SensorAxis<'static>; 1] = [SensorAxis {
    name: "audio",
    units: "wav",
}];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Armed,
    Sampling,
    Finalizing,
    Done,
    Aborted,
}

/// What the operator asked for
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingRequest {
    pub length_ms: u32,
    pub interval_ms: f32,
}

impl SamplingRequest {
    pub fn frequency_hz(&self) -> u32 {
        (1000.0 / self.interval_ms) as u32
    }

    /// Sample count for the requested length, rounded up to even.
    ///
    /// Saturates at the largest even `u32` for degenerate intervals.
    pub fn samples_required(&self) -> u32 {
        let n = (self.length_ms as f32 / self.interval_ms) as u32;
        if n & 1 == 0 {
            n
        } else {
            n.checked_add(1).unwrap_or(n - 1)
        }
    }
}

/// Summary of a finished capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub samples: u32,
    pub payload_bytes: u32,
    pub header_len: u32,
    /// Meaningful bytes in the log: header plus payload
    pub total_bytes: u32,
    pub signature_index: usize,
    pub digest_hex: [u8; SIGNATURE_HEX_LEN],
    /// Estimated time the bulk erase takes, never below [`MIN_START_DELAY_MS`]
    pub start_delay_ms: u32,
    pub capture_ms: u32,
}

impl SessionReport {
    pub fn digest_str(&self) -> &str {
        core::str::from_utf8(&self.digest_hex).unwrap_or_default()
    }
}

/// Sensor entry advertised to the ingestion side
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDescriptor {
    pub name: &'static str,
    pub max_sample_length_s: u32,
    pub frequencies: &'static [f32],
}

impl SensorDescriptor {
    /// The microphone, limited by how much audio the log can hold.
    pub fn microphone<M: FlashMedium>(store: &BlockStore<M>) -> Self {
        let blocks = store.available_sample_blocks().saturating_sub(1);
        Self {
            name: "Microphone",
            max_sample_length_s: blocks * store.block_size() / (MICROPHONE_RATE_HZ * SAMPLE_WIDTH),
            frequencies: &MICROPHONE_FREQUENCIES_HZ,
        }
    }
}

/// Estimated erase time for `bytes` of log, in milliseconds.
pub fn erase_time_ms<M: FlashMedium>(store: &BlockStore<M>, bytes: u32) -> u32 {
    let region = store.region();
    if region.block_size == 0 {
        return 0;
    }
    (bytes / region.block_size) * region.erase_time_ms
}

pub struct SampleSession<'s, 'p, M: FlashMedium, S: Signer = HmacSha256Signer> {
    store: &'p SharedBlockStore<M>,
    pipeline: &'s AcquisitionPipeline<'p, M, S>,
    state: SessionState,
    samples_required: u32,
    bytes_written: u32,
    header_len: u32,
    signature_index: usize,
    sampling_frequency: u32,
    dma: Vec<Sample>,
    /// The logging sink on the pipeline is ours
    registered: bool,
}

impl<'s, 'p, M: FlashMedium, S: Signer> SampleSession<'s, 'p, M, S> {
    pub fn new(store: &'p SharedBlockStore<M>, pipeline: &'s AcquisitionPipeline<'p, M, S>) -> Self {
        Self {
            store,
            pipeline,
            state: SessionState::Idle,
            samples_required: 0,
            bytes_written: 0,
            header_len: 0,
            signature_index: 0,
            sampling_frequency: 0,
            dma: Vec::new(),
            registered: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn samples_required(&self) -> u32 {
        self.samples_required
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    pub fn header_len(&self) -> u32 {
        self.header_len
    }

    pub fn signature_index(&self) -> usize {
        self.signature_index
    }

    /// Run a whole capture: start, pump to completion, finalize.
    pub fn record<P, I>(
        &mut self,
        identity: &I,
        request: &SamplingRequest,
        producer: &mut P,
    ) -> Result<SessionReport>
    where
        P: SampleProducer,
        I: DeviceIdentity,
    {
        self.start(identity, request, producer)?;
        self.run(producer)?;
        self.finalize(producer)
    }

    /// Prepare the log and arm the pipeline. On success the producer is
    /// running and the session is `Sampling`.
    pub fn start<P, I>(&mut self, identity: &I, request: &SamplingRequest, producer: &mut P) -> Result<()>
    where
        P: SampleProducer,
        I: DeviceIdentity,
    {
        if matches!(
            self.state,
            SessionState::Armed | SessionState::Sampling | SessionState::Finalizing
        ) {
            return Err(CaptureError::InvalidState);
        }
        self.state = SessionState::Idle;
        self.bytes_written = 0;

        self.try_start(identity, request, producer)
            .inspect_err(|e| self.fail(producer, e))
    }

    fn try_start<P, I>(&mut self, identity: &I, request: &SamplingRequest, producer: &mut P) -> Result<()>
    where
        P: SampleProducer,
        I: DeviceIdentity,
    {
        let supported_hz = producer.sample_rate_hz();
        let requested_hz = request.frequency_hz();
        if requested_hz != supported_hz {
            return Err(CaptureError::UnsupportedRate {
                requested_hz,
                supported_hz,
            });
        }
        // Refuse before touching the log if another sink owns the pipeline
        if self.pipeline.mode().is_some() {
            return Err(CaptureError::SinkBusy);
        }
        self.sampling_frequency = requested_hz;
        self.samples_required = request.samples_required();
        let payload_bytes = self.samples_required.saturating_mul(SAMPLE_WIDTH);

        info!("Sampling settings:");
        info!("\tInterval: {} ms", request.interval_ms);
        info!("\tLength: {} ms", request.length_ms);
        info!("\tSamples: {}", self.samples_required);

        self.dma.clear();
        self.dma
            .try_reserve_exact(DMA_BATCH_SAMPLES)
            .map_err(|_| CaptureError::AllocationFailed {
                bytes: DMA_BATCH_SAMPLES * SAMPLE_WIDTH as usize,
            })?;
        self.dma.resize(DMA_BATCH_SAMPLES, 0);

        let erase_len = payload_bytes.saturating_add(ERASE_MARGIN_BYTES);
        let delay = self
            .store
            .with(|store| erase_time_ms(store, payload_bytes))
            .max(MIN_START_DELAY_MS);
        info!("Starting in {} ms... (or until all flash was erased)", delay);
        self.store
            .with(|store| store.erase_sample_exact(0, erase_len))?;
        debug!("Erased {} bytes", erase_len);

        let info = PayloadInfo {
            device_id: identity.device_id(),
            device_type: identity.device_type(),
            interval_ms: request.interval_ms,
            sensors: &AUDIO_AXES,
            kind: PayloadKind::I16,
        };
        let mut signature = SignatureContext::<S>::init(identity.hmac_key().as_bytes(), &info)?;
        let header = signature.seal_header()?;
        self.store
            .with(|store| store.write_sample_exact(0, header))?;
        self.header_len = signature.header_len() as u32;
        self.signature_index = signature.signature_index();
        info!(
            "Header written: {} bytes, signature at {}",
            self.header_len, self.signature_index
        );

        self.pipeline.register(Sink::Logging(LoggingSink::new(
            self.store,
            signature,
            payload_bytes,
        )))?;
        self.registered = true;
        self.state = SessionState::Armed;

        producer.start()?;
        producer.drain();
        self.state = SessionState::Sampling;
        info!("Sampling...");
        Ok(())
    }

    /// One non-blocking step: move at most one pending batch and report
    /// whether the payload target is met.
    ///
    /// Returns `Ok(true)` once the session is ready for [`Self::finalize`].
    /// A latched storage fault aborts the session.
    pub fn poll<P: SampleProducer>(&mut self, producer: &mut P) -> Result<bool> {
        if self.state != SessionState::Sampling {
            return Err(CaptureError::InvalidState);
        }
        match self.pipeline.logging_complete() {
            Ok(true) => {
                self.state = SessionState::Finalizing;
                Ok(true)
            }
            Ok(false) => {
                self.pipeline.pump(producer, &mut self.dma);
                Ok(false)
            }
            Err(e) => {
                self.fail(producer, &e);
                Err(e)
            }
        }
    }

    /// Poll until the payload target is met. Never times out; callers that
    /// need a way out drive [`Self::poll`] themselves and call
    /// [`Self::abort`].
    pub fn run<P: SampleProducer>(&mut self, producer: &mut P) -> Result<()> {
        while !self.poll(producer)? {}
        Ok(())
    }

    /// Tear the pipeline down, finish the digest and patch it into the log.
    pub fn finalize<P: SampleProducer>(&mut self, producer: &mut P) -> Result<SessionReport> {
        if self.state != SessionState::Finalizing {
            return Err(CaptureError::InvalidState);
        }
        let sink = self.pipeline.deregister();
        self.registered = false;
        producer.stop();
        self.dma = Vec::new();

        let Some(Sink::Logging(sink)) = sink else {
            let e = CaptureError::InvalidState;
            self.fail(producer, &e);
            return Err(e);
        };
        self.bytes_written = sink.bytes_written();

        let report = sink
            .into_signature()
            .finish()
            .and_then(|digest| {
                let hex = digest_hex(&digest);
                self.patch_signature(&hex)?;
                Ok(hex)
            })
            .map(|hex| self.report(hex));

        match report {
            Ok(report) => {
                self.state = SessionState::Done;
                info!("Done sampling, total bytes collected: {}", self.bytes_written);
                info!("Signature: {}", report.digest_str());
                Ok(report)
            }
            Err(e) => {
                self.fail(producer, &e);
                Err(e)
            }
        }
    }

    /// Read block 0, overwrite the placeholder with `hex`, erase and rewrite it.
    fn patch_signature(&self, hex: &[u8; SIGNATURE_HEX_LEN]) -> Result<()> {
        let block_size = self.store.with(|store| store.block_size()) as usize;
        let end = self.signature_index + SIGNATURE_HEX_LEN;
        if end > block_size {
            return Err(CaptureError::HeaderOverflow {
                needed: end,
                capacity: block_size,
            });
        }

        let mut page = Vec::new();
        page.try_reserve_exact(block_size)
            .map_err(|_| CaptureError::AllocationFailed { bytes: block_size })?;
        page.resize(block_size, 0u8);

        self.store.with(|store| {
            store.read_sample_exact(0, &mut page)?;
            page[self.signature_index..end].copy_from_slice(hex);
            store.erase_sample_exact(0, block_size as u32)?;
            store.write_sample_exact(0, &page)
        })?;
        debug!("Signature patched into block 0");
        Ok(())
    }

    fn report(&self, digest_hex: [u8; SIGNATURE_HEX_LEN]) -> SessionReport {
        let payload_bytes = self.samples_required.saturating_mul(SAMPLE_WIDTH);
        let start_delay_ms = self
            .store
            .with(|store| erase_time_ms(store, payload_bytes))
            .max(MIN_START_DELAY_MS);
        let capture_ms = if self.sampling_frequency == 0 {
            0
        } else {
            ((self.samples_required as u64 * 1000) / self.sampling_frequency as u64) as u32
        };
        SessionReport {
            samples: self.samples_required,
            payload_bytes: self.bytes_written,
            header_len: self.header_len,
            total_bytes: self.header_len + self.bytes_written,
            signature_index: self.signature_index,
            digest_hex,
            start_delay_ms,
            capture_ms,
        }
    }

    /// Stop a running capture from the foreground.
    ///
    /// The callback is deregistered before the producer is stopped and the
    /// DMA buffer released. Nothing is signed; a session that is not running
    /// is left as it is.
    pub fn abort<P: SampleProducer>(&mut self, producer: &mut P) {
        if !matches!(
            self.state,
            SessionState::Armed | SessionState::Sampling | SessionState::Finalizing
        ) {
            return;
        }
        info!("Sampling aborted by caller");
        self.teardown(producer);
    }

    fn fail<P: SampleProducer>(&mut self, producer: &mut P, cause: &CaptureError) {
        error!("Sampling aborted: {}", cause);
        self.teardown(producer);
    }

    fn teardown<P: SampleProducer>(&mut self, producer: &mut P) {
        // Only tear down what this session registered
        if self.registered {
            if let Some(Sink::Logging(sink)) = self.pipeline.deregister() {
                self.bytes_written = sink.bytes_written();
            }
            self.registered = false;
            producer.stop();
        }
        if self.bytes_written > 0 {
            warn!("{} payload bytes left in the log unsigned", self.bytes_written);
        }
        self.dma = Vec::new();
        self.state = SessionState::Aborted;
    }
}
