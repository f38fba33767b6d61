//! Hardware-independent core of the signed sample-capture pipeline
//!
//! This crate contains all platform-agnostic logic for streaming sensor
//! samples from an interrupt/DMA driven source into one of two sinks:
//!
//! - a block-erase constrained log (flash, or RAM emulating flash) framed by a
//!   self-describing CBOR header and signed with HMAC-SHA256, or
//! - a double buffer feeding a low-latency inference consumer.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod config;
pub mod double_buffer;
pub mod error;
pub mod header;
pub mod inference;
pub mod pipeline;
pub mod producer;
pub mod session;
pub mod signature;
pub mod storage;

pub use config::{DeviceConfig, DeviceIdentity};
pub use double_buffer::DoubleBuffer;
pub use error::{CaptureError, Result};
pub use inference::InferenceSession;
pub use pipeline::{AcquisitionPipeline, PipelineMode};
pub use producer::SampleProducer;
pub use session::{SampleSession, SamplingRequest, SessionReport, SessionState};
pub use signature::{HmacSha256Signer, SignatureContext, Signer};
pub use storage::{BlockStore, FlashMedium, MemoryRegion, RamFlash, SharedBlockStore};

/// One raw sample as delivered by the PDM/ADC driver
pub type Sample = i16;

/// Width of one persisted sample in bytes
pub const SAMPLE_WIDTH: u32 = core::mem::size_of::<Sample>() as u32;

/// Largest batch the DMA engine hands over in one completion (256 samples)
pub const DMA_BATCH_SAMPLES: usize = 256;
