//! Error types for the capture pipeline

use core::fmt;

use thiserror_no_std::Error;

/// Storage operation that produced a short transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Read,
    Write,
    Erase,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Erase => "erase",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("storage access at {address:#x} clamped from {requested} to {actual} bytes")]
    StorageBoundsClamped {
        address: u32,
        requested: u32,
        actual: u32,
    },
    #[error("storage {op} at {address:#x} transferred {actual} of {requested} bytes")]
    StorageOpFailed {
        op: StorageOp,
        address: u32,
        requested: u32,
        actual: u32,
    },
    #[error("header needs {needed} bytes but the buffer holds {capacity}")]
    HeaderOverflow { needed: usize, capacity: usize },
    #[error("failed to finish signature")]
    SignatureFinalizeFailed,
    #[error("sample buffer overrun, {missed} window(s) overwritten before consumption")]
    BufferOverrun { missed: u32 },
    #[error("sampling at {requested_hz} Hz is unsupported, producer runs at {supported_hz} Hz")]
    UnsupportedRate { requested_hz: u32, supported_hz: u32 },
    #[error("failed to allocate {bytes} bytes")]
    AllocationFailed { bytes: usize },
    #[error("sample producer error: {0}")]
    ProducerFailed(heapless::String<64>),
    #[error("a sink is already registered on the pipeline")]
    SinkBusy,
    #[error("operation not valid in the current session state")]
    InvalidState,
    #[error("config region error: {0}")]
    Config(heapless::String<64>),
}

impl CaptureError {
    /// Whether this error ends the session that raised it.
    ///
    /// Clamped accesses and buffer overruns are reported but the pipeline
    /// keeps running.
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::StorageBoundsClamped { .. } | Self::BufferOverrun { .. }
        )
    }

    /// Builds an error carrying a truncated copy of `msg`.
    pub(crate) fn message(msg: &str) -> heapless::String<64> {
        let mut s = heapless::String::new();
        for c in msg.chars() {
            if s.push(c).is_err() {
                break;
            }
        }
        s
    }
}

pub type Result<T> = core::result::Result<T, CaptureError>;

/// Maps a short transfer into [`CaptureError::StorageOpFailed`].
pub(crate) fn expect_transfer(op: StorageOp, address: u32, requested: u32, actual: u32) -> Result<()> {
    if actual == requested {
        Ok(())
    } else {
        Err(CaptureError::StorageOpFailed {
            op,
            address,
            requested,
            actual,
        })
    }
}
