//! Streaming signature over the persisted capture.
//!
//! The signer sees every byte that lands in the log, in write order: the
//! preamble (with the signature slot still holding placeholder characters),
//! the reference tag, then each payload chunk. It has no random access, so the
//! digest is only valid if nothing is skipped or repeated.

use hmac::{Hmac, Mac};
use log::debug;
use sha2::Sha256;

use crate::error::{CaptureError, Result};
use crate::header::{
    self, HEADER_BUFFER_SIZE, PayloadInfo, PayloadKind, SIGNATURE_HEX_LEN,
    SIGNATURE_PLACEHOLDER_CHAR,
};
use crate::storage::{BlockStore, FlashMedium};

/// Size of a finished digest
pub const DIGEST_LEN: usize = 32;

pub type Digest = [u8; DIGEST_LEN];

/// Failure reported by a hash engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignerError;

/// A keyed streaming hash engine
pub trait Signer: Sized {
    fn with_key(key: &[u8]) -> core::result::Result<Self, SignerError>;

    fn update(&mut self, data: &[u8]);

    /// Consume the engine and produce the digest.
    fn finish(self) -> core::result::Result<Digest, SignerError>;
}

/// HMAC-SHA256 ("HS256") signer
pub struct HmacSha256Signer {
    mac: Hmac<Sha256>,
}

impl Signer for HmacSha256Signer {
    fn with_key(key: &[u8]) -> core::result::Result<Self, SignerError> {
        let mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| SignerError)?;
        Ok(Self { mac })
    }

    fn update(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    fn finish(self) -> core::result::Result<Digest, SignerError> {
        let bytes = self.mac.finalize().into_bytes();
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes);
        Ok(digest)
    }
}

/// Header buffer plus the signer accumulating over everything persisted.
pub struct SignatureContext<S: Signer = HmacSha256Signer> {
    signer: S,
    header: [u8; HEADER_BUFFER_SIZE],
    cursor: usize,
    signature_index: usize,
    kind: PayloadKind,
    sealed: bool,
}

impl<S: Signer> SignatureContext<S> {
    /// Encode the preamble for `info` and arm the signer with `key`.
    pub fn init(key: &[u8], info: &PayloadInfo<'_>) -> Result<Self> {
        let mut header = [0u8; HEADER_BUFFER_SIZE];
        let preamble = header::encode_preamble(info, &mut header)?;

        let mut signer = S::with_key(key).map_err(|_| CaptureError::SignatureFinalizeFailed)?;
        signer.update(&header[..preamble.len]);

        debug!(
            "Header preamble {} bytes, signature slot at {}",
            preamble.len, preamble.signature_index
        );

        Ok(Self {
            signer,
            header,
            cursor: preamble.len,
            signature_index: preamble.signature_index,
            kind: info.kind,
            sealed: false,
        })
    }

    /// Append the reference tag, feed it to the signer and return the full
    /// header. Idempotent once sealed.
    pub fn seal_header(&mut self) -> Result<&[u8]> {
        if !self.sealed {
            let tag_len =
                header::write_reference_tag(self.kind, self.cursor, &mut self.header[self.cursor..])
                    .map_err(|_| CaptureError::HeaderOverflow {
                        needed: self.cursor + header::reference_tag_len(self.kind, self.cursor),
                        capacity: HEADER_BUFFER_SIZE,
                    })?;
            self.signer
                .update(&self.header[self.cursor..self.cursor + tag_len]);
            self.cursor += tag_len;
            self.sealed = true;
        }
        Ok(self.header())
    }

    /// Header bytes produced so far
    pub fn header(&self) -> &[u8] {
        &self.header[..self.cursor]
    }

    pub fn header_len(&self) -> usize {
        self.cursor
    }

    pub fn signature_index(&self) -> usize {
        self.signature_index
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Feed the next persisted chunk, in write order.
    pub fn update(&mut self, data: &[u8]) {
        self.signer.update(data);
    }

    /// Finish the digest. Terminal: the context is consumed.
    pub fn finish(self) -> Result<Digest> {
        self.signer
            .finish()
            .map_err(|_| CaptureError::SignatureFinalizeFailed)
    }
}

/// Hex form of a digest as stored in the header
pub fn digest_hex(digest: &Digest) -> [u8; SIGNATURE_HEX_LEN] {
    let mut hex = [0u8; SIGNATURE_HEX_LEN];
    header::hex_encode(digest, &mut hex);
    hex
}

/// Recompute the signature of a persisted log and compare it with the one
/// patched into its header.
///
/// `total_len` covers header plus payload, starting at sample offset 0.
pub fn verify_log<M: FlashMedium, S: Signer>(
    store: &mut BlockStore<M>,
    key: &[u8],
    signature_index: usize,
    total_len: u32,
) -> Result<bool> {
    let mut signer = S::with_key(key).map_err(|_| CaptureError::SignatureFinalizeFailed)?;
    let mut stored = [0u8; SIGNATURE_HEX_LEN];
    let slot = signature_index..signature_index + SIGNATURE_HEX_LEN;

    let mut chunk = [0u8; 256];
    let mut address = 0u32;
    while address < total_len {
        let len = chunk.len().min((total_len - address) as usize);
        let buf = &mut chunk[..len];
        store.read_sample_exact(address, buf)?;

        for (i, byte) in buf.iter_mut().enumerate() {
            let pos = address as usize + i;
            if slot.contains(&pos) {
                stored[pos - signature_index] = *byte;
                *byte = SIGNATURE_PLACEHOLDER_CHAR;
            }
        }
        signer.update(buf);
        address += len as u32;
    }

    let digest = signer
        .finish()
        .map_err(|_| CaptureError::SignatureFinalizeFailed)?;
    Ok(digest_hex(&digest) == stored)
}
