//! Self-describing CBOR header written ahead of the raw sample payload.
//!
//! Layout of the persisted header:
//!
//! ```text
//! {                                   ; definite map(3)
//!   "protected": { "ver": "v1", "alg": "HS256" },
//!   "signature": "000…000",           ; 64 chars, patched with the hex digest
//!   "payload": {
//!     "device_name": <id>,
//!     "device_type": <type>,
//!     "interval_ms": <f32>,
//!     "sensors": [ { "name": .., "units": .. }, .. ],
//!     "values": [_                    ; indefinite array, left open
//! ```
//!
//! followed by the reference tag `0x60+N "Ref-BINARY-i16" <spaces> 0xFF`,
//! whose padding brings the whole header to a multiple of 4 bytes. Raw
//! little-endian samples start right after the tag.

use minicbor::Encoder;
use minicbor::encode::{self, Write};

use crate::error::{CaptureError, Result};

/// Capacity of the buffer the header is assembled in
pub const HEADER_BUFFER_SIZE: usize = 1024;

/// Length of the hex-encoded digest reserved in the header
pub const SIGNATURE_HEX_LEN: usize = 64;

const SIGNATURE_PLACEHOLDER: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Placeholder character filling the signature slot before patching
pub const SIGNATURE_PLACEHOLDER_CHAR: u8 = b'0';

/// CBOR major type 3 (text string) with the length in the low bits
const TEXT_STRING_BASE: u8 = 0x60;

/// CBOR "break" closing the indefinite `values` array
const BREAK: u8 = 0xFF;

const HEX_TABLE: [u8; 16] = *b"0123456789abcdef";

/// Encoding of the raw samples following the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    I16,
    I32,
    F32,
}

impl PayloadKind {
    /// Name carried by the reference tag
    pub const fn reference_name(self) -> &'static str {
        match self {
            Self::I16 => "Ref-BINARY-i16",
            Self::I32 => "Ref-BINARY-i32",
            Self::F32 => "Ref-BINARY-float32",
        }
    }

    /// Bytes per persisted value
    pub const fn width(self) -> u32 {
        match self {
            Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
        }
    }
}

/// One named sensor axis listed in the header
#[derive(Debug, Clone, Copy)]
pub struct SensorAxis<'a> {
    pub name: &'a str,
    pub units: &'a str,
}

/// Metadata encoded into the header preamble
#[derive(Debug, Clone, Copy)]
pub struct PayloadInfo<'a> {
    pub device_id: &'a str,
    pub device_type: &'a str,
    pub interval_ms: f32,
    pub sensors: &'a [SensorAxis<'a>],
    pub kind: PayloadKind,
}

/// Result of encoding the preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// Bytes of preamble content at the start of the buffer
    pub len: usize,
    /// Offset of the first signature placeholder character
    pub signature_index: usize,
}

#[derive(Debug)]
struct Overflow;

/// Writer over an optional output slice. With no slice it only counts,
/// which sizes the preamble before anything is written.
struct FrameWriter<'a> {
    out: Option<&'a mut [u8]>,
    pos: usize,
}

impl Write for FrameWriter<'_> {
    type Error = Overflow;

    fn write_all(&mut self, bytes: &[u8]) -> core::result::Result<(), Self::Error> {
        let end = self.pos + bytes.len();
        if let Some(out) = self.out.as_deref_mut() {
            out.get_mut(self.pos..end)
                .ok_or(Overflow)?
                .copy_from_slice(bytes);
        }
        self.pos = end;
        Ok(())
    }
}

fn encode_into(
    e: &mut Encoder<FrameWriter<'_>>,
    info: &PayloadInfo<'_>,
) -> core::result::Result<usize, encode::Error<Overflow>> {
    e.map(3)?;
    e.str("protected")?.map(2)?;
    e.str("ver")?.str("v1")?;
    e.str("alg")?.str("HS256")?;

    e.str("signature")?.str(SIGNATURE_PLACEHOLDER)?;
    let signature_index = e.writer().pos - SIGNATURE_HEX_LEN;

    e.str("payload")?.map(5)?;
    e.str("device_name")?.str(info.device_id)?;
    e.str("device_type")?.str(info.device_type)?;
    e.str("interval_ms")?.f32(info.interval_ms)?;
    e.str("sensors")?.array(info.sensors.len() as u64)?;
    for axis in info.sensors {
        e.map(2)?;
        e.str("name")?.str(axis.name)?;
        e.str("units")?.str(axis.units)?;
    }
    e.str("values")?.begin_array()?;

    Ok(signature_index)
}

/// Encode the preamble for `info` at the start of `buf`.
///
/// The content length is returned explicitly, so nothing relies on the
/// unused tail of `buf` being zero.
pub fn encode_preamble(info: &PayloadInfo<'_>, buf: &mut [u8]) -> Result<Preamble> {
    let mut counter = Encoder::new(FrameWriter { out: None, pos: 0 });
    let needed = encode_into(&mut counter, info)
        .map(|_| counter.writer().pos)
        .map_err(|_| CaptureError::HeaderOverflow {
            needed: usize::MAX,
            capacity: buf.len(),
        })?;
    let capacity = buf.len();
    if needed > capacity {
        return Err(CaptureError::HeaderOverflow { needed, capacity });
    }

    let mut encoder = Encoder::new(FrameWriter {
        out: Some(buf),
        pos: 0,
    });
    let signature_index = encode_into(&mut encoder, info)
        .map_err(|_| CaptureError::HeaderOverflow { needed, capacity })?;

    Ok(Preamble {
        len: encoder.writer().pos,
        signature_index,
    })
}

/// Bytes needed to bring `len` up to a multiple of 4.
pub const fn reference_padding(len: usize) -> usize {
    (4 - (len & 0x3)) & 0x3
}

/// Total reference tag length for `kind` after a preamble of `preamble_len`.
///
/// The padding is chosen so that preamble plus tag is a multiple of 4.
pub const fn reference_tag_len(kind: PayloadKind, preamble_len: usize) -> usize {
    let unpadded = 1 + kind.reference_name().len() + 1;
    unpadded + reference_padding(preamble_len + unpadded)
}

/// Write the reference tag for `kind` into `out`. Returns the tag length.
pub fn write_reference_tag(kind: PayloadKind, preamble_len: usize, out: &mut [u8]) -> Result<usize> {
    let name = kind.reference_name().as_bytes();
    let len = reference_tag_len(kind, preamble_len);
    if len > out.len() {
        return Err(CaptureError::HeaderOverflow {
            needed: len,
            capacity: out.len(),
        });
    }
    let padding = len - name.len() - 2;

    out[0] = TEXT_STRING_BASE + (name.len() + padding) as u8;
    out[1..1 + name.len()].copy_from_slice(name);
    out[1 + name.len()..1 + name.len() + padding].fill(b' ');
    out[len - 1] = BREAK;

    Ok(len)
}

/// Hex-encode `bytes` into `out` as lowercase ASCII, high nibble first.
///
/// Table-driven, never goes through `core::fmt`. Returns the number of
/// characters written.
pub fn hex_encode(bytes: &[u8], out: &mut [u8]) -> usize {
    let mut written = 0;
    for (&byte, pair) in bytes.iter().zip(out.chunks_exact_mut(2)) {
        pair[0] = HEX_TABLE[(byte >> 4) as usize];
        pair[1] = HEX_TABLE[(byte & 0x0f) as usize];
        written += 2;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUDIO: [SensorAxis<'static>; 1] = [SensorAxis {
        name: "audio",
        units: "wav",
    }];

    fn info() -> PayloadInfo<'static> {
        PayloadInfo {
            device_id: "aa:bb:cc:dd:ee:ff",
            device_type: "PARTICLE_P2",
            interval_ms: 0.0625,
            sensors: &AUDIO,
            kind: PayloadKind::I16,
        }
    }

    #[test]
    fn test_preamble_structure() {
        let mut buf = [0u8; HEADER_BUFFER_SIZE];
        let preamble = encode_preamble(&info(), &mut buf).unwrap();

        // map(3) up front, open indefinite array at the end
        assert_eq!(buf[0], 0xA3);
        assert_eq!(buf[preamble.len - 1], 0x9F);
        assert!(buf[preamble.len..].iter().all(|&b| b == 0));

        let slot = &buf[preamble.signature_index..preamble.signature_index + SIGNATURE_HEX_LEN];
        assert!(slot.iter().all(|&b| b == SIGNATURE_PLACEHOLDER_CHAR));
        // text(64) header precedes the placeholder
        assert_eq!(
            &buf[preamble.signature_index - 2..preamble.signature_index],
            &[0x78, 0x40]
        );
    }

    #[test]
    fn test_preamble_with_zero_bytes_in_content() {
        // An interval of 0.0 encodes as fa 00 00 00 00; the explicit length
        // still covers everything up to the open array.
        let mut with_zeros = info();
        with_zeros.interval_ms = 0.0;
        let mut buf = [0u8; HEADER_BUFFER_SIZE];
        let preamble = encode_preamble(&with_zeros, &mut buf).unwrap();
        assert_eq!(buf[preamble.len - 1], 0x9F);
        assert!(buf[..preamble.len].windows(4).any(|w| w == [0, 0, 0, 0]));
    }

    #[test]
    fn test_preamble_overflow() {
        let mut buf = [0u8; 32];
        match encode_preamble(&info(), &mut buf) {
            Err(CaptureError::HeaderOverflow { needed, capacity }) => {
                assert_eq!(capacity, 32);
                assert!(needed > 32);
            }
            other => panic!("expected overflow, got {:?}", other),
        }
        // Nothing was written on failure
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_reference_tag_layout() {
        let mut out = [0u8; 32];
        let len = write_reference_tag(PayloadKind::I16, 5, &mut out).unwrap();
        assert_eq!(len, 19);
        assert_eq!(out[0], 0x60 + 14 + 3);
        assert_eq!(&out[1..15], b"Ref-BINARY-i16");
        assert_eq!(&out[15..18], b"   ");
        assert_eq!(out[18], 0xFF);
    }

    #[test]
    fn test_reference_tag_aligns_any_preamble() {
        for kind in [PayloadKind::I16, PayloadKind::I32, PayloadKind::F32] {
            for preamble_len in 0..256 {
                let tag = reference_tag_len(kind, preamble_len);
                assert_eq!((preamble_len + tag) % 4, 0, "{:?} at {}", kind, preamble_len);
                let padding = tag - kind.reference_name().len() - 2;
                assert!(padding <= 3);
            }
        }
    }

    #[test]
    fn test_reference_tag_is_valid_text_header() {
        let mut out = [0u8; 32];
        for preamble_len in 0..4 {
            let len = write_reference_tag(PayloadKind::F32, preamble_len, &mut out).unwrap();
            let text_len = (out[0] - 0x60) as usize;
            assert!(text_len < 24);
            assert_eq!(text_len, len - 2);
        }
    }

    #[test]
    fn test_reference_tag_overflow() {
        let mut out = [0u8; 8];
        assert!(matches!(
            write_reference_tag(PayloadKind::I16, 0, &mut out),
            Err(CaptureError::HeaderOverflow { .. })
        ));
    }

    #[test]
    fn test_hex_encode() {
        let mut out = [0u8; 8];
        assert_eq!(hex_encode(&[0x00, 0x9a, 0xf0, 0x5e], &mut out), 8);
        assert_eq!(&out, b"009af05e");

        let mut short = [0u8; 3];
        assert_eq!(hex_encode(&[0xab, 0xcd], &mut short), 2);
        assert_eq!(&short[..2], b"ab");
    }
}
