//! The self-describing container envelope.
//!
//! ```text
//! offset 0..4   signature, b"KSAV"
//! offset 4..8   u32 BE compressed length (0 = payload stored as-is)
//! offset 8..12  u32 BE uncompressed length
//! offset 12..   payload
//! ```
//!
//! Payloads are compressed with raw deflate (no zlib header). When deflate
//! does not make the data smaller the payload is stored verbatim and the
//! compressed length is written as 0.

use std::io::Read;

use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

use crate::{ArchiveError, ArchiveResult};

/// Magic bytes at the start of every container.
pub const CONTAINER_SIGNATURE: [u8; 4] = *b"KSAV";

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 12;

/// Decoded container header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Compressed payload length; 0 when the payload is stored.
    pub compressed_len: u32,
    /// Length of the payload once decompressed.
    pub uncompressed_len: u32,
}

impl ContainerHeader {
    /// Parse and validate the header at the start of `bytes`.
    ///
    /// The signature is checked first, so a foreign file is always reported
    /// as [`ArchiveError::BadSignature`] even if it is shorter than a header.
    pub fn parse(bytes: &[u8]) -> ArchiveResult<Self> {
        if bytes.len() >= CONTAINER_SIGNATURE.len() {
            let mut found = [0u8; 4];
            found.copy_from_slice(&bytes[..4]);
            if found != CONTAINER_SIGNATURE {
                return Err(ArchiveError::BadSignature {
                    expected: CONTAINER_SIGNATURE,
                    found,
                });
            }
        }
        if bytes.len() < HEADER_LEN {
            return Err(ArchiveError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        Ok(Self {
            compressed_len: be_u32(&bytes[4..8]),
            uncompressed_len: be_u32(&bytes[8..12]),
        })
    }

    /// Whether the payload is stored uncompressed.
    #[inline]
    pub fn is_stored(&self) -> bool {
        self.compressed_len == 0
    }

    /// Number of payload bytes following the header.
    #[inline]
    pub fn payload_len(&self) -> usize {
        if self.is_stored() {
            self.uncompressed_len as usize
        } else {
            self.compressed_len as usize
        }
    }

    /// Header bytes, signature included.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&CONTAINER_SIGNATURE);
        out[4..8].copy_from_slice(&self.compressed_len.to_be_bytes());
        out[8..12].copy_from_slice(&self.uncompressed_len.to_be_bytes());
        out
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

/// Wrap `data` in a container, compressing it when `compress` is set and
/// deflate actually saves space.
///
/// # Panics
///
/// Panics if `data` is longer than `u32::MAX` bytes.
pub fn implode(data: &[u8], compress: bool) -> Vec<u8> {
    let uncompressed_len = u32::try_from(data.len())
        .unwrap_or_else(|_| panic!("{} bytes do not fit in a container", data.len()));

    let compressed = if compress { deflate(data) } else { None };
    let (header, payload) = match compressed {
        Some(ref packed) => (
            ContainerHeader {
                compressed_len: packed.len() as u32,
                uncompressed_len,
            },
            packed.as_slice(),
        ),
        None => (
            ContainerHeader {
                compressed_len: 0,
                uncompressed_len,
            },
            data,
        ),
    };

    tracing::debug!(
        uncompressed = header.uncompressed_len,
        compressed = header.compressed_len,
        "imploded container"
    );

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validate a container and return its uncompressed payload.
///
/// Bytes after the declared payload are ignored.
pub fn explode(bytes: &[u8]) -> ArchiveResult<Vec<u8>> {
    let header = ContainerHeader::parse(bytes)?;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() < header.payload_len() {
        return Err(ArchiveError::Truncated {
            needed: HEADER_LEN + header.payload_len(),
            available: bytes.len(),
        });
    }
    let payload = &payload[..header.payload_len()];

    let data = if header.is_stored() {
        payload.to_vec()
    } else {
        inflate(payload, header.uncompressed_len as usize)?
    };

    tracing::debug!(
        uncompressed = header.uncompressed_len,
        compressed = header.compressed_len,
        "exploded container"
    );
    Ok(data)
}

/// Raw deflate. `None` when compression fails or does not shrink the data.
fn deflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(data, Compression::default());
    let mut compressed = Vec::with_capacity(data.len());
    if let Err(e) = encoder.read_to_end(&mut compressed) {
        tracing::debug!(error = %e, "deflate failed; storing payload");
        return None;
    }
    (compressed.len() < data.len()).then_some(compressed)
}

/// Upper bound on how far deflate can expand its input.
const MAX_DEFLATE_RATIO: usize = 1032;

/// Inflate exactly `expected` bytes; anything else is corruption.
fn inflate(payload: &[u8], expected: usize) -> ArchiveResult<Vec<u8>> {
    // One byte of slack makes an oversized stream visible without
    // decompressing all of it.
    let mut decoder = DeflateDecoder::new(payload).take(expected as u64 + 1);
    // The header is untrusted; never reserve more than the payload can yield.
    let mut data =
        Vec::with_capacity(expected.min(payload.len().saturating_mul(MAX_DEFLATE_RATIO)));
    decoder
        .read_to_end(&mut data)
        .map_err(|e| ArchiveError::Decompress {
            details: e.to_string(),
        })?;
    if data.len() != expected {
        return Err(ArchiveError::SizeMismatch {
            expected,
            actual: data.len(),
        });
    }
    Ok(data)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_data_is_deflated() {
        let data = vec![b'z'; 4096];
        let container = implode(&data, true);
        let header = ContainerHeader::parse(&container).unwrap();
        assert!(!header.is_stored());
        assert!((header.compressed_len as usize) < data.len());
        assert_eq!(header.uncompressed_len, 4096);
        assert_eq!(explode(&container).unwrap(), data);
    }

    #[test]
    fn compression_can_be_disabled() {
        let data = vec![b'z'; 64];
        let container = implode(&data, false);
        assert_eq!(&container[4..8], &[0, 0, 0, 0]);
        assert_eq!(&container[HEADER_LEN..], data.as_slice());
    }

    #[test]
    fn empty_payload_is_stored() {
        let container = implode(&[], true);
        assert_eq!(container.len(), HEADER_LEN);
        assert!(explode(&container).unwrap().is_empty());
    }

    #[test]
    fn header_layout_is_big_endian() {
        let header = ContainerHeader {
            compressed_len: 0x0102_0304,
            uncompressed_len: 5,
        };
        assert_eq!(
            header.to_bytes(),
            [b'K', b'S', b'A', b'V', 1, 2, 3, 4, 0, 0, 0, 5]
        );
    }

    #[test]
    fn short_foreign_data_reports_bad_signature() {
        let err = ContainerHeader::parse(b"PK\x03\x04").unwrap_err();
        assert!(matches!(err, ArchiveError::BadSignature { .. }));
    }

    #[test]
    fn short_header_is_truncated() {
        let err = ContainerHeader::parse(b"KSAV\0\0").unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Truncated {
                needed: 12,
                available: 6
            }
        ));
    }

    #[test]
    fn missing_payload_bytes_are_truncation() {
        let mut container = implode(&[1, 2, 3, 4], false);
        container.pop();
        assert!(matches!(
            explode(&container),
            Err(ArchiveError::Truncated { .. })
        ));
    }

    #[test]
    fn wrong_uncompressed_length_is_size_mismatch() {
        let mut container = implode(&vec![7u8; 1000], true);
        container[8..12].copy_from_slice(&999u32.to_be_bytes());
        assert!(matches!(
            explode(&container),
            Err(ArchiveError::SizeMismatch {
                expected: 999,
                actual: 1000
            })
        ));
    }

    #[test]
    fn garbage_payload_fails_to_decompress() {
        let mut container = ContainerHeader {
            compressed_len: 4,
            uncompressed_len: 100,
        }
        .to_bytes()
        .to_vec();
        container.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            explode(&container),
            Err(ArchiveError::Decompress { .. })
        ));
    }

    #[test]
    fn absurd_uncompressed_length_is_an_error() {
        // An empty final fixed-Huffman block, then padding.
        let mut container = ContainerHeader {
            compressed_len: 4,
            uncompressed_len: u32::MAX,
        }
        .to_bytes()
        .to_vec();
        container.extend_from_slice(&[0x03, 0x00, 0x00, 0x00]);
        assert!(matches!(
            explode(&container),
            Err(ArchiveError::SizeMismatch { actual: 0, .. })
        ));
    }
}
