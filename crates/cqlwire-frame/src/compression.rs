//! Frame body compression codecs
//!
//! The codec is negotiated in STARTUP and applied to every frame body after
//! the handshake. Compressed bodies must be complete before they can be
//! decompressed, so connections using a codec read with the buffered strategy.

use std::fmt::Debug;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::header::MAX_BODY_LEN;

/// Pluggable body codec
pub trait Compressor: Send + Sync + Debug {
    /// Name sent in the STARTUP `COMPRESSION` option
    fn name(&self) -> &'static str;

    fn compress(&self, input: &[u8]) -> Result<Bytes>;

    fn decompress(&self, input: &[u8]) -> Result<Bytes>;
}

/// LZ4 block codec
///
/// Bodies are a 4-byte big-endian uncompressed length followed by a raw
/// LZ4 block.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, input: &[u8]) -> Result<Bytes> {
        let length = u32::try_from(input.len()).map_err(|_| FrameError::BodyTooLarge {
            length: input.len() as u64,
            max: MAX_BODY_LEN,
        })?;
        let block = lz4_flex::block::compress(input);
        let mut out = BytesMut::with_capacity(4 + block.len());
        out.put_u32(length);
        out.put_slice(&block);
        Ok(out.freeze())
    }

    fn decompress(&self, input: &[u8]) -> Result<Bytes> {
        if input.len() < 4 {
            return Err(FrameError::Truncated {
                needed: 4,
                available: input.len(),
            });
        }
        let length = u32::from_be_bytes([input[0], input[1], input[2], input[3]]) as usize;
        if length > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLarge {
                length: length as u64,
                max: MAX_BODY_LEN,
            });
        }
        if length == 0 {
            return Ok(Bytes::new());
        }
        let raw = lz4_flex::block::decompress(&input[4..], length)
            .map_err(|e| FrameError::Compression(e.to_string()))?;
        Ok(Bytes::from(raw))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lz4_prefix_and_decompress() {
        let input = b"SELECT * FROM system.local WHERE key='local'".repeat(8);
        let codec = Lz4Compressor;
        let compressed = codec.compress(&input).unwrap();

        let prefix = u32::from_be_bytes([compressed[0], compressed[1], compressed[2], compressed[3]]);
        assert_eq!(prefix as usize, input.len());
        assert!(compressed.len() < input.len());

        let restored = codec.decompress(&compressed).unwrap();
        assert_eq!(&restored[..], &input[..]);
    }

    #[test]
    fn test_lz4_rejects_oversized_prefix() {
        let mut input = vec![0xFF, 0xFF, 0xFF, 0xFF];
        input.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            Lz4Compressor.decompress(&input),
            Err(FrameError::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn test_lz4_corrupt_block() {
        let input = [0x00, 0x00, 0x00, 0x40, 0xF0, 0x01];
        assert!(matches!(
            Lz4Compressor.decompress(&input),
            Err(FrameError::Compression(_))
        ));
    }
}
