//! Pluggable payload compression (spec.md §4.1 compress/decompress,
//! explicitly an external collaborator per §1 Non-goals: this crate ships a
//! default LZ4 implementation but never hard-codes calls to it outside of
//! this module).

use std::fmt;

/// A compression codec pluggable into `ProtocolPacket::compress`/`decompress`.
/// Grounded in the original source's `C_compressor.hpp` abstract interface,
/// which the engine calls through a pointer rather than a concrete type.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressorError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressorError>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CompressorError;

impl fmt::Display for CompressorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compressor failed to process the payload")
    }
}

impl std::error::Error for CompressorError {}

/// The default collaborator (spec.md §9.6), grounded in the original
/// source's `C_compressorLZ4.cpp`/`C_packetLZ4.cpp`, which prefix the
/// compressed block with the uncompressed length so the decompressor can
/// size its output buffer up front.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressorError> {
        let mut out = Vec::with_capacity(4 + data.len());
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(&lz4_flex::compress(data));
        Ok(out)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressorError> {
        if data.len() < 4 {
            return Err(CompressorError);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[..4]);
        let original_len = u32::from_be_bytes(len_bytes) as usize;
        lz4_flex::decompress(&data[4..], original_len).map_err(|_| CompressorError)
    }
}

/// A no-op codec used in tests and wherever compression is disabled by
/// configuration; keeps `compress`/`decompress` exercised without pulling
/// in the real LZ4 path.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressorError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressorError> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_round_trips_arbitrary_payload() {
        let codec = Lz4Compressor;
        let data = b"the quick brown fox jumps over the lazy dog, repeatedly, for compressibility";
        let compressed = codec.compress(data).unwrap();
        let restored = codec.decompress(&compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn decompress_rejects_truncated_header() {
        let codec = Lz4Compressor;
        assert!(codec.decompress(&[0, 1]).is_err());
    }

    #[test]
    fn identity_codec_is_a_no_op() {
        let codec = IdentityCompressor;
        let data = b"unchanged";
        assert_eq!(codec.compress(data).unwrap(), data);
        assert_eq!(codec.decompress(data).unwrap(), data);
    }
}
