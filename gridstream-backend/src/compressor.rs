//! Optional wire compression for marshalled blobs.
//!
//! Orthogonal to [`Marshaller`](crate::Marshaller): a [`Compressor`] only
//! ever sees opaque bytes, so it composes with any marshaller via
//! [`CompressingMarshaller`]. Disabled by default — entries and updater
//! blobs in this loader tend to be small and latency-sensitive, so
//! compression is opt-in per deployment rather than a fixed cost every
//! batch pays.

use bytes::Bytes;
use thiserror::Error;

/// Failure compressing or decompressing a blob.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// The underlying codec rejected the input.
    #[error("compression failed: {0}")]
    Codec(String),
}

/// Compresses and decompresses opaque byte blobs.
///
/// Implementations must round-trip: `decompress(compress(bytes)?)? ==
/// bytes` for any input.
pub trait Compressor: Send + Sync {
    /// Compresses `bytes`.
    fn compress(&self, bytes: &[u8]) -> Result<Bytes, CompressionError>;

    /// Decompresses `bytes` produced by [`compress`](Self::compress).
    fn decompress(&self, bytes: &[u8]) -> Result<Bytes, CompressionError>;
}

/// Applies no compression; used when no codec feature is enabled or
/// compression is explicitly disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughCompressor;

impl Compressor for PassthroughCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Bytes, CompressionError> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Bytes, CompressionError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// Gzip compression via `flate2`, at a configurable level (0-9).
#[cfg(feature = "gzip")]
#[cfg_attr(docsrs, doc(cfg(feature = "gzip")))]
pub struct GzipCompressor {
    level: u32,
}

#[cfg(feature = "gzip")]
impl GzipCompressor {
    /// Builds a compressor at the default level (6).
    pub fn new() -> Self {
        Self::with_level(6)
    }

    /// Builds a compressor at `level` (0 = no compression, 9 = best).
    pub fn with_level(level: u32) -> Self {
        Self { level }
    }
}

#[cfg(feature = "gzip")]
impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "gzip")]
impl Compressor for GzipCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Bytes, CompressionError> {
        use std::io::Write;
        let mut encoder = flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::new(self.level),
        );
        encoder
            .write_all(bytes)
            .map_err(|e| CompressionError::Codec(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| CompressionError::Codec(e.to_string()))?;
        Ok(Bytes::from(compressed))
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Bytes, CompressionError> {
        use std::io::Read;
        let mut decoder = flate2::read::GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CompressionError::Codec(e.to_string()))?;
        Ok(Bytes::from(out))
    }
}

/// Zstandard compression via `zstd`, at a configurable level.
#[cfg(feature = "zstd")]
#[cfg_attr(docsrs, doc(cfg(feature = "zstd")))]
pub struct ZstdCompressor {
    level: i32,
}

#[cfg(feature = "zstd")]
impl ZstdCompressor {
    /// Builds a compressor at the default level (3).
    pub fn new() -> Self {
        Self::with_level(3)
    }

    /// Builds a compressor at `level`.
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

#[cfg(feature = "zstd")]
impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "zstd")]
impl Compressor for ZstdCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Bytes, CompressionError> {
        zstd::stream::encode_all(bytes, self.level)
            .map(Bytes::from)
            .map_err(|e| CompressionError::Codec(e.to_string()))
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Bytes, CompressionError> {
        zstd::stream::decode_all(bytes)
            .map(Bytes::from)
            .map_err(|e| CompressionError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_round_trips() {
        let compressor = PassthroughCompressor;
        let data = b"hello world";
        let compressed = compressor.compress(data).unwrap();
        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(&decompressed[..], data);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_round_trips() {
        let compressor = GzipCompressor::new();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(16);
        let compressed = compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(&decompressed[..], &data[..]);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_round_trips() {
        let compressor = ZstdCompressor::new();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(16);
        let compressed = compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(&decompressed[..], &data[..]);
    }
}
