//! Block-compression codecs for fragment payloads.
//!
//! Provides a [`Codec`] trait with implementations for LZ4 and Zstandard,
//! registered in a [`CodecRegistry`] for lookup by [`CompressionKind`].

use crate::LogError;

/// Compression applied to one fragment block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionKind {
    #[default]
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl CompressionKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// A compression/decompression codec.
pub trait Codec: Send + Sync {
    /// Returns the compression kind for this codec.
    fn kind(&self) -> CompressionKind;

    /// Compresses input data.
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, LogError>;

    /// Decompresses previously compressed data.
    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>, LogError>;
}

/// No-op codec (passthrough).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneCodec;

impl Codec for NoneCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::None
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, LogError> {
        Ok(input.to_vec())
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>, LogError> {
        Ok(input.to_vec())
    }
}

/// LZ4 codec using `lz4_flex` (pure Rust, fast).
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Lz4
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, LogError> {
        Ok(lz4_flex::compress_prepend_size(input))
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>, LogError> {
        lz4_flex::decompress_size_prepended(input).map_err(|e| LogError::DecompressionFailed {
            codec: "lz4",
            reason: e.to_string(),
        })
    }
}

/// Zstandard codec with configurable compression level.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    /// Compression level (1-22, default 3).
    pub level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Codec for ZstdCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Zstd
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, LogError> {
        zstd::encode_all(input, self.level).map_err(|e| LogError::CompressionFailed {
            codec: "zstd",
            reason: e.to_string(),
        })
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>, LogError> {
        zstd::decode_all(input).map_err(|e| LogError::DecompressionFailed {
            codec: "zstd",
            reason: e.to_string(),
        })
    }
}

/// Registry of compression codecs, keyed by [`CompressionKind`].
#[derive(Debug, Default)]
pub struct CodecRegistry {
    none: NoneCodec,
    lz4: Lz4Codec,
    zstd: ZstdCodec,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the codec for the given compression kind.
    pub fn get(&self, kind: CompressionKind) -> &dyn Codec {
        match kind {
            CompressionKind::None => &self.none,
            CompressionKind::Lz4 => &self.lz4,
            CompressionKind::Zstd => &self.zstd,
        }
    }

    pub fn compress(&self, kind: CompressionKind, data: &[u8]) -> Result<Vec<u8>, LogError> {
        self.get(kind).compress(data)
    }

    pub fn decompress(&self, kind: CompressionKind, data: &[u8]) -> Result<Vec<u8>, LogError> {
        self.get(kind).decompress(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codecs_round_trip() {
        let registry = CodecRegistry::new();
        let input = b"the quick brown fox jumps over the lazy dog".repeat(20);
        for kind in [
            CompressionKind::None,
            CompressionKind::Lz4,
            CompressionKind::Zstd,
        ] {
            let compressed = registry.compress(kind, &input).unwrap();
            let output = registry.decompress(kind, &compressed).unwrap();
            assert_eq!(output, input);
        }
    }

    #[test]
    fn kind_round_trips() {
        for byte in 0..3u8 {
            assert_eq!(CompressionKind::from_u8(byte).unwrap().as_u8(), byte);
        }
        assert!(CompressionKind::from_u8(9).is_none());
    }
}
