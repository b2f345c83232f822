use std::sync::Arc;

use crate::error::XudpError;

/// Negotiated per-peer compression level. Part of the connect handshake;
/// both sides must agree or the connection is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    Fastest,
    Fast,
    Normal,
    Best,
}

impl CompressionLevel {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Fast => 2,
            CompressionLevel::Normal => 3,
            CompressionLevel::Best => 4,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<CompressionLevel> {
        match value {
            1 => Some(CompressionLevel::Fastest),
            2 => Some(CompressionLevel::Fast),
            3 => Some(CompressionLevel::Normal),
            4 => Some(CompressionLevel::Best),
            _ => None,
        }
    }

    fn zstd_level(self) -> i32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Fast => 3,
            CompressionLevel::Normal => 9,
            CompressionLevel::Best => 19,
        }
    }
}

/// Payload codec seam. Peers negotiating the same level share one handle;
/// the last peer dropping its handle frees the codec.
pub trait Compressor: Send + Sync {
    fn level(&self) -> CompressionLevel;

    /// Worst-case deflated size for an input of `len` bytes.
    fn max_deflated_len(&self, len: usize) -> usize;

    fn deflate(&self, data: &[u8]) -> Result<Vec<u8>, XudpError>;

    fn inflate(&self, data: &[u8]) -> Result<Vec<u8>, XudpError>;
}

pub(crate) struct ZstdCompressor {
    level: CompressionLevel,
}

impl ZstdCompressor {
    pub(crate) fn shared(level: CompressionLevel) -> Arc<dyn Compressor> {
        Arc::new(ZstdCompressor { level })
    }
}

impl Compressor for ZstdCompressor {
    fn level(&self) -> CompressionLevel {
        self.level
    }

    fn max_deflated_len(&self, len: usize) -> usize {
        zstd::zstd_safe::compress_bound(len)
    }

    fn deflate(&self, data: &[u8]) -> Result<Vec<u8>, XudpError> {
        zstd::bulk::compress(data, self.level.zstd_level()).map_err(XudpError::Compression)
    }

    fn inflate(&self, data: &[u8]) -> Result<Vec<u8>, XudpError> {
        zstd::decode_all(data).map_err(XudpError::Compression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_inflate_restores_the_payload() {
        let codec = ZstdCompressor::shared(CompressionLevel::Fast);
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(50);

        let deflated = codec.deflate(&payload).unwrap();
        assert!(deflated.len() < payload.len());

        let inflated = codec.inflate(&deflated).unwrap();
        assert_eq!(inflated, payload);
    }

    #[test]
    fn wire_levels_round_trip() {
        for level in [
            CompressionLevel::Fastest,
            CompressionLevel::Fast,
            CompressionLevel::Normal,
            CompressionLevel::Best,
        ] {
            assert_eq!(CompressionLevel::from_wire(level.to_wire()), Some(level));
        }
        assert_eq!(CompressionLevel::from_wire(0), None);
        assert_eq!(CompressionLevel::from_wire(5), None);
    }
}
