//! Pluggable block compression.
//!
//! Data-block payloads may be compressed with Snappy or LZ4 before they hit
//! disk. The LZ4 wire form prepends the original size as a 4-byte
//! little-endian header (the raw block format is not self-describing);
//! Snappy carries its own length and needs no header.

use serde::{Deserialize, Serialize};

use crate::error::{Error, IResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Snappy,
    Lz4,
}

/// The result of compressing one payload.
pub struct CompressedData {
    pub payload: Vec<u8>,
    pub original_size: usize,
}

pub trait Compressor: Send + Sync {
    fn codec(&self) -> CompressionType;

    fn compress(&self, data: &[u8]) -> IResult<CompressedData>;

    /// Writes the decompressed payload into `out` and returns the number of
    /// bytes written. Fails when `out` is smaller than the original size.
    fn decompress(&self, data: &CompressedData, out: &mut [u8]) -> IResult<usize>;

    /// The original size recorded in (or derivable from) a wire payload.
    fn decompressed_size(&self, payload: &[u8]) -> IResult<usize>;

    /// Upper bound on the compressed size of an `n`-byte input.
    fn max_compressed_size(&self, n: usize) -> usize;
}

/// Returns the codec for `t`, or None when `t` is `CompressionType::None`.
pub fn new_compressor(t: CompressionType) -> Option<Box<dyn Compressor>> {
    match t {
        CompressionType::Snappy => Some(Box::new(SnappyCompressor)),
        CompressionType::Lz4 => Some(Box::new(Lz4Compressor)),
        CompressionType::None => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub codec: CompressionType,
    pub enable: bool,
    /// Payloads below this size are stored raw; the framing overhead would
    /// outweigh the savings.
    pub min_size_for_compression: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            codec: CompressionType::Lz4,
            enable: true,
            min_size_for_compression: 64,
        }
    }
}

impl CompressionConfig {
    pub fn disabled() -> Self {
        CompressionConfig {
            codec: CompressionType::None,
            enable: false,
            min_size_for_compression: 64,
        }
    }

    /// True when SSTs built under this config use the compressed block form.
    pub fn is_active(&self) -> bool {
        self.enable && self.codec != CompressionType::None
    }

    pub fn should_compress(&self, original_size: usize) -> bool {
        self.is_active() && original_size >= self.min_size_for_compression
    }
}

pub struct SnappyCompressor;

impl Compressor for SnappyCompressor {
    fn codec(&self) -> CompressionType {
        CompressionType::Snappy
    }

    fn compress(&self, data: &[u8]) -> IResult<CompressedData> {
        let mut enc = snap::raw::Encoder::new();
        let mut payload = vec![0; snap::raw::max_compress_len(data.len())];
        let written = enc.compress(data, &mut payload)?;
        payload.truncate(written);
        Ok(CompressedData {
            payload,
            original_size: data.len(),
        })
    }

    fn decompress(&self, data: &CompressedData, out: &mut [u8]) -> IResult<usize> {
        if out.len() < data.original_size {
            return Err(Error::Compression(format!(
                "output buffer too small: {} < {}",
                out.len(),
                data.original_size
            )));
        }
        let mut dec = snap::raw::Decoder::new();
        let written = dec.decompress(&data.payload, out)?;
        Ok(written)
    }

    fn decompressed_size(&self, payload: &[u8]) -> IResult<usize> {
        Ok(snap::raw::decompress_len(payload)?)
    }

    fn max_compressed_size(&self, n: usize) -> usize {
        snap::raw::max_compress_len(n)
    }
}

pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn codec(&self) -> CompressionType {
        CompressionType::Lz4
    }

    fn compress(&self, data: &[u8]) -> IResult<CompressedData> {
        // compress_prepend_size emits the 4-byte LE original-size header.
        let payload = lz4_flex::block::compress_prepend_size(data);
        Ok(CompressedData {
            payload,
            original_size: data.len(),
        })
    }

    fn decompress(&self, data: &CompressedData, out: &mut [u8]) -> IResult<usize> {
        if out.len() < data.original_size {
            return Err(Error::Compression(format!(
                "output buffer too small: {} < {}",
                out.len(),
                data.original_size
            )));
        }
        if data.payload.len() < 4 {
            return Err(Error::Compression("lz4 payload missing size header".into()));
        }
        let written =
            lz4_flex::block::decompress_into(&data.payload[4..], &mut out[..data.original_size])?;
        Ok(written)
    }

    fn decompressed_size(&self, payload: &[u8]) -> IResult<usize> {
        if payload.len() < 4 {
            return Err(Error::Compression("lz4 payload missing size header".into()));
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&payload[..4]);
        Ok(u32::from_le_bytes(buf) as usize)
    }

    fn max_compressed_size(&self, n: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(n) + 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(c: &dyn Compressor, data: &[u8]) {
        let compressed = c.compress(data).unwrap();
        assert_eq!(compressed.original_size, data.len());
        assert_eq!(
            c.decompressed_size(&compressed.payload).unwrap(),
            data.len()
        );
        assert!(compressed.payload.len() <= c.max_compressed_size(data.len()));
        let mut out = vec![0u8; data.len()];
        let written = c.decompress(&compressed, &mut out).unwrap();
        assert_eq!(written, data.len());
        assert_eq!(&out[..], data);
    }

    #[test]
    fn test_snappy_round_trip() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        round_trip(&SnappyCompressor, &data);
    }

    #[test]
    fn test_lz4_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        round_trip(&Lz4Compressor, &data);
    }

    #[test]
    fn test_lz4_header_is_little_endian_original_size() {
        let data = vec![7u8; 300];
        let compressed = Lz4Compressor.compress(&data).unwrap();
        assert_eq!(&compressed.payload[..4], &300u32.to_le_bytes());
    }

    #[test]
    fn test_decompress_rejects_short_output() {
        for c in [&SnappyCompressor as &dyn Compressor, &Lz4Compressor] {
            let compressed = c.compress(&[1u8; 256]).unwrap();
            let mut out = vec![0u8; 100];
            assert!(c.decompress(&compressed, &mut out).is_err());
        }
    }

    #[test]
    fn test_should_compress_thresholds() {
        let cfg = CompressionConfig::default();
        assert!(!cfg.should_compress(63));
        assert!(cfg.should_compress(64));
        assert!(!CompressionConfig::disabled().should_compress(1 << 20));
        let off = CompressionConfig {
            enable: false,
            ..CompressionConfig::default()
        };
        assert!(!off.should_compress(1 << 20));
    }

    #[test]
    fn test_none_has_no_compressor() {
        assert!(new_compressor(CompressionType::None).is_none());
        assert!(new_compressor(CompressionType::Snappy).is_some());
        assert!(new_compressor(CompressionType::Lz4).is_some());
    }
}
