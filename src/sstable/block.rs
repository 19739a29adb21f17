//! SST data-block encoding.
//!
//! A data block is a sorted run of key/value records guarded by its own
//! bloom filter. On disk every block starts with a u64 byte count covering
//! everything after it; the body comes in two forms:
//!
//! ```text
//!     plain       [size u64][bloom][entry_count u64][entries...]
//!     compressed  [size u64][flags u8][bloom][entry_count u64][payload]
//! ```
//!
//! Entries are `[key_len u64][value_len u64][key][value]`, strictly
//! ascending by key. In the compressed form the bloom filter is never
//! compressed; only the entry payload is, and only when the configured
//! codec and minimum size say so. `flags` bit 0 marks a compressed payload,
//! bit 1 marks a payload that carries the codec's own length header (LZ4).
//!
//! Readers work on the *decoded* body `[bloom][entry_count][entries...]`,
//! which is also exactly what the block cache stores.

use bytes::Bytes;

use crate::compress::{new_compressor, CompressedData, CompressionConfig, CompressionType};
use crate::error::{Error, IResult};
use crate::filter::BloomFilter;
use crate::util::coding::{put_fixed_64, take_fixed_64};

const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_LENGTH_HEADER: u8 = 0x02;

/// Bloom filter false-positive target for every data block.
pub const BLOOM_FP_RATE: f64 = 0.01;

/// Accumulates sorted entries and serializes one on-disk block.
pub struct BlockBuilder {
    entries: Vec<(Bytes, Bytes)>,
    entries_size: usize,
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockBuilder {
    pub fn new() -> Self {
        BlockBuilder {
            entries: vec![],
            entries_size: 0,
        }
    }

    /// # Panics
    ///
    /// Panics if `key` is not strictly greater than the last added key.
    pub fn add(&mut self, key: Bytes, value: Bytes) {
        if let Some((last, _)) = self.entries.last() {
            assert!(
                *last < key,
                "[BlockBuilder] keys must be added in strictly ascending order"
            );
        }
        self.entries_size += 16 + key.len() + value.len();
        self.entries.push((key, value));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn first_key(&self) -> Option<&Bytes> {
        self.entries.first().map(|(k, _)| k)
    }

    /// Estimate of the serialized size, used for block splitting. The bloom
    /// filter is not included; it only grows the estimate by a few percent.
    pub fn estimated_size(&self) -> usize {
        8 + self.entries_size
    }

    /// Serializes the block (including its leading size field) and leaves
    /// the builder empty for the next block.
    pub fn finish(&mut self, compression: &CompressionConfig) -> IResult<Vec<u8>> {
        assert!(!self.entries.is_empty(), "[BlockBuilder] nothing to finish");

        let mut bloom = BloomFilter::new(self.entries.len(), BLOOM_FP_RATE);
        for (key, _) in &self.entries {
            bloom.insert(key);
        }
        let mut bloom_bytes = Vec::with_capacity(bloom.binary_size());
        bloom.save(&mut bloom_bytes);

        let mut payload = Vec::with_capacity(self.entries_size);
        for (key, value) in &self.entries {
            put_fixed_64(&mut payload, key.len() as u64);
            put_fixed_64(&mut payload, value.len() as u64);
            payload.extend_from_slice(key);
            payload.extend_from_slice(value);
        }
        let count = self.entries.len() as u64;
        self.entries.clear();
        self.entries_size = 0;

        let mut block = vec![];
        if compression.is_active() {
            let mut flags = 0u8;
            if compression.should_compress(payload.len()) {
                let codec = new_compressor(compression.codec)
                    .expect("active compression config without codec");
                let compressed = codec.compress(&payload)?;
                if compressed.payload.len() < payload.len() {
                    payload = compressed.payload;
                    flags |= FLAG_COMPRESSED;
                    if compression.codec == CompressionType::Lz4 {
                        flags |= FLAG_LENGTH_HEADER;
                    }
                }
            }
            let body_len = 1 + bloom_bytes.len() + 8 + payload.len();
            put_fixed_64(&mut block, body_len as u64);
            block.push(flags);
        } else {
            let body_len = bloom_bytes.len() + 8 + payload.len();
            put_fixed_64(&mut block, body_len as u64);
        }
        block.extend_from_slice(&bloom_bytes);
        put_fixed_64(&mut block, count);
        block.extend_from_slice(&payload);
        Ok(block)
    }
}

/// Decodes a raw on-disk block body (everything after the size field) into
/// the plain `[bloom][entry_count][entries...]` form.
pub fn decode_block(raw: &[u8], compression: &CompressionConfig) -> IResult<Bytes> {
    let raw = Bytes::copy_from_slice(raw);
    if !compression.is_active() {
        return Ok(raw);
    }
    if raw.is_empty() {
        return Err(Error::Corruption("compressed block has no flags byte".into()));
    }
    let flags = raw[0];
    let body = raw.slice(1..);
    if flags & FLAG_COMPRESSED == 0 {
        return Ok(body);
    }

    let (_, bloom_len) = BloomFilter::load(&body)?;
    if body.len() < bloom_len + 8 {
        return Err(Error::Corruption("compressed block truncated".into()));
    }
    let mut index = bloom_len;
    let count = take_fixed_64(&body, &mut index);
    let payload = &body[index..];

    let codec = new_compressor(compression.codec).ok_or_else(|| {
        Error::Corruption("block is compressed but no codec is configured".into())
    })?;
    let original_size = codec.decompressed_size(payload)?;
    let mut entries = vec![0u8; original_size];
    let written = codec.decompress(
        &CompressedData {
            payload: payload.to_vec(),
            original_size,
        },
        &mut entries,
    )?;
    if written != original_size {
        return Err(Error::Corruption(format!(
            "block decompressed to {} bytes, expected {}",
            written, original_size
        )));
    }

    let mut decoded = Vec::with_capacity(bloom_len + 8 + entries.len());
    decoded.extend_from_slice(&body[..bloom_len]);
    put_fixed_64(&mut decoded, count);
    decoded.extend_from_slice(&entries);
    Ok(Bytes::from(decoded))
}

struct EntryOffset {
    key_off: usize,
    key_len: usize,
    value_off: usize,
    value_len: usize,
}

/// A decoded, searchable data block.
pub struct DataBlock {
    data: Bytes,
    bloom: BloomFilter,
    entries: Vec<EntryOffset>,
}

impl DataBlock {
    /// Parses the decoded body. Bounds violations and size mismatches are
    /// corruption.
    pub fn parse(data: Bytes) -> IResult<DataBlock> {
        let (bloom, bloom_len) = BloomFilter::load(&data)?;
        if data.len() < bloom_len + 8 {
            return Err(Error::Corruption("data block truncated after bloom".into()));
        }
        let mut index = bloom_len;
        let count = take_fixed_64(&data, &mut index) as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            if data.len() < index + 16 {
                return Err(Error::Corruption("data block entry header truncated".into()));
            }
            let key_len = take_fixed_64(&data, &mut index) as usize;
            let value_len = take_fixed_64(&data, &mut index) as usize;
            if data.len() < index + key_len + value_len {
                return Err(Error::Corruption(format!(
                    "data block entry overruns block: need {} bytes, have {}",
                    index + key_len + value_len,
                    data.len()
                )));
            }
            entries.push(EntryOffset {
                key_off: index,
                key_len,
                value_off: index + key_len,
                value_len,
            });
            index += key_len + value_len;
        }
        if index != data.len() {
            return Err(Error::Corruption(format!(
                "data block advertises {} entries but {} trailing bytes remain",
                count,
                data.len() - index
            )));
        }
        Ok(DataBlock {
            data,
            bloom,
            entries,
        })
    }

    fn key(&self, i: usize) -> &[u8] {
        let e = &self.entries[i];
        &self.data[e.key_off..e.key_off + e.key_len]
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, i: usize) -> (Bytes, Bytes) {
        let e = &self.entries[i];
        (
            self.data.slice(e.key_off..e.key_off + e.key_len),
            self.data.slice(e.value_off..e.value_off + e.value_len),
        )
    }

    /// Point lookup: bloom filter first, then binary search.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        if !self.bloom.check(key) {
            return None;
        }
        let mut lo = 0;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < self.entries.len() && self.key(lo) == key {
            let e = &self.entries[lo];
            Some(self.data.slice(e.value_off..e.value_off + e.value_len))
        } else {
            None
        }
    }
}
