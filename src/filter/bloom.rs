use bytes::Bytes;
use rand::Rng;

use crate::error::{Error, IResult};
use crate::util::coding::{decode_fixed_64, put_fixed_64, take_fixed_64};

/// Serialized header: `[k u64][length u64]` followed by `k` seeds.
const HEADER_WORDS: usize = 2;

/// A per-data-block bloom filter.
///
/// Sized for an expected `n` keys at false-positive rate `p`:
/// `length = ceil(-n*ln(p)/ln(2)^2 * 2.35) + 1` bits and
/// `k = max(1, floor(0.69 * length / n))` hash functions, each derived from
/// a random `u64` seed. Keys are hashed with a polynomial over the seed:
/// `h = sum(seed^i * key[i])` in wrapping arithmetic, bit = `h % length`.
///
/// Serialized form, all fields little-endian u64:
///
/// ```text
///     +---+--------+--------+-----+------------+---------+-----+
///     | k | length | seed_0 | ... | seed_{k-1} | words_0 | ... |
///     +---+--------+--------+-----+------------+---------+-----+
/// ```
///
/// The bit array holds `ceil(length / 64)` words. A filter built by
/// [`BloomFilter::new`] owns its bit array; a filter produced by
/// [`BloomFilter::load`] is a zero-copy view over the backing block bytes
/// and stays valid for as long as that buffer does (`Bytes` keeps it
/// alive). Only owned filters accept inserts.
pub struct BloomFilter {
    length: u64,
    seeds: Vec<u64>,
    bits: BloomBits,
}

enum BloomBits {
    Owned(Vec<u64>),
    View(Bytes),
}

impl BloomFilter {
    /// Creates an empty filter sized for `n` expected keys at
    /// false-positive rate `p`.
    pub fn new(n: usize, p: f64) -> Self {
        let n = n.max(1);
        let length =
            (-(p.ln()) * n as f64 / (std::f64::consts::LN_2 * std::f64::consts::LN_2) * 2.35)
                .ceil() as u64
                + 1;
        let k = ((0.69 * length as f64 / n as f64) as usize).max(1);
        let mut rng = rand::thread_rng();
        let seeds = (0..k).map(|_| rng.gen::<u64>()).collect();
        let words = (length as usize + 63) / 64;
        BloomFilter {
            length,
            seeds,
            bits: BloomBits::Owned(vec![0u64; words]),
        }
    }

    /// The number of bytes [`save`](Self::save) will produce.
    pub fn binary_size(&self) -> usize {
        (HEADER_WORDS + self.seeds.len() + self.word_count()) * 8
    }

    #[inline]
    fn word_count(&self) -> usize {
        (self.length as usize + 63) / 64
    }

    pub fn insert(&mut self, key: &[u8]) {
        let length = self.length;
        let words = match &mut self.bits {
            BloomBits::Owned(words) => words,
            BloomBits::View(_) => {
                panic!("[BloomFilter] insert into a loaded view is a programming error")
            }
        };
        for &seed in &self.seeds {
            let bit = bloom_hash(key, seed) % length;
            words[(bit / 64) as usize] |= 1u64 << (bit & 63);
        }
    }

    /// False means the key is definitely absent; true means it is present
    /// with probability `1 - p`.
    pub fn check(&self, key: &[u8]) -> bool {
        for &seed in &self.seeds {
            let bit = bloom_hash(key, seed) % self.length;
            if self.word((bit / 64) as usize) & (1u64 << (bit & 63)) == 0 {
                return false;
            }
        }
        true
    }

    #[inline]
    fn word(&self, i: usize) -> u64 {
        match &self.bits {
            BloomBits::Owned(words) => words[i],
            BloomBits::View(data) => decode_fixed_64(&data[i * 8..]),
        }
    }

    /// Appends the serialized filter to `dst`.
    pub fn save(&self, dst: &mut Vec<u8>) {
        put_fixed_64(dst, self.seeds.len() as u64);
        put_fixed_64(dst, self.length);
        for &seed in &self.seeds {
            put_fixed_64(dst, seed);
        }
        match &self.bits {
            BloomBits::Owned(words) => {
                for &w in words {
                    put_fixed_64(dst, w);
                }
            }
            BloomBits::View(data) => dst.extend_from_slice(data),
        }
    }

    /// Parses a filter from the front of `src` as a zero-copy view.
    /// Returns the filter and the number of bytes it occupies.
    pub fn load(src: &Bytes) -> IResult<(Self, usize)> {
        if src.len() < HEADER_WORDS * 8 {
            return Err(Error::Corruption("bloom filter header truncated".into()));
        }
        let mut index = 0;
        let k = take_fixed_64(src, &mut index);
        let length = take_fixed_64(src, &mut index);
        if k == 0 || k > 64 || length == 0 {
            return Err(Error::Corruption(format!(
                "bloom filter has implausible parameters: k={} length={}",
                k, length
            )));
        }
        let words = (length as usize + 63) / 64;
        let total = (HEADER_WORDS + k as usize + words) * 8;
        if src.len() < total {
            return Err(Error::Corruption(format!(
                "bloom filter needs {} bytes, buffer has {}",
                total,
                src.len()
            )));
        }
        let mut seeds = Vec::with_capacity(k as usize);
        for _ in 0..k {
            seeds.push(take_fixed_64(src, &mut index));
        }
        let bits = BloomBits::View(src.slice(index..total));
        Ok((
            BloomFilter {
                length,
                seeds,
                bits,
            },
            total,
        ))
    }
}

#[inline]
fn bloom_hash(key: &[u8], seed: u64) -> u64 {
    key.iter()
        .fold(0u64, |acc, &b| acc.wrapping_mul(seed).wrapping_add(b as u64))
}
