mod bloom;

pub use self::bloom::BloomFilter;
