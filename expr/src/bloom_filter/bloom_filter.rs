// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::cmp;

use datafusion::common::{DataFusionError, Result};

use crate::bloom_filter::bit_array::{num_words, BitArray};
use crate::hash_funcs::murmur3::spark_compatible_murmur3_hash;

const BLOOM_FILTER_VERSION_1: i32 = 1;

/// version (4) + num_hash_functions (4) + num_words (4)
const SERIALIZED_HEADER_SIZE: usize = 12;

/// Bloom filter over precomputed 32-bit hashes.
///
/// Probe positions use the double hashing scheme of Spark's `BloomFilterImpl`:
/// `h1 + i * h2` for `1 <= i <= num_hash_functions`, where `h1` is the inserted
/// hash and `h2` is that hash rehashed with itself as seed.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct BloomFilter {
    bits: BitArray,
    num_hash_functions: u32,
}

pub fn optimal_num_hash_functions(expected_items: usize, num_bits: usize) -> u32 {
    let expected_items = expected_items.max(1);
    cmp::max(
        1,
        ((num_bits as f64 / expected_items as f64) * 2.0_f64.ln()).round() as u32,
    )
}

pub fn optimal_num_bits(expected_items: usize, fpp: f64) -> usize {
    let expected_items = expected_items.max(1) as f64;
    let num_bits = -expected_items * fpp.ln() / (2.0_f64.ln() * 2.0_f64.ln());
    cmp::max(64, num_bits as usize)
}

impl BloomFilter {
    /// Creates an empty filter given number of hash functions and bits. The bit
    /// count is rounded up to a whole number of 64-bit words, at least one.
    pub fn new(num_hash_functions: u32, num_bits: usize) -> Self {
        Self {
            bits: BitArray::new(vec![0u64; num_words(num_bits).max(1)]),
            num_hash_functions: num_hash_functions.max(1),
        }
    }

    /// Creates an empty filter sized for `expected_items` distinct values at a
    /// false positive probability of `fpp`.
    pub fn with_expected_items(expected_items: usize, fpp: f64) -> Self {
        let num_bits = optimal_num_bits(expected_items, fpp);
        Self::new(
            optimal_num_hash_functions(expected_items, num_bits),
            num_bits,
        )
    }

    /// Size in bytes of the bit array `with_expected_items` would allocate.
    pub fn estimated_byte_size(expected_items: usize, fpp: f64) -> usize {
        num_words(optimal_num_bits(expected_items, fpp)) * 8
    }

    /// Inserts a hash, returning true if any bit changed.
    pub fn insert_hash(&mut self, hash: u32) -> bool {
        let bit_size = self.bits.bit_size();
        let mut bit_changed = false;
        for index in self.probe_positions(hash, bit_size) {
            bit_changed |= self.bits.set(index);
        }
        bit_changed
    }

    pub fn might_contain_hash(&self, hash: u32) -> bool {
        let bit_size = self.bits.bit_size();
        self.probe_positions(hash, bit_size)
            .all(|index| self.bits.get(index))
    }

    fn probe_positions(&self, hash: u32, bit_size: u64) -> impl Iterator<Item = usize> {
        let h1 = hash as i32;
        let h2 = spark_compatible_murmur3_hash(hash.to_le_bytes(), hash) as i32;
        (1..=self.num_hash_functions).map(move |i| {
            let mut combined_hash = h1.wrapping_add((i as i32).wrapping_mul(h2));
            if combined_hash < 0 {
                combined_hash = !combined_hash;
            }
            (combined_hash as u64 % bit_size) as usize
        })
    }

    /// ORs another filter of identical shape into this one.
    pub fn merge(&mut self, other: &BloomFilter) -> Result<()> {
        if self.num_hash_functions != other.num_hash_functions
            || self.bits.word_size() != other.bits.word_size()
        {
            return Err(DataFusionError::Internal(format!(
                "Cannot merge bloom filters with incompatible shapes: \
                 {} words/{} hash functions vs {} words/{} hash functions",
                self.bits.word_size(),
                self.num_hash_functions,
                other.bits.word_size(),
                other.num_hash_functions
            )));
        }
        self.bits.merge(&other.bits);
        Ok(())
    }

    /// Serializes to Spark's BloomFilter binary format version 1.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SERIALIZED_HEADER_SIZE + self.bits.byte_size());
        buf.extend_from_slice(&BLOOM_FILTER_VERSION_1.to_be_bytes());
        buf.extend_from_slice(&self.num_hash_functions.to_be_bytes());
        buf.extend_from_slice(&(self.bits.word_size() as u32).to_be_bytes());
        for word in self.bits.words() {
            buf.extend_from_slice(&word.to_be_bytes());
        }
        buf
    }

    /// Parses a filter written by [`BloomFilter::serialize`].
    pub fn try_from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < SERIALIZED_HEADER_SIZE {
            return Err(DataFusionError::Execution(format!(
                "Serialized bloom filter too short: {} bytes",
                buf.len()
            )));
        }
        let version = i32::from_be_bytes(be_bytes(buf, 0));
        if version != BLOOM_FILTER_VERSION_1 {
            return Err(DataFusionError::Execution(format!(
                "Unsupported BloomFilter version: {version}, expecting version: {BLOOM_FILTER_VERSION_1}"
            )));
        }
        let num_hash_functions = u32::from_be_bytes(be_bytes(buf, 4));
        let num_words = u32::from_be_bytes(be_bytes(buf, 8)) as usize;
        if num_words == 0 {
            return Err(DataFusionError::Execution(
                "Serialized bloom filter has no bit words".to_string(),
            ));
        }
        let expected_len = SERIALIZED_HEADER_SIZE + num_words * 8;
        if buf.len() != expected_len {
            return Err(DataFusionError::Execution(format!(
                "Serialized bloom filter has {} bytes, expected {expected_len} for {num_words} words",
                buf.len()
            )));
        }
        let words = buf[SERIALIZED_HEADER_SIZE..]
            .chunks_exact(8)
            .map(|chunk| u64::from_be_bytes(be_bytes(chunk, 0)))
            .collect();
        Ok(Self {
            bits: BitArray::new(words),
            num_hash_functions,
        })
    }

    pub fn num_hash_functions(&self) -> u32 {
        self.num_hash_functions
    }

    pub fn byte_size(&self) -> usize {
        self.bits.byte_size()
    }

    /// Number of bits set.
    pub fn cardinality(&self) -> usize {
        self.bits.cardinality()
    }
}

/// `N` bytes of `buf` starting at `offset`, in the big-endian layout Spark
/// serializes with. Callers check the length.
fn be_bytes<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&buf[offset..offset + N]);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_inserted_hashes_are_found() {
        let mut filter = BloomFilter::with_expected_items(1000, 0.03);
        let hashes: Vec<u32> = (0..1000u32)
            .map(|v| spark_compatible_murmur3_hash(v.to_le_bytes(), 42))
            .collect();
        for hash in &hashes {
            filter.insert_hash(*hash);
        }
        assert!(hashes.iter().all(|h| filter.might_contain_hash(*h)));
    }

    #[test]
    fn test_false_positive_rate() {
        let mut filter = BloomFilter::with_expected_items(1000, 0.03);
        for v in 0..1000u32 {
            filter.insert_hash(spark_compatible_murmur3_hash(v.to_le_bytes(), 42));
        }
        let mut rng = rand::rng();
        let false_positives = (0..10_000)
            .map(|_| rng.random_range(1_000_000u32..u32::MAX))
            .filter(|v| {
                filter.might_contain_hash(spark_compatible_murmur3_hash(v.to_le_bytes(), 42))
            })
            .count();
        // 3% target; leave plenty of slack
        assert!(false_positives < 1000, "{false_positives} false positives");
    }

    #[test]
    fn test_serialize_and_merge() {
        let mut left = BloomFilter::new(3, 1024);
        let mut right = BloomFilter::new(3, 1024);
        left.insert_hash(7);
        right.insert_hash(11);

        let restored = BloomFilter::try_from_bytes(&right.serialize()).unwrap();
        assert_eq!(restored, right);

        left.merge(&restored).unwrap();
        assert!(left.might_contain_hash(7));
        assert!(left.might_contain_hash(11));

        let other_shape = BloomFilter::new(3, 2048);
        assert!(left.merge(&other_shape).is_err());
    }

    #[test]
    fn test_rejects_bad_buffers() {
        assert!(BloomFilter::try_from_bytes(&[0, 0, 0, 1]).is_err());
        let mut bytes = BloomFilter::new(2, 128).serialize();
        bytes[3] = 2;
        assert!(BloomFilter::try_from_bytes(&bytes).is_err());
        let mut bytes = BloomFilter::new(2, 128).serialize();
        bytes.pop();
        assert!(BloomFilter::try_from_bytes(&bytes).is_err());
        // header only, zero words
        let bytes = [0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 0];
        assert!(BloomFilter::try_from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_zero_bits_rounds_up_to_one_word() {
        let mut filter = BloomFilter::new(3, 0);
        assert_eq!(filter.byte_size(), 8);
        filter.insert_hash(17);
        assert!(filter.might_contain_hash(17));
        let restored = BloomFilter::try_from_bytes(&filter.serialize()).unwrap();
        assert_eq!(restored, filter);
    }

    #[test]
    fn test_sizing() {
        // Spark: optimalNumOfBits(1000, 0.03) = 7298
        assert_eq!(optimal_num_bits(1000, 0.03), 7298);
        assert_eq!(optimal_num_hash_functions(1000, 7298), 5);
        assert_eq!(BloomFilter::estimated_byte_size(1000, 0.03), 115 * 8);
    }
}
