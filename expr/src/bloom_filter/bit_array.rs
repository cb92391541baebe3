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

use std::iter::zip;

/// Fixed-size bit array backing a bloom filter. Bit `i` lives in word `i / 64`
/// at position `i % 64`, matching Spark's `BitArray`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct BitArray {
    data: Vec<u64>,
    bit_count: usize,
}

impl BitArray {
    pub fn new(buf: Vec<u64>) -> Self {
        let num_bits = buf.iter().map(|x| x.count_ones() as usize).sum();
        Self {
            data: buf,
            bit_count: num_bits,
        }
    }

    /// Sets bit `index`, returning true if it was previously unset.
    pub fn set(&mut self, index: usize) -> bool {
        if !self.get(index) {
            self.data[index >> 6] |= 1u64 << (index & 0x3f);
            self.bit_count += 1;
            true
        } else {
            false
        }
    }

    pub fn get(&self, index: usize) -> bool {
        (self.data[index >> 6] & (1u64 << (index & 0x3f))) != 0
    }

    pub fn bit_size(&self) -> u64 {
        self.word_size() as u64 * 64
    }

    pub fn byte_size(&self) -> usize {
        self.word_size() * 8
    }

    pub fn word_size(&self) -> usize {
        self.data.len()
    }

    /// Number of set bits.
    pub fn cardinality(&self) -> usize {
        self.bit_count
    }

    pub fn words(&self) -> &[u64] {
        &self.data
    }

    /// ORs `other` into this array. Both must have the same number of words.
    pub fn merge(&mut self, other: &BitArray) {
        assert_eq!(self.word_size(), other.word_size());
        let mut bit_count: usize = 0;
        for (word, other_word) in zip(self.data.iter_mut(), other.data.iter()) {
            *word |= *other_word;
            bit_count += word.count_ones() as usize;
        }
        self.bit_count = bit_count;
    }
}

/// Returns the number of 64-bit words needed to store `num_bits` bits.
#[inline]
pub fn num_words(num_bits: usize) -> usize {
    num_bits.div_ceil(64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bit_array() {
        let mut array = BitArray::new(vec![0u64; 4]);
        assert_eq!(array.bit_size(), 256);
        assert_eq!(array.cardinality(), 0);

        for n in [0, 1, 63, 64, 65, 127, 128, 129] {
            assert!(!array.get(n));
            assert!(array.set(n));
        }
        assert_eq!(array.cardinality(), 8);

        // already set
        assert!(!array.set(0));
        assert!(!array.get(2));
        assert!(!array.get(62));
    }

    #[test]
    fn test_bit_array_with_non_empty_buffer() {
        let array = BitArray::new(vec![8u64; 4]);
        assert_eq!(array.cardinality(), 4);
        assert!(array.get(3));
        assert!(array.get(67));
        assert!(array.get(131));
        assert!(array.get(195));
        assert!(!array.get(0));
    }

    #[test]
    fn test_bit_array_merge() {
        let mut fibs = BitArray::new(vec![0u64; 4]);
        let mut primes = BitArray::new(vec![0u64; 4]);
        for n in [1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233] {
            fibs.set(n);
        }
        for n in [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47] {
            primes.set(n);
        }

        fibs.merge(&primes);
        // 12 fibs + 15 primes - {2, 3, 5, 13} shared
        assert_eq!(fibs.cardinality(), 23);
        assert!(fibs.get(47));
        assert!(fibs.get(233));
    }

    #[test]
    fn test_num_words() {
        assert_eq!(num_words(0), 0);
        assert_eq!(num_words(1), 1);
        assert_eq!(num_words(64), 1);
        assert_eq!(num_words(65), 2);
    }
}
