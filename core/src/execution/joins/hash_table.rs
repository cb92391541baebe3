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

//! Open-addressing hash table from join-key hash to build row indices.

use std::mem::size_of;

use datafusion::common::{DataFusionError, Result as DFResult};
use datafusion::execution::memory_pool::MemoryReservation;

/// Upper bound on the bucket count a table starts with; larger tables grow
/// by doubling as distinct hashes arrive.
const MAX_INITIAL_BUCKETS: usize = 1024;

/// `head` is one past the most recently inserted row with `hash`; 0 marks an
/// empty bucket.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
struct Bucket {
    hash: u32,
    head: u32,
}

/// Rows sharing a hash are chained through `next`, indexed by row.
pub struct JoinHashTable {
    buckets: Vec<Bucket>,
    next: Vec<u32>,
    num_filled: usize,
    num_inserted: usize,
    reservation: MemoryReservation,
}

impl std::fmt::Debug for JoinHashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHashTable")
            .field("num_buckets", &self.buckets.len())
            .field("num_filled", &self.num_filled)
            .field("num_inserted", &self.num_inserted)
            .finish()
    }
}

fn buckets_size(num_buckets: usize) -> usize {
    num_buckets * size_of::<Bucket>()
}

impl JoinHashTable {
    /// Creates a table for up to `num_rows` rows, charging `reservation`.
    /// Returns `Ok(None)` when the memory pool refuses the initial size.
    pub fn try_new(num_rows: usize, mut reservation: MemoryReservation) -> DFResult<Option<Self>> {
        if num_rows >= u32::MAX as usize {
            return Err(DataFusionError::Internal(format!(
                "Cannot index {num_rows} rows in a join hash table"
            )));
        }
        let num_buckets = (num_rows * 4 / 3 + 1)
            .next_power_of_two()
            .clamp(16, MAX_INITIAL_BUCKETS);
        let size = buckets_size(num_buckets) + num_rows * size_of::<u32>();
        if reservation.try_grow(size).is_err() {
            return Ok(None);
        }
        Ok(Some(Self {
            buckets: vec![Bucket::default(); num_buckets],
            next: vec![0; num_rows],
            num_filled: 0,
            num_inserted: 0,
            reservation,
        }))
    }

    /// Table with no rows, used for partitions whose rows are only scanned.
    pub fn empty(reservation: MemoryReservation) -> Self {
        Self {
            buckets: vec![],
            next: vec![],
            num_filled: 0,
            num_inserted: 0,
            reservation,
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Number of distinct hashes.
    pub fn num_filled(&self) -> usize {
        self.num_filled
    }

    pub fn num_inserted(&self) -> usize {
        self.num_inserted
    }

    pub fn memory_size(&self) -> usize {
        self.reservation.size()
    }

    #[inline]
    fn bucket_index(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    /// Position of the bucket holding `hash`, or of the empty bucket it
    /// would go to.
    #[inline]
    fn probe(&self, hash: u32) -> usize {
        let mask = self.buckets.len() - 1;
        let mut idx = self.bucket_index(hash);
        loop {
            let bucket = &self.buckets[idx];
            if bucket.head == 0 || bucket.hash == hash {
                return idx;
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Hints the CPU to load the bucket `hash` maps to.
    #[inline]
    pub fn prefetch_bucket(&self, hash: u32) {
        if self.buckets.is_empty() {
            return;
        }
        let bucket = &self.buckets[self.bucket_index(hash)];
        prefetch_read(bucket as *const Bucket as *const u8);
    }

    /// Inserts build row `row` under `hash`. Returns false when the table
    /// has to grow and the memory pool refuses.
    pub fn insert(&mut self, hash: u32, row: usize) -> bool {
        if self.buckets.is_empty() {
            return false;
        }
        let mut idx = self.probe(hash);
        if self.buckets[idx].head == 0 {
            if (self.num_filled + 1) * 4 > self.buckets.len() * 3 {
                if !self.grow() {
                    return false;
                }
                idx = self.probe(hash);
            }
            self.num_filled += 1;
            self.buckets[idx].hash = hash;
        }
        let bucket = &mut self.buckets[idx];
        self.next[row] = bucket.head;
        bucket.head = row as u32 + 1;
        self.num_inserted += 1;
        true
    }

    fn grow(&mut self) -> bool {
        let new_len = self.buckets.len() * 2;
        if self.reservation.try_grow(buckets_size(new_len)).is_err() {
            return false;
        }
        let old = std::mem::replace(&mut self.buckets, vec![Bucket::default(); new_len]);
        for bucket in old.iter().filter(|b| b.head != 0) {
            let idx = self.probe(bucket.hash);
            self.buckets[idx] = *bucket;
        }
        self.reservation.shrink(buckets_size(old.len()));
        true
    }

    /// Build rows inserted under `hash`, most recent first.
    pub fn find(&self, hash: u32) -> HashChain<'_> {
        let head = if self.buckets.is_empty() {
            0
        } else {
            self.buckets[self.probe(hash)].head
        };
        HashChain {
            next: &self.next,
            cur: head,
        }
    }
}

pub struct HashChain<'a> {
    next: &'a [u32],
    cur: u32,
}

impl Iterator for HashChain<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == 0 {
            return None;
        }
        let row = self.cur as usize - 1;
        self.cur = self.next[row];
        Some(row)
    }
}

#[inline]
fn prefetch_read(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetching is a hint and never faults, even on invalid addresses.
    unsafe {
        use core::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch(ptr as *const i8, _MM_HINT_T0);
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: as above, `prfm` has no architectural side effects.
    unsafe {
        core::arch::asm!(
            "prfm pldl1keep, [{0}]",
            in(reg) ptr,
            options(nostack, preserves_flags)
        );
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    let _ = ptr;
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::execution::memory_pool::{
        GreedyMemoryPool, MemoryConsumer, MemoryPool, UnboundedMemoryPool,
    };
    use std::sync::Arc;

    fn reservation(pool: &Arc<dyn MemoryPool>) -> MemoryReservation {
        MemoryConsumer::new("hash table").register(pool)
    }

    #[test]
    fn test_insert_and_find_chains() -> DFResult<()> {
        let pool: Arc<dyn MemoryPool> = Arc::new(UnboundedMemoryPool::default());
        let mut table = JoinHashTable::try_new(6, reservation(&pool))?.unwrap();
        for (row, hash) in [10u32, 20, 10, 30, 10, 20].into_iter().enumerate() {
            assert!(table.insert(hash, row));
        }
        assert_eq!(table.num_filled(), 3);
        assert_eq!(table.num_inserted(), 6);
        assert_eq!(table.find(10).collect::<Vec<_>>(), vec![4, 2, 0]);
        assert_eq!(table.find(20).collect::<Vec<_>>(), vec![5, 1]);
        assert_eq!(table.find(30).collect::<Vec<_>>(), vec![3]);
        assert_eq!(table.find(40).count(), 0);
        Ok(())
    }

    #[test]
    fn test_colliding_buckets_and_growth() -> DFResult<()> {
        let pool: Arc<dyn MemoryPool> = Arc::new(UnboundedMemoryPool::default());
        let num_rows = 5000;
        let mut table = JoinHashTable::try_new(num_rows, reservation(&pool))?.unwrap();
        let initial_buckets = table.num_buckets();
        // every hash lands in bucket 0 of the initial table
        let hash_of = |row: usize| (row as u32 % 2500) << 16;
        for row in 0..num_rows {
            assert!(table.insert(hash_of(row), row));
        }
        assert!(table.num_buckets() > initial_buckets);
        assert!(table.num_filled() * 4 <= table.num_buckets() * 3);
        for key in 0..2500 {
            let rows: Vec<_> = table.find(hash_of(key)).collect();
            assert_eq!(rows, vec![key + 2500, key]);
        }
        assert_eq!(pool.reserved(), table.memory_size());
        Ok(())
    }

    #[test]
    fn test_insert_fails_when_growth_is_refused() -> DFResult<()> {
        let initial = buckets_size(MAX_INITIAL_BUCKETS) + 4000 * size_of::<u32>();
        let pool: Arc<dyn MemoryPool> = Arc::new(GreedyMemoryPool::new(initial + 100));
        let mut table = JoinHashTable::try_new(4000, reservation(&pool))?.unwrap();
        let mut refused = false;
        for row in 0..4000 {
            if !table.insert(row as u32, row) {
                refused = true;
                break;
            }
        }
        assert!(refused);
        assert_eq!(table.num_inserted(), MAX_INITIAL_BUCKETS * 3 / 4);
        Ok(())
    }

    #[test]
    fn test_initial_reservation_refused() -> DFResult<()> {
        let pool: Arc<dyn MemoryPool> = Arc::new(GreedyMemoryPool::new(64));
        assert!(JoinHashTable::try_new(100, reservation(&pool))?.is_none());
        assert_eq!(pool.reserved(), 0);
        Ok(())
    }

    #[test]
    fn test_prefetch_has_no_effect_on_contents() -> DFResult<()> {
        let pool: Arc<dyn MemoryPool> = Arc::new(UnboundedMemoryPool::default());
        let mut plain = JoinHashTable::try_new(300, reservation(&pool))?.unwrap();
        let mut prefetched = JoinHashTable::try_new(300, reservation(&pool))?.unwrap();
        let hashes: Vec<u32> = (0..300u32).map(|i| i.wrapping_mul(2654435761) % 97).collect();
        for (row, hash) in hashes.iter().enumerate() {
            assert!(plain.insert(*hash, row));
        }
        for chunk_start in (0..300).step_by(32) {
            let chunk = &hashes[chunk_start..(chunk_start + 32).min(300)];
            chunk.iter().for_each(|h| prefetched.prefetch_bucket(*h));
            for (i, hash) in chunk.iter().enumerate() {
                assert!(prefetched.insert(*hash, chunk_start + i));
            }
        }
        assert_eq!(plain.buckets, prefetched.buckets);
        assert_eq!(plain.next, prefetched.next);
        Ok(())
    }

    #[test]
    fn test_empty_table() {
        let pool: Arc<dyn MemoryPool> = Arc::new(UnboundedMemoryPool::default());
        let mut table = JoinHashTable::empty(reservation(&pool));
        table.prefetch_bucket(1);
        assert_eq!(table.find(1).count(), 0);
        assert!(!table.insert(1, 0));
    }
}
