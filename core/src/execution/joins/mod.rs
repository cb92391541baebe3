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

//! Partitioned hash join build side.
//!
//! Rows are routed on the top `B` bits of their 32-bit join-key hash. A
//! partition that does not fit in memory is repartitioned on the next `B`
//! bits, so a partition is identified by its level and the hash prefix of
//! all bits consumed up to that level.

mod builder;
mod config;
mod expr_values_cache;
mod hash_table;
mod metrics;
mod partition;
mod repartition;
mod row_stream;
mod runtime_filter;

use std::fmt;

pub use builder::{BuildContext, FinalizedLevel, HashJoinBuilder};
pub use config::{BuildConfig, PrefetchMode};
pub use expr_values_cache::{evaluate_exprs, normalize_float_keys, ExprValuesCache};
pub use hash_table::{HashChain, JoinHashTable};
pub use metrics::BuildMetrics;
pub use partition::{InMemoryPartition, Partition, PartitionState};
pub use repartition::{
    build_hash_join, BuildCancellation, BuildStats, HashJoinBuildOutput, JoinMatch,
    NullAwareRows,
};
pub use row_stream::{RowStreamReader, SpillableRowStream};
pub use runtime_filter::{RuntimeFilterDesc, RuntimeFilterExport};

/// Seed of the join-key hash, shared by every level.
pub const JOIN_KEY_HASH_SEED: u32 = 42;

/// Seed of the hash of runtime filter values, shared by every filter.
pub const RUNTIME_FILTER_HASH_SEED: u32 = 0x5bd1_e995;

/// Partition of `hash` at `level`: the `bits` hash bits following the
/// `level * bits` top bits consumed by the levels above.
#[inline]
pub fn partition_index(hash: u32, level: usize, bits: u32) -> usize {
    let shifted = ((hash as u64) << (level as u64 * bits as u64)) & 0xFFFF_FFFF;
    (shifted >> (32 - bits)) as usize
}

/// Location of a partition in the repartitioning tree. `prefix` holds the
/// top `(level + 1) * B` bits shared by the hashes of all of its rows.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionPath {
    pub level: usize,
    pub prefix: u32,
}

impl PartitionPath {
    pub fn root(index: usize) -> Self {
        Self {
            level: 0,
            prefix: index as u32,
        }
    }

    pub fn child(&self, index: usize, bits: u32) -> Self {
        Self {
            level: self.level + 1,
            prefix: (self.prefix << bits) | index as u32,
        }
    }

    /// The partition at `level` that rows with `hash` are routed to.
    pub fn of_hash(hash: u32, level: usize, bits: u32) -> Self {
        let used = (level as u64 + 1) * bits as u64;
        Self {
            level,
            prefix: ((hash as u64) >> (32 - used)) as u32,
        }
    }
}

impl fmt::Display for PartitionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level {} prefix {:#x}", self.level, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_index_uses_top_bits() {
        let hash = 0b1011_0110_u32 << 24;
        assert_eq!(partition_index(hash, 0, 2), 0b10);
        assert_eq!(partition_index(hash, 1, 2), 0b11);
        assert_eq!(partition_index(hash, 2, 2), 0b01);
        assert_eq!(partition_index(hash, 3, 2), 0b10);
        assert_eq!(partition_index(u32::MAX, 0, 16), 0xFFFF);
        assert_eq!(partition_index(u32::MAX, 1, 16), 0xFFFF);
        assert_eq!(partition_index(0x8000_0000, 0, 1), 1);
        assert_eq!(partition_index(0x7FFF_FFFF, 0, 1), 0);
    }

    #[test]
    fn test_paths_follow_routing() {
        let bits = 4;
        for hash in [0u32, 1, 0xDEAD_BEEF, 0x1234_5678, u32::MAX] {
            let mut path = PartitionPath::root(partition_index(hash, 0, bits));
            assert_eq!(path, PartitionPath::of_hash(hash, 0, bits));
            for level in 1..8 {
                path = path.child(partition_index(hash, level, bits), bits);
                assert_eq!(path, PartitionPath::of_hash(hash, level, bits));
            }
            assert_eq!(path.prefix, hash);
        }
    }
}
