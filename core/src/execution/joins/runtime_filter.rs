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

//! Bloom filters over build-side values for pruning the probe side.

use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray};
use datafusion::common::Result as DFResult;
use datafusion::execution::memory_pool::{MemoryConsumer, MemoryPool, MemoryReservation};
use datafusion::physical_expr::PhysicalExpr;
use hashjoin_build_expr::{create_murmur3_hashes, BloomFilter};
use log::{debug, warn};

use super::RUNTIME_FILTER_HASH_SEED;

/// A filter to populate from the build side.
#[derive(Debug, Clone)]
pub struct RuntimeFilterDesc {
    pub filter_id: usize,
    /// Probe-side expression the exported filter is applied to.
    pub target: Arc<dyn PhysicalExpr>,
    /// Build-side expression whose values are inserted.
    pub source_expr: Arc<dyn PhysicalExpr>,
    /// Expected number of distinct build values, used for sizing.
    pub expected_items: usize,
}

/// Hashes every value of `values` the way filter members are hashed.
pub(crate) fn hash_filter_values(values: &ArrayRef, hashes: &mut Vec<u32>) -> DFResult<()> {
    hashes.clear();
    hashes.resize(values.len(), RUNTIME_FILTER_HASH_SEED);
    create_murmur3_hashes(std::slice::from_ref(values), hashes)?;
    Ok(())
}

/// A filter being populated. The bloom filter is absent once disabled, and
/// inserting into a disabled filter does nothing.
pub(crate) struct RuntimeFilter {
    desc: RuntimeFilterDesc,
    bloom: Option<BloomFilter>,
    num_inserted: usize,
    reservation: MemoryReservation,
}

impl RuntimeFilter {
    /// Sizes the bloom filter for `desc.expected_items`; the filter starts
    /// disabled when that exceeds `max_bytes` or the pool refuses it.
    pub(crate) fn new(
        desc: RuntimeFilterDesc,
        max_bytes: usize,
        fpp: f64,
        pool: &Arc<dyn MemoryPool>,
    ) -> Self {
        let mut reservation =
            MemoryConsumer::new(format!("RuntimeFilter[{}]", desc.filter_id)).register(pool);
        let expected_items = desc.expected_items.max(1);
        let byte_size = BloomFilter::estimated_byte_size(expected_items, fpp);
        let bloom = if byte_size > max_bytes {
            warn!(
                "Runtime filter {} disabled: {} bytes for {} items exceeds the {} byte limit",
                desc.filter_id, byte_size, expected_items, max_bytes
            );
            None
        } else if let Err(e) = reservation.try_grow(byte_size) {
            warn!(
                "Runtime filter {} disabled: cannot reserve {} bytes: {}",
                desc.filter_id, byte_size, e
            );
            None
        } else {
            Some(BloomFilter::with_expected_items(expected_items, fpp))
        };
        Self {
            desc,
            bloom,
            num_inserted: 0,
            reservation,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.bloom.is_some()
    }

    pub(crate) fn source_expr(&self) -> &Arc<dyn PhysicalExpr> {
        &self.desc.source_expr
    }

    #[inline]
    pub(crate) fn insert(&mut self, hash: u32) {
        if let Some(bloom) = self.bloom.as_mut() {
            bloom.insert_hash(hash);
            self.num_inserted += 1;
        }
    }

    pub(crate) fn disable(&mut self) {
        self.bloom = None;
        self.reservation.free();
    }

    /// `None` for a disabled filter.
    pub(crate) fn into_export(self) -> Option<RuntimeFilterExport> {
        let bloom = self.bloom?;
        debug!(
            "Runtime filter {} complete: {} inserts, {} bits set",
            self.desc.filter_id,
            self.num_inserted,
            bloom.cardinality()
        );
        Some(RuntimeFilterExport {
            filter_id: self.desc.filter_id,
            target: self.desc.target,
            bloom,
            num_inserted: self.num_inserted,
            _reservation: self.reservation,
        })
    }
}

/// A completed filter handed to the probe side. Immutable.
pub struct RuntimeFilterExport {
    pub filter_id: usize,
    pub target: Arc<dyn PhysicalExpr>,
    bloom: BloomFilter,
    num_inserted: usize,
    _reservation: MemoryReservation,
}

impl fmt::Debug for RuntimeFilterExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeFilterExport")
            .field("filter_id", &self.filter_id)
            .field("target", &self.target)
            .field("byte_size", &self.bloom.byte_size())
            .field("num_inserted", &self.num_inserted)
            .finish()
    }
}

impl RuntimeFilterExport {
    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    /// Number of build values inserted while the filter was populated.
    pub fn num_inserted(&self) -> usize {
        self.num_inserted
    }

    /// False where a probe value cannot be on the build side. Null values
    /// never match.
    pub fn might_contain(&self, values: &ArrayRef) -> DFResult<BooleanArray> {
        let mut hashes = Vec::new();
        hash_filter_values(values, &mut hashes)?;
        let nulls = values.logical_nulls();
        Ok(hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                let valid = nulls.as_ref().is_none_or(|n| n.is_valid(i));
                Some(valid && self.bloom.might_contain_hash(*hash))
            })
            .collect())
    }

    /// Spark's binary bloom filter format, for shipping to remote fragments.
    pub fn serialize(&self) -> Vec<u8> {
        self.bloom.serialize()
    }
}
