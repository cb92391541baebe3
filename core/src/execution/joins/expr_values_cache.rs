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

//! Per-group cache of join-key hashes and null flags.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{DataType, Float32Type, Float64Type};
use arrow::record_batch::RecordBatch;
use datafusion::common::{DataFusionError, Result as DFResult};
use datafusion::physical_expr::PhysicalExpr;
use hashjoin_build_expr::create_murmur3_hashes;

use super::JOIN_KEY_HASH_SEED;

/// Evaluates `exprs` against `batch`, materializing scalars to full columns.
pub fn evaluate_exprs(
    batch: &RecordBatch,
    exprs: &[Arc<dyn PhysicalExpr>],
) -> DFResult<Vec<ArrayRef>> {
    exprs
        .iter()
        .map(|expr| expr.evaluate(batch)?.into_array(batch.num_rows()))
        .collect()
}

/// Rewrites -0.0 to 0.0 in float key columns before they are encoded for
/// equality. The join-key hash already treats both zeros as one value, the
/// row format does not.
pub fn normalize_float_keys(key_columns: &[ArrayRef]) -> Vec<ArrayRef> {
    key_columns
        .iter()
        .map(|column| -> ArrayRef {
            match column.data_type() {
                DataType::Float32 => Arc::new(
                    column
                        .as_primitive::<Float32Type>()
                        .unary::<_, Float32Type>(|v| if v == 0.0 { 0.0 } else { v }),
                ),
                DataType::Float64 => Arc::new(
                    column
                        .as_primitive::<Float64Type>()
                        .unary::<_, Float64Type>(|v| if v == 0.0 { 0.0 } else { v }),
                ),
                _ => Arc::clone(column),
            }
        })
        .collect()
}

/// Holds the combined 32-bit join-key hash and null flag of up to `capacity`
/// consecutive rows. The buffers are allocated once and reused by every
/// group, so a group's values stay cache resident between the prefetch pass
/// and the insert pass over it.
///
/// Reading is cursor based:
///
/// ```text
/// cache.hash_group(&keys, offset, len)?;
/// cache.reset_for_read();
/// while !cache.at_end() {
///     let hash = cache.cur_hash();
///     ...
///     cache.next_row();
/// }
/// ```
#[derive(Debug)]
pub struct ExprValuesCache {
    capacity: usize,
    hashes: Vec<u32>,
    nulls: Vec<bool>,
    num_rows: usize,
    cur_row: usize,
}

impl ExprValuesCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            hashes: vec![0; capacity],
            nulls: vec![false; capacity],
            num_rows: 0,
            cur_row: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of rows in the current group.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Replaces the cached group with rows `offset..offset + len` of
    /// `key_columns` and rewinds the cursor.
    pub fn hash_group(
        &mut self,
        key_columns: &[ArrayRef],
        offset: usize,
        len: usize,
    ) -> DFResult<()> {
        if len > self.capacity {
            return Err(DataFusionError::Internal(format!(
                "Group of {len} rows exceeds expression value cache capacity {}",
                self.capacity
            )));
        }
        let sliced: Vec<ArrayRef> = key_columns.iter().map(|c| c.slice(offset, len)).collect();

        let hashes = &mut self.hashes[..len];
        hashes.fill(JOIN_KEY_HASH_SEED);
        create_murmur3_hashes(&sliced, hashes)?;

        let nulls = &mut self.nulls[..len];
        nulls.fill(false);
        for column in &sliced {
            if let Some(column_nulls) = column.logical_nulls() {
                for (i, is_null) in nulls.iter_mut().enumerate() {
                    *is_null |= column_nulls.is_null(i);
                }
            }
        }

        self.num_rows = len;
        self.cur_row = 0;
        Ok(())
    }

    /// Rewinds the cursor to the first row of the group.
    pub fn reset_for_read(&mut self) {
        self.cur_row = 0;
    }

    pub fn at_end(&self) -> bool {
        self.cur_row >= self.num_rows
    }

    pub fn next_row(&mut self) {
        self.cur_row += 1;
    }

    /// Offset of the cursor within the group.
    pub fn cur_row(&self) -> usize {
        self.cur_row
    }

    pub fn cur_hash(&self) -> u32 {
        self.hashes[self.cur_row]
    }

    /// True when any join key of the current row is null.
    pub fn is_row_null(&self) -> bool {
        self.nulls[self.cur_row]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use datafusion::physical_expr::expressions::{col, lit};

    fn key_columns() -> Vec<ArrayRef> {
        vec![
            Arc::new(Int32Array::from(vec![Some(1), None, Some(3), Some(1)])),
            Arc::new(StringArray::from(vec![Some("a"), Some("b"), None, Some("a")])),
        ]
    }

    #[test]
    fn test_hash_group_and_rescan() -> DFResult<()> {
        let keys = key_columns();
        let mut cache = ExprValuesCache::new(8);
        cache.hash_group(&keys, 0, 4)?;
        assert_eq!(cache.num_rows(), 4);

        let mut first_pass = vec![];
        while !cache.at_end() {
            first_pass.push((cache.cur_hash(), cache.is_row_null()));
            cache.next_row();
        }
        assert_eq!(
            first_pass.iter().map(|(_, null)| *null).collect::<Vec<_>>(),
            vec![false, true, true, false]
        );
        // equal keys hash equally
        assert_eq!(first_pass[0].0, first_pass[3].0);

        cache.reset_for_read();
        let mut second_pass = vec![];
        while !cache.at_end() {
            second_pass.push((cache.cur_hash(), cache.is_row_null()));
            cache.next_row();
        }
        assert_eq!(first_pass, second_pass);
        Ok(())
    }

    #[test]
    fn test_group_offsets_match_whole_batch() -> DFResult<()> {
        let keys = key_columns();
        let mut whole = ExprValuesCache::new(4);
        whole.hash_group(&keys, 0, 4)?;
        whole.reset_for_read();
        whole.next_row();
        whole.next_row();
        whole.next_row();
        let last_hash = whole.cur_hash();

        let mut partial = ExprValuesCache::new(2);
        partial.hash_group(&keys, 2, 2)?;
        partial.next_row();
        assert_eq!(partial.cur_row(), 1);
        assert_eq!(partial.cur_hash(), last_hash);
        Ok(())
    }

    #[test]
    fn test_negative_zero_keys_normalized() {
        let keys: Vec<ArrayRef> = vec![
            Arc::new(Float64Array::from(vec![Some(-0.0), None, Some(-1.5), Some(0.0)])),
            Arc::new(Int32Array::from(vec![1, 2, 3, 4])),
        ];
        let normalized = normalize_float_keys(&keys);
        let floats = normalized[0].as_primitive::<Float64Type>();
        assert!(floats.value(0).is_sign_positive());
        assert!(floats.is_null(1));
        assert_eq!(floats.value(2), -1.5);
        assert!(floats.value(3).is_sign_positive());
        assert!(Arc::ptr_eq(&normalized[1], &keys[1]));
    }

    #[test]
    fn test_group_larger_than_capacity() {
        let keys = key_columns();
        let mut cache = ExprValuesCache::new(2);
        assert!(cache.hash_group(&keys, 0, 3).is_err());
    }

    #[test]
    fn test_evaluate_exprs_expands_scalars() -> DFResult<()> {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, true)]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
        )?;
        let columns = evaluate_exprs(&batch, &[col("a", &schema)?, lit(7i32)])?;
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[1].len(), 3);
        Ok(())
    }
}
