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

use std::fmt;
use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch};
use arrow::compute::concat_batches;
use arrow::row::Rows;
use datafusion::common::{DataFusionError, Result as DFResult};
use datafusion::execution::memory_pool::{MemoryConsumer, MemoryPool, MemoryReservation};
use log::debug;

use super::builder::BuildContext;
use super::config::PrefetchMode;
use super::expr_values_cache::{evaluate_exprs, normalize_float_keys, ExprValuesCache};
use super::hash_table::JoinHashTable;
use super::row_stream::SpillableRowStream;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PartitionState {
    Accumulating,
    InMemory,
    Spilled,
    Closed,
}

/// Rows of a partition that fit in memory, with the hash table over them.
pub struct InMemoryPartition {
    batch: RecordBatch,
    /// Join keys in row format, for exact key comparison while probing.
    key_rows: Rows,
    hash_table: JoinHashTable,
    reservation: MemoryReservation,
}

impl fmt::Debug for InMemoryPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryPartition")
            .field("num_rows", &self.batch.num_rows())
            .field("hash_table", &self.hash_table)
            .finish()
    }
}

impl InMemoryPartition {
    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn key_rows(&self) -> &Rows {
        &self.key_rows
    }

    pub fn hash_table(&self) -> &JoinHashTable {
        &self.hash_table
    }

    pub fn memory_size(&self) -> usize {
        self.reservation.size() + self.hash_table.memory_size()
    }
}

enum Payload {
    Accumulating(SpillableRowStream),
    InMemory(InMemoryPartition),
    Spilled(SpillableRowStream),
    Closed,
}

/// Terminal outcome of a partition after finalize.
pub(crate) enum Finalized {
    InMemory(InMemoryPartition),
    Spilled(SpillableRowStream),
}

/// One hash bucket of the build side at some level.
pub struct Partition {
    index: usize,
    level: usize,
    null_aware: bool,
    payload: Payload,
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("index", &self.index)
            .field("level", &self.level)
            .field("null_aware", &self.null_aware)
            .field("state", &self.state())
            .field("num_rows", &self.num_rows())
            .finish()
    }
}

impl Partition {
    pub fn new(index: usize, level: usize, null_aware: bool, stream: SpillableRowStream) -> Self {
        Self {
            index,
            level,
            null_aware,
            payload: Payload::Accumulating(stream),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn is_null_aware(&self) -> bool {
        self.null_aware
    }

    pub fn state(&self) -> PartitionState {
        match self.payload {
            Payload::Accumulating(_) => PartitionState::Accumulating,
            Payload::InMemory(_) => PartitionState::InMemory,
            Payload::Spilled(_) => PartitionState::Spilled,
            Payload::Closed => PartitionState::Closed,
        }
    }

    pub fn num_rows(&self) -> usize {
        match &self.payload {
            Payload::Accumulating(stream) | Payload::Spilled(stream) => stream.num_rows(),
            Payload::InMemory(partition) => partition.num_rows(),
            Payload::Closed => 0,
        }
    }

    pub fn bytes_in_memory(&self) -> usize {
        match &self.payload {
            Payload::Accumulating(stream) | Payload::Spilled(stream) => stream.bytes_in_memory(),
            Payload::InMemory(partition) => partition.memory_size(),
            Payload::Closed => 0,
        }
    }

    pub fn hash_table(&self) -> Option<&JoinHashTable> {
        match &self.payload {
            Payload::InMemory(partition) => Some(&partition.hash_table),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        if self.null_aware {
            format!("null-aware partition at level {}", self.level)
        } else {
            format!("partition {} at level {}", self.index, self.level)
        }
    }

    /// The row stream of an accumulating or spilled partition.
    pub fn stream(&self) -> Option<&SpillableRowStream> {
        match &self.payload {
            Payload::Accumulating(stream) | Payload::Spilled(stream) => Some(stream),
            _ => None,
        }
    }

    /// The row stream of a partition still accepting rows.
    pub fn stream_mut(&mut self) -> DFResult<&mut SpillableRowStream> {
        if !matches!(self.payload, Payload::Accumulating(_)) {
            return Err(DataFusionError::Internal(format!(
                "Cannot append to {} in state {:?}",
                self.describe(),
                self.state()
            )));
        }
        match &mut self.payload {
            Payload::Accumulating(stream) => Ok(stream),
            _ => Err(DataFusionError::Internal("Partition stopped accumulating".to_string())),
        }
    }

    /// Writes the in-memory pages of an accumulating partition to disk,
    /// returning the number of bytes written.
    pub fn spill(&mut self) -> DFResult<usize> {
        let stream = self.stream_mut()?;
        let before = stream.bytes_spilled();
        stream.unpin_stream()?;
        Ok(stream.bytes_spilled() - before)
    }

    /// Builds the hash table of an accumulating partition. Returns
    /// `Ok(false)` when the rows or the table do not fit in memory; the
    /// partition is then Spilled with its stream unpinned.
    ///
    /// `pool` is the memory budget shared with the partitions finalizing
    /// concurrently.
    pub fn finalize(
        &mut self,
        context: &BuildContext,
        pool: &Arc<dyn MemoryPool>,
    ) -> DFResult<bool> {
        let mut stream = match std::mem::replace(&mut self.payload, Payload::Closed) {
            Payload::Accumulating(stream) => stream,
            other => {
                self.payload = other;
                return Err(DataFusionError::Internal(format!(
                    "Cannot finalize {} in state {:?}",
                    self.describe(),
                    self.state()
                )));
            }
        };
        match self.build_in_memory(&mut stream, context, pool)? {
            Some(partition) => {
                debug!(
                    "Finalized {} in memory: {} rows, {} bytes",
                    self.describe(),
                    partition.num_rows(),
                    partition.memory_size()
                );
                stream.close();
                self.payload = Payload::InMemory(partition);
                Ok(true)
            }
            None => {
                let spilled_before = stream.bytes_spilled();
                stream.unpin_stream()?;
                let spilled = stream.bytes_spilled() - spilled_before;
                if spilled > 0 {
                    context.metrics().spill_count.add(1);
                    context.metrics().spilled_bytes.add(spilled);
                }
                debug!(
                    "{} does not fit in memory: {} rows, {} bytes",
                    self.describe(),
                    stream.num_rows(),
                    stream.byte_size()
                );
                self.payload = Payload::Spilled(stream);
                Ok(false)
            }
        }
    }

    fn build_in_memory(
        &self,
        stream: &mut SpillableRowStream,
        context: &BuildContext,
        pool: &Arc<dyn MemoryPool>,
    ) -> DFResult<Option<InMemoryPartition>> {
        let config = context.config();
        if config.max_partition_bytes > 0 && stream.byte_size() > config.max_partition_bytes {
            return Ok(None);
        }
        if !stream.pin_stream()? {
            return Ok(None);
        }

        let mut reservation =
            MemoryConsumer::new(format!("{} rows", stream.name())).register(pool);
        let batch = concat_batches(stream.schema(), &stream.read_pinned()?)?;
        if reservation.try_grow(batch.get_array_memory_size()).is_err() {
            return Ok(None);
        }
        let key_columns = evaluate_exprs(&batch, context.key_exprs())?;
        let key_rows = context
            .key_converter()
            .convert_columns(&normalize_float_keys(&key_columns))?;
        if reservation.try_grow(key_rows.size()).is_err() {
            return Ok(None);
        }

        let table_reservation =
            MemoryConsumer::new(format!("{} hash table", stream.name())).register(pool);
        let hash_table = if self.null_aware {
            JoinHashTable::empty(table_reservation)
        } else {
            let Some(mut hash_table) = JoinHashTable::try_new(batch.num_rows(), table_reservation)?
            else {
                return Ok(None);
            };
            let mut cache = ExprValuesCache::new(config.expr_cache_capacity);
            if !insert_rows(
                &mut hash_table,
                &key_columns,
                batch.num_rows(),
                &mut cache,
                config.prefetch_mode,
            )? {
                return Ok(None);
            }
            hash_table
        };
        Ok(Some(InMemoryPartition {
            batch,
            key_rows,
            hash_table,
            reservation,
        }))
    }

    pub(crate) fn into_finalized(self) -> DFResult<Finalized> {
        match self.payload {
            Payload::InMemory(partition) => Ok(Finalized::InMemory(partition)),
            Payload::Spilled(stream) => Ok(Finalized::Spilled(stream)),
            Payload::Accumulating(_) | Payload::Closed => Err(DataFusionError::Internal(format!(
                "{} has not been finalized",
                self.describe()
            ))),
        }
    }

    /// Releases the stream, the hash table and any spill file.
    pub fn close(&mut self) {
        if let Payload::Accumulating(stream) | Payload::Spilled(stream) =
            std::mem::replace(&mut self.payload, Payload::Closed)
        {
            stream.close();
        }
    }
}

/// Inserts rows `0..num_rows` into `hash_table` one cache group at a time:
/// the first pass over a group prefetches the buckets its hashes map to and
/// the second inserts. Rows with a null key are skipped. Returns false when
/// the table cannot grow.
pub(crate) fn insert_rows(
    hash_table: &mut JoinHashTable,
    key_columns: &[ArrayRef],
    num_rows: usize,
    cache: &mut ExprValuesCache,
    prefetch_mode: PrefetchMode,
) -> DFResult<bool> {
    let mut offset = 0;
    while offset < num_rows {
        let len = cache.capacity().min(num_rows - offset);
        cache.hash_group(key_columns, offset, len)?;
        if prefetch_mode == PrefetchMode::HtBucket {
            while !cache.at_end() {
                if !cache.is_row_null() {
                    hash_table.prefetch_bucket(cache.cur_hash());
                }
                cache.next_row();
            }
            cache.reset_for_read();
        }
        while !cache.at_end() {
            if !cache.is_row_null()
                && !hash_table.insert(cache.cur_hash(), offset + cache.cur_row())
            {
                return Ok(false);
            }
            cache.next_row();
        }
        offset += len;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::joins::BuildConfig;
    use arrow::array::{Int32Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
    use datafusion::execution::memory_pool::{GreedyMemoryPool, UnboundedMemoryPool};
    use datafusion::execution::runtime_env::{RuntimeEnv, RuntimeEnvBuilder};
    use datafusion::physical_expr::expressions::col;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("key", DataType::Int32, true),
            Field::new("value", DataType::Int64, false),
        ]))
    }

    fn make_batch(count: usize, distinct: i32) -> RecordBatch {
        let keys: Vec<i32> = (0..count as i32).map(|i| i % distinct).collect();
        let values: Vec<i64> = (0..count as i64).collect();
        RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int32Array::from(keys)),
                Arc::new(Int64Array::from(values)),
            ],
        )
        .unwrap()
    }

    fn context(runtime: &Arc<RuntimeEnv>, config: BuildConfig) -> DFResult<BuildContext> {
        let schema = test_schema();
        let key = col("key", &schema)?;
        BuildContext::try_new(schema, vec![key], config, Arc::clone(runtime))
    }

    fn accumulate(context: &BuildContext, batch: &RecordBatch) -> DFResult<Partition> {
        let stream = context.new_row_stream("test partition");
        let mut partition = Partition::new(0, 0, false, stream);
        let rows = context.row_converter().convert_columns(batch.columns())?;
        let stream = partition.stream_mut()?;
        for row in rows.iter() {
            if !stream.add_row(row.as_ref()) {
                assert!(stream.add_row_slow(row.as_ref())?);
            }
        }
        Ok(partition)
    }

    #[test]
    fn test_finalize_in_memory() -> DFResult<()> {
        let runtime = RuntimeEnvBuilder::new()
            .with_memory_pool(Arc::new(UnboundedMemoryPool::default()))
            .build_arc()?;
        let context = context(&runtime, BuildConfig::default())?;
        let batch = make_batch(1000, 10);
        let mut partition = accumulate(&context, &batch)?;
        assert_eq!(partition.state(), PartitionState::Accumulating);
        assert!(partition.hash_table().is_none());

        assert!(partition.finalize(&context, &runtime.memory_pool)?);
        assert_eq!(partition.state(), PartitionState::InMemory);
        let table = partition.hash_table().unwrap();
        assert_eq!(table.num_inserted(), 1000);
        assert_eq!(table.num_filled(), 10);
        let err = partition.stream_mut().unwrap_err();
        assert!(err.to_string().contains("Cannot append to partition 0 at level 0"));
        assert!(partition.finalize(&context, &runtime.memory_pool).is_err());

        let Finalized::InMemory(in_memory) = partition.into_finalized()? else {
            panic!("expected an in-memory partition");
        };
        assert_eq!(in_memory.batch(), &batch);
        assert_eq!(in_memory.key_rows().num_rows(), 1000);
        Ok(())
    }

    #[test]
    fn test_finalize_fails_when_rows_do_not_fit() -> DFResult<()> {
        // 1000 rows of 14 bytes take 4 pages of 4 KiB; decoding them needs
        // another 12 KB which the pool does not have
        let runtime = RuntimeEnvBuilder::new()
            .with_memory_pool(Arc::new(GreedyMemoryPool::new(20 * 1024)))
            .build_arc()?;
        let config = BuildConfig {
            page_size: 4096,
            ..BuildConfig::default()
        };
        let context = context(&runtime, config)?;
        let mut partition = accumulate(&context, &make_batch(1000, 1000))?;
        assert_eq!(partition.bytes_in_memory(), 4 * 4096);

        assert!(!partition.finalize(&context, &runtime.memory_pool)?);
        assert_eq!(partition.state(), PartitionState::Spilled);
        assert!(partition.hash_table().is_none());
        assert_eq!(partition.num_rows(), 1000);
        assert_eq!(runtime.memory_pool.reserved(), 0);
        assert_eq!(context.metrics().spill_count.value(), 1);
        assert_eq!(context.metrics().spilled_bytes.value(), 14 * 1000);

        let Finalized::Spilled(stream) = partition.into_finalized()? else {
            panic!("expected a spilled partition");
        };
        let rows: usize = stream
            .into_reader()?
            .map(|batch| batch.map(|b| b.num_rows()))
            .sum::<DFResult<usize>>()?;
        assert_eq!(rows, 1000);
        Ok(())
    }

    #[test]
    fn test_finalize_respects_max_partition_bytes() -> DFResult<()> {
        let runtime = RuntimeEnvBuilder::new().build_arc()?;
        let config = BuildConfig {
            max_partition_bytes: 1000,
            ..BuildConfig::default()
        };
        let context = context(&runtime, config)?;
        let mut partition = accumulate(&context, &make_batch(100, 5))?;
        assert!(!partition.finalize(&context, &runtime.memory_pool)?);
        assert_eq!(partition.state(), PartitionState::Spilled);
        Ok(())
    }

    #[test]
    fn test_null_aware_partition_has_empty_table() -> DFResult<()> {
        let runtime = RuntimeEnvBuilder::new().build_arc()?;
        let context = context(&runtime, BuildConfig::default())?;
        let batch = RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int32Array::from(vec![None, None, None])),
                Arc::new(Int64Array::from(vec![1, 2, 3])),
            ],
        )?;
        let stream = context.new_row_stream("null-aware");
        let mut partition = Partition::new(0, 0, true, stream);
        let rows = context.row_converter().convert_columns(batch.columns())?;
        for row in rows.iter() {
            let stream = partition.stream_mut()?;
            if !stream.add_row(row.as_ref()) {
                assert!(stream.add_row_slow(row.as_ref())?);
            }
        }
        assert!(partition.finalize(&context, &runtime.memory_pool)?);
        assert_eq!(partition.num_rows(), 3);
        assert_eq!(partition.hash_table().unwrap().num_inserted(), 0);
        Ok(())
    }

    #[test]
    fn test_prefetch_insert_matches_naive_insert() -> DFResult<()> {
        let pool: Arc<dyn MemoryPool> = Arc::new(UnboundedMemoryPool::default());
        let batch = make_batch(5000, 700);
        let schema = test_schema();
        let key_columns = evaluate_exprs(&batch, &[col("key", &schema)?])?;

        let mut naive =
            JoinHashTable::try_new(5000, MemoryConsumer::new("naive").register(&pool))?.unwrap();
        let mut naive_cache = ExprValuesCache::new(5000);
        naive_cache.hash_group(&key_columns, 0, 5000)?;
        let mut hashes = Vec::with_capacity(5000);
        while !naive_cache.at_end() {
            hashes.push(naive_cache.cur_hash());
            assert!(naive.insert(naive_cache.cur_hash(), naive_cache.cur_row()));
            naive_cache.next_row();
        }

        for (group_size, mode) in [
            (1, PrefetchMode::HtBucket),
            (7, PrefetchMode::HtBucket),
            (1024, PrefetchMode::HtBucket),
            (1024, PrefetchMode::None),
        ] {
            let mut table =
                JoinHashTable::try_new(5000, MemoryConsumer::new("grouped").register(&pool))?
                    .unwrap();
            let mut cache = ExprValuesCache::new(group_size);
            assert!(insert_rows(&mut table, &key_columns, 5000, &mut cache, mode)?);
            assert_eq!(table.num_filled(), naive.num_filled());
            // rows 0..700 hold every distinct key
            for hash in &hashes[..700] {
                assert_eq!(
                    table.find(*hash).collect::<Vec<_>>(),
                    naive.find(*hash).collect::<Vec<_>>()
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_close_releases_memory() -> DFResult<()> {
        let runtime = RuntimeEnvBuilder::new().build_arc()?;
        let context = context(&runtime, BuildConfig::default())?;
        let mut partition = accumulate(&context, &make_batch(100, 5))?;
        partition.spill()?;
        partition.close();
        assert_eq!(partition.state(), PartitionState::Closed);
        assert_eq!(runtime.memory_pool.reserved(), 0);
        Ok(())
    }
}
