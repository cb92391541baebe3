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

//! Drives a build from the input stream to finalized partitions,
//! repartitioning spilled partitions level by level.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow::array::{Array, RecordBatch};
use datafusion::common::{DataFusionError, Result as DFResult};
use datafusion::execution::SendableRecordBatchStream;
use datafusion::physical_expr::PhysicalExpr;
use futures::StreamExt;
use log::info;

use super::builder::{BuildContext, FinalizedLevel, HashJoinBuilder};
use super::expr_values_cache::{evaluate_exprs, normalize_float_keys, ExprValuesCache};
use super::partition::InMemoryPartition;
use super::row_stream::SpillableRowStream;
use super::runtime_filter::RuntimeFilterExport;
use super::PartitionPath;

/// Cancels an in-flight build. Clones share the flag.
#[derive(Clone, Debug, Default)]
pub struct BuildCancellation(Arc<AtomicBool>);

impl BuildCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn check(&self) -> DFResult<()> {
        if self.is_cancelled() {
            Err(DataFusionError::Execution(
                "Hash join build cancelled".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

/// Build rows with a null join key, kept for null-aware joins. These are
/// scanned rather than probed, so a spilled set is not repartitioned.
#[derive(Debug)]
pub enum NullAwareRows {
    InMemory(InMemoryPartition),
    Spilled(SpillableRowStream),
}

impl NullAwareRows {
    pub fn num_rows(&self) -> usize {
        match self {
            NullAwareRows::InMemory(partition) => partition.num_rows(),
            NullAwareRows::Spilled(stream) => stream.num_rows(),
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, NullAwareRows::Spilled(_))
    }

    pub fn into_batches(self) -> DFResult<Vec<RecordBatch>> {
        match self {
            NullAwareRows::InMemory(partition) => Ok(vec![partition.batch().clone()]),
            NullAwareRows::Spilled(stream) => stream.into_reader()?.collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub input_rows: usize,
    pub null_key_rows: usize,
    pub in_memory_partitions: usize,
    /// Spilled partitions that were repartitioned.
    pub repartitions: usize,
    /// Deepest level holding an in-memory partition.
    pub max_level: usize,
}

/// A build row whose join key equals the key of a probe row.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JoinMatch {
    pub probe_row: usize,
    pub partition: PartitionPath,
    pub build_row: usize,
}

/// Finished build side. Every build row with a non-null key is held by
/// exactly one in-memory partition; nothing is mutated while probing.
#[derive(Debug)]
pub struct HashJoinBuildOutput {
    context: Arc<BuildContext>,
    partitions: HashMap<PartitionPath, InMemoryPartition>,
    null_aware: Option<NullAwareRows>,
    runtime_filters: Vec<RuntimeFilterExport>,
    stats: BuildStats,
}

impl HashJoinBuildOutput {
    pub fn partition(&self, path: &PartitionPath) -> Option<&InMemoryPartition> {
        self.partitions.get(path)
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&PartitionPath, &InMemoryPartition)> {
        self.partitions.iter()
    }

    /// Rows in the in-memory partitions.
    pub fn num_rows(&self) -> usize {
        self.partitions.values().map(InMemoryPartition::num_rows).sum()
    }

    pub fn null_aware_rows(&self) -> Option<&NullAwareRows> {
        self.null_aware.as_ref()
    }

    pub fn take_null_aware_rows(&mut self) -> Option<NullAwareRows> {
        self.null_aware.take()
    }

    pub fn runtime_filters(&self) -> &[RuntimeFilterExport] {
        &self.runtime_filters
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Finds the build rows matching each row of `probe_batch` on the join
    /// keys. `probe_keys` must produce the build key types. Probe rows with
    /// a null key match nothing.
    pub fn find_matches(
        &self,
        probe_batch: &RecordBatch,
        probe_keys: &[Arc<dyn PhysicalExpr>],
    ) -> DFResult<Vec<JoinMatch>> {
        let key_columns = evaluate_exprs(probe_batch, probe_keys)?;
        let probe_types: Vec<_> = key_columns.iter().map(|c| c.data_type().clone()).collect();
        if probe_types != self.context.key_types() {
            return Err(DataFusionError::Execution(format!(
                "Probe key types {probe_types:?} do not match build key types {:?}",
                self.context.key_types()
            )));
        }
        let probe_rows = self
            .context
            .key_converter()
            .convert_columns(&normalize_float_keys(&key_columns))?;
        let bits = self.context.config().num_partitioning_bits;
        let mut cache = ExprValuesCache::new(self.context.config().expr_cache_capacity);
        let mut matches = vec![];

        let num_rows = probe_batch.num_rows();
        let mut offset = 0;
        while offset < num_rows {
            let len = cache.capacity().min(num_rows - offset);
            cache.hash_group(&key_columns, offset, len)?;
            while !cache.at_end() {
                if !cache.is_row_null() {
                    let probe_row = offset + cache.cur_row();
                    let hash = cache.cur_hash();
                    let found = (0..=self.stats.max_level).find_map(|level| {
                        let path = PartitionPath::of_hash(hash, level, bits);
                        self.partitions.get(&path).map(|p| (path, p))
                    });
                    if let Some((path, partition)) = found {
                        let probe_key = probe_rows.row(probe_row);
                        for build_row in partition.hash_table().find(hash) {
                            if partition.key_rows().row(build_row) == probe_key {
                                matches.push(JoinMatch {
                                    probe_row,
                                    partition: path,
                                    build_row,
                                });
                            }
                        }
                    }
                }
                cache.next_row();
            }
            offset += len;
        }
        Ok(matches)
    }
}

/// Partitions finalized so far.
struct BuildState {
    partitions: HashMap<PartitionPath, InMemoryPartition>,
    queue: VecDeque<(PartitionPath, SpillableRowStream)>,
    stats: BuildStats,
}

impl BuildState {
    fn absorb(&mut self, level: FinalizedLevel) {
        for (path, partition) in level.in_memory {
            self.stats.max_level = self.stats.max_level.max(path.level);
            self.partitions.insert(path, partition);
        }
        self.queue.extend(level.spilled);
    }
}

/// Consumes `input` into partitioned hash tables.
///
/// Runtime filters are populated during the level-0 pass only. Partitions
/// that do not fit in memory are repartitioned on the next hash bits until
/// they fit; the build fails with `ResourcesExhausted` past
/// `max_recursion_depth` levels or when repartitioning does not split a
/// partition. On error or cancellation all partition memory and spill files
/// are released.
pub async fn build_hash_join(
    mut input: SendableRecordBatchStream,
    context: Arc<BuildContext>,
    cancel: &BuildCancellation,
) -> DFResult<HashJoinBuildOutput> {
    let mut builder = HashJoinBuilder::try_new(Arc::clone(&context), None)?;
    let mut input_rows = 0;
    while let Some(batch) = input.next().await {
        if let Err(e) = cancel.check() {
            builder.close();
            return Err(e);
        }
        let batch = batch?;
        input_rows += batch.num_rows();
        // routing may spill partitions to disk
        builder = tokio::task::spawn_blocking(move || -> DFResult<HashJoinBuilder> {
            builder.process_build_batch(&batch, true)?;
            Ok(builder)
        })
        .await
        .map_err(|e| DataFusionError::Execution(format!("Hash join build task failed: {e}")))??;
    }
    cancel.check()?;

    let runtime_filters = builder.take_runtime_filters();
    let null_key_rows = builder.num_null_key_rows();
    info!(
        "Hash join build: {} input rows, {} with null keys, {} runtime filters",
        input_rows,
        null_key_rows,
        runtime_filters.len()
    );
    let mut level = builder.finalize_partitions().await?;
    let null_aware = level.null_aware.take();

    let mut state = BuildState {
        partitions: HashMap::new(),
        queue: VecDeque::new(),
        stats: BuildStats {
            input_rows,
            null_key_rows,
            ..BuildStats::default()
        },
    };
    state.absorb(level);

    let max_depth = context.config().max_recursion_depth;
    while let Some((path, stream)) = state.queue.pop_front() {
        cancel.check()?;
        let parent_rows = stream.num_rows();
        if path.level + 1 > max_depth {
            return Err(DataFusionError::ResourcesExhausted(format!(
                "Hash join build partition {path} with {parent_rows} rows ({} bytes) does not \
                 fit in memory after {max_depth} levels of repartitioning",
                stream.byte_size()
            )));
        }
        info!(
            "Hash join build: repartitioning {} ({} rows, {} bytes)",
            path,
            parent_rows,
            stream.byte_size()
        );
        context.metrics().repartition_count.add(1);
        state.stats.repartitions += 1;

        let level = repartition(stream, path, &context, cancel).await?;
        if let Some((child, stream)) = level
            .spilled
            .iter()
            .find(|(_, s)| s.num_rows() == parent_rows)
        {
            return Err(DataFusionError::ResourcesExhausted(format!(
                "Repartitioning hash join build partition {path} moved all {parent_rows} rows \
                 into {child} ({} bytes); the join keys are too skewed to fit in memory",
                stream.byte_size()
            )));
        }
        state.absorb(level);
    }

    state.stats.in_memory_partitions = state.partitions.len();
    info!("Hash join build complete: {:?}", state.stats);
    Ok(HashJoinBuildOutput {
        context,
        partitions: state.partitions,
        null_aware,
        runtime_filters,
        stats: state.stats,
    })
}

/// Re-routes the rows of a spilled partition into the partitions one level
/// deeper and finalizes those.
async fn repartition(
    stream: SpillableRowStream,
    path: PartitionPath,
    context: &Arc<BuildContext>,
    cancel: &BuildCancellation,
) -> DFResult<FinalizedLevel> {
    let mut builder = HashJoinBuilder::try_new(Arc::clone(context), Some(path))?;
    let reader = stream.into_reader()?;
    let cancel = cancel.clone();
    let builder = tokio::task::spawn_blocking(move || -> DFResult<HashJoinBuilder> {
        for batch in reader {
            if let Err(e) = cancel.check() {
                builder.close();
                return Err(e);
            }
            builder.process_build_batch(&batch?, false)?;
        }
        Ok(builder)
    })
    .await
    .map_err(|e| DataFusionError::Execution(format!("Hash join repartition task failed: {e}")))??;
    builder.finalize_partitions().await
}
