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

//! Routing of build rows into the partitions of one level and finalizing
//! those partitions.

use std::sync::Arc;

use arrow::array::{Array, RecordBatch};
use arrow::buffer::NullBuffer;
use arrow::datatypes::{DataType, SchemaRef};
use arrow::row::{RowConverter, SortField};
use datafusion::common::{DataFusionError, Result as DFResult};
use datafusion::execution::memory_pool::MemoryPool;
use datafusion::execution::runtime_env::RuntimeEnv;
use datafusion::physical_expr::PhysicalExpr;
use datafusion::physical_plan::metrics::ExecutionPlanMetricsSet;
use log::{debug, info, warn};
use tokio::sync::Semaphore;

use super::config::BuildConfig;
use super::expr_values_cache::{evaluate_exprs, ExprValuesCache};
use super::metrics::BuildMetrics;
use super::partition::{Finalized, InMemoryPartition, Partition};
use super::repartition::NullAwareRows;
use super::row_stream::SpillableRowStream;
use super::runtime_filter::{
    hash_filter_values, RuntimeFilter, RuntimeFilterDesc, RuntimeFilterExport,
};
use super::{partition_index, PartitionPath};

/// Everything about a build that stays fixed across levels: input schema,
/// join keys, configuration and the runtime whose memory pool is the budget
/// shared by all partitions.
#[derive(Debug)]
pub struct BuildContext {
    schema: SchemaRef,
    key_exprs: Vec<Arc<dyn PhysicalExpr>>,
    key_types: Vec<DataType>,
    config: BuildConfig,
    runtime: Arc<RuntimeEnv>,
    null_aware: bool,
    runtime_filters: Vec<RuntimeFilterDesc>,
    /// Encodes whole build rows into stream pages.
    row_converter: Arc<RowConverter>,
    /// Encodes join keys for exact comparison while probing.
    key_converter: Arc<RowConverter>,
    metrics: BuildMetrics,
}

fn sort_fields<'a>(types: impl Iterator<Item = &'a DataType>) -> Vec<SortField> {
    types.map(|dt| SortField::new(dt.clone())).collect()
}

impl BuildContext {
    pub fn try_new(
        schema: SchemaRef,
        key_exprs: Vec<Arc<dyn PhysicalExpr>>,
        config: BuildConfig,
        runtime: Arc<RuntimeEnv>,
    ) -> DFResult<Self> {
        config.validate()?;
        if key_exprs.is_empty() {
            return Err(DataFusionError::Plan(
                "Hash join build requires at least one join key".to_string(),
            ));
        }
        let key_types = key_exprs
            .iter()
            .map(|expr| expr.data_type(&schema))
            .collect::<DFResult<Vec<_>>>()?;
        let row_converter = RowConverter::new(sort_fields(
            schema.fields().iter().map(|f| f.data_type()),
        ))?;
        let key_converter = RowConverter::new(sort_fields(key_types.iter()))?;
        Ok(Self {
            schema,
            key_exprs,
            key_types,
            config,
            runtime,
            null_aware: false,
            runtime_filters: vec![],
            row_converter: Arc::new(row_converter),
            key_converter: Arc::new(key_converter),
            metrics: BuildMetrics::new(&ExecutionPlanMetricsSet::new(), 0),
        })
    }

    /// Keeps rows with a null join key in a dedicated partition instead of
    /// dropping them, as null-aware anti joins need.
    pub fn with_null_aware(mut self, null_aware: bool) -> Self {
        self.null_aware = null_aware;
        self
    }

    pub fn with_runtime_filters(mut self, runtime_filters: Vec<RuntimeFilterDesc>) -> Self {
        self.runtime_filters = runtime_filters;
        self
    }

    pub fn with_metrics(mut self, metrics: BuildMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn key_exprs(&self) -> &[Arc<dyn PhysicalExpr>] {
        &self.key_exprs
    }

    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<RuntimeEnv> {
        &self.runtime
    }

    pub fn memory_pool(&self) -> &Arc<dyn MemoryPool> {
        &self.runtime.memory_pool
    }

    pub fn metrics(&self) -> &BuildMetrics {
        &self.metrics
    }

    pub fn is_null_aware(&self) -> bool {
        self.null_aware
    }

    pub fn runtime_filters(&self) -> &[RuntimeFilterDesc] {
        &self.runtime_filters
    }

    pub fn row_converter(&self) -> &Arc<RowConverter> {
        &self.row_converter
    }

    pub fn key_converter(&self) -> &Arc<RowConverter> {
        &self.key_converter
    }

    pub fn new_row_stream(&self, name: impl Into<String>) -> SpillableRowStream {
        SpillableRowStream::new(
            name,
            Arc::clone(&self.schema),
            Arc::clone(&self.row_converter),
            &self.runtime,
            self.config.page_size,
            self.config.max_page_size,
        )
    }
}

/// Partitions of one level after finalize.
#[derive(Debug, Default)]
pub struct FinalizedLevel {
    pub in_memory: Vec<(PartitionPath, InMemoryPartition)>,
    pub spilled: Vec<(PartitionPath, SpillableRowStream)>,
    pub null_aware: Option<NullAwareRows>,
}

#[derive(Copy, Clone, Debug)]
enum RowTarget {
    Partition(usize),
    NullAware,
}

/// Hashed values of one runtime filter's source over a batch.
struct FilterValues {
    hashes: Vec<u32>,
    nulls: Option<NullBuffer>,
}

/// Routes build rows into the `2^B` partitions of one level.
///
/// The level-0 builder also owns the runtime filters and, for null-aware
/// joins, the partition of rows with a null join key. Builders of deeper
/// levels re-route the rows of one spilled parent partition on the next
/// `B` hash bits.
pub struct HashJoinBuilder {
    context: Arc<BuildContext>,
    parent: Option<PartitionPath>,
    level: usize,
    partitions: Vec<Partition>,
    null_aware_partition: Option<Partition>,
    filters: Vec<RuntimeFilter>,
    cache: ExprValuesCache,
    num_null_key_rows: usize,
}

impl HashJoinBuilder {
    /// Builder for the level-0 partitions when `parent` is `None`, or for
    /// the children of the spilled partition `parent`.
    pub fn try_new(context: Arc<BuildContext>, parent: Option<PartitionPath>) -> DFResult<Self> {
        let config = context.config();
        let level = parent.map_or(0, |p| p.level + 1);
        if level > config.max_recursion_depth {
            return Err(DataFusionError::Internal(format!(
                "Partition level {level} exceeds the maximum recursion depth {}",
                config.max_recursion_depth
            )));
        }
        let partitions = (0..config.num_partitions())
            .map(|index| {
                let name = format!("HashJoinBuild[level={level}, partition={index}]");
                Partition::new(index, level, false, context.new_row_stream(name))
            })
            .collect();
        let null_aware_partition = (level == 0 && context.is_null_aware()).then(|| {
            let stream = context.new_row_stream("HashJoinBuild[null-aware]");
            Partition::new(0, 0, true, stream)
        });
        let filters = if level == 0 {
            context
                .runtime_filters()
                .iter()
                .map(|desc| {
                    RuntimeFilter::new(
                        desc.clone(),
                        config.runtime_filter_max_bytes,
                        config.runtime_filter_fpp,
                        context.memory_pool(),
                    )
                })
                .collect()
        } else {
            vec![]
        };
        let cache = ExprValuesCache::new(config.expr_cache_capacity);
        Ok(Self {
            context,
            parent,
            level,
            partitions,
            null_aware_partition,
            filters,
            cache,
            num_null_key_rows: 0,
        })
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn null_aware_partition(&self) -> Option<&Partition> {
        self.null_aware_partition.as_ref()
    }

    /// Rows held by all partitions, the null-aware one included.
    pub fn num_rows(&self) -> usize {
        self.partitions
            .iter()
            .chain(self.null_aware_partition.iter())
            .map(Partition::num_rows)
            .sum()
    }

    pub fn num_null_key_rows(&self) -> usize {
        self.num_null_key_rows
    }

    fn path_of(&self, index: usize) -> PartitionPath {
        match &self.parent {
            Some(parent) => parent.child(index, self.context.config().num_partitioning_bits),
            None => PartitionPath::root(index),
        }
    }

    /// Hashes and routes every row of `batch`. With `build_filters`, which
    /// only the level-0 pass may request, the source value of each row with
    /// a non-null key is also added to every enabled runtime filter.
    ///
    /// An error leaves the rows appended so far in their partitions.
    pub fn process_build_batch(
        &mut self,
        batch: &RecordBatch,
        build_filters: bool,
    ) -> DFResult<()> {
        if build_filters && self.level > 0 {
            return Err(DataFusionError::Internal(format!(
                "Runtime filters cannot be populated at level {}",
                self.level
            )));
        }
        let num_rows = batch.num_rows();
        if num_rows == 0 {
            return Ok(());
        }
        let metrics = self.context.metrics().clone();
        let mut timer = metrics.build_time.timer();
        if self.level == 0 {
            metrics.build_input_batches.add(1);
            metrics.build_input_rows.add(num_rows);
        }

        let key_columns = evaluate_exprs(batch, self.context.key_exprs())?;
        let filter_values = if build_filters {
            self.hash_filter_sources(batch)?
        } else {
            vec![]
        };
        let rows = self.context.row_converter().convert_columns(batch.columns())?;
        let bits = self.context.config().num_partitioning_bits;
        let null_key_rows_before = self.num_null_key_rows;

        let mut offset = 0;
        while offset < num_rows {
            let len = self.cache.capacity().min(num_rows - offset);
            self.cache.hash_group(&key_columns, offset, len)?;
            while !self.cache.at_end() {
                let row_idx = offset + self.cache.cur_row();
                let row = rows.row(row_idx);
                if self.cache.is_row_null() {
                    self.num_null_key_rows += 1;
                    if self.null_aware_partition.is_some() {
                        self.append_row(RowTarget::NullAware, row.as_ref())?;
                    }
                } else {
                    for (filter, values) in self.filters.iter_mut().zip(&filter_values) {
                        if let Some(values) = values {
                            if values.nulls.as_ref().is_none_or(|n| n.is_valid(row_idx)) {
                                filter.insert(values.hashes[row_idx]);
                            }
                        }
                    }
                    let index = partition_index(self.cache.cur_hash(), self.level, bits);
                    self.append_row(RowTarget::Partition(index), row.as_ref())?;
                }
                self.cache.next_row();
            }
            offset += len;
        }

        metrics
            .null_key_rows
            .add(self.num_null_key_rows - null_key_rows_before);
        timer.done();
        Ok(())
    }

    /// One entry per filter; `None` for disabled filters. A filter whose
    /// values cannot be hashed is disabled rather than failing the build.
    fn hash_filter_sources(&mut self, batch: &RecordBatch) -> DFResult<Vec<Option<FilterValues>>> {
        let mut all_values = Vec::with_capacity(self.filters.len());
        for filter in self.filters.iter_mut() {
            if !filter.is_enabled() {
                all_values.push(None);
                continue;
            }
            let source = filter
                .source_expr()
                .evaluate(batch)?
                .into_array(batch.num_rows())?;
            let mut hashes = Vec::new();
            match hash_filter_values(&source, &mut hashes) {
                Ok(()) => all_values.push(Some(FilterValues {
                    hashes,
                    nulls: source.logical_nulls(),
                })),
                Err(e) => {
                    warn!("Disabling runtime filter over {}: {e}", filter.source_expr());
                    filter.disable();
                    all_values.push(None);
                }
            }
        }
        Ok(all_values)
    }

    fn target_stream(&mut self, target: RowTarget) -> DFResult<&mut SpillableRowStream> {
        let partition = match target {
            RowTarget::Partition(index) => self.partitions.get_mut(index).ok_or_else(|| {
                DataFusionError::Internal(format!("Partition index {index} out of range"))
            })?,
            RowTarget::NullAware => self.null_aware_partition.as_mut().ok_or_else(|| {
                DataFusionError::Internal("Build has no null-aware partition".to_string())
            })?,
        };
        partition.stream_mut()
    }

    #[inline]
    fn append_row(&mut self, target: RowTarget, row: &[u8]) -> DFResult<()> {
        if self.target_stream(target)?.add_row(row) {
            return Ok(());
        }
        self.append_row_slow(target, row)
    }

    /// Frees memory by spilling partitions until the row gets a page.
    fn append_row_slow(&mut self, target: RowTarget, row: &[u8]) -> DFResult<()> {
        loop {
            if self.target_stream(target)?.add_row_slow(row)? {
                return Ok(());
            }
            if !self.spill_largest_partition()? {
                return Err(DataFusionError::ResourcesExhausted(format!(
                    "Cannot append a {}-byte row to {:?} at level {}: no build partition \
                     holds memory that could be spilled",
                    row.len(),
                    target,
                    self.level
                )));
            }
        }
    }

    /// Spills the partition holding the most memory. Returns false when no
    /// partition holds any.
    fn spill_largest_partition(&mut self) -> DFResult<bool> {
        let largest = self
            .partitions
            .iter_mut()
            .chain(self.null_aware_partition.iter_mut())
            .filter(|p| p.bytes_in_memory() > 0)
            .max_by_key(|p| p.bytes_in_memory());
        let Some(partition) = largest else {
            return Ok(false);
        };
        info!(
            "Hash join build: memory pressure at level {}, spilling {:?} ({} bytes in memory)",
            self.level,
            partition,
            partition.bytes_in_memory()
        );
        let spilled_bytes = partition.spill()?;
        let metrics = self.context.metrics();
        metrics.spill_count.add(1);
        metrics.spilled_bytes.add(spilled_bytes);
        Ok(true)
    }

    /// Exports the enabled runtime filters. Call once the level-0 input is
    /// exhausted.
    pub fn take_runtime_filters(&mut self) -> Vec<RuntimeFilterExport> {
        std::mem::take(&mut self.filters)
            .into_iter()
            .filter_map(RuntimeFilter::into_export)
            .collect()
    }

    /// Finalizes every non-empty partition, up to `finalize_concurrency` at
    /// a time on blocking threads. Partitions that do not fit come back as
    /// spilled streams.
    pub async fn finalize_partitions(mut self) -> DFResult<FinalizedLevel> {
        let metrics = self.context.metrics().clone();
        let mut timer = metrics.finalize_time.timer();
        let semaphore = Arc::new(Semaphore::new(self.context.config().finalize_concurrency));

        let mut tasks = Vec::with_capacity(self.partitions.len() + 1);
        let partitions = std::mem::take(&mut self.partitions);
        for mut partition in partitions.into_iter().chain(self.null_aware_partition.take()) {
            if partition.num_rows() == 0 && !partition.is_null_aware() {
                partition.close();
                continue;
            }
            let permit = Arc::clone(&semaphore).acquire_owned().await.map_err(|e| {
                DataFusionError::Execution(format!("Hash join finalize semaphore closed: {e}"))
            })?;
            let context = Arc::clone(&self.context);
            tasks.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let result = partition.finalize(&context, context.memory_pool());
                (partition, result)
            }));
        }

        let mut finalized = FinalizedLevel::default();
        let mut first_error = None;
        for task in tasks {
            let (partition, result) = task.await.map_err(|e| {
                DataFusionError::Execution(format!("Hash join finalize task failed: {e}"))
            })?;
            if let Err(e) = result {
                first_error.get_or_insert(e);
                continue;
            }
            if first_error.is_some() {
                continue;
            }
            let path = self.path_of(partition.index());
            let null_aware = partition.is_null_aware();
            match (partition.into_finalized()?, null_aware) {
                (Finalized::InMemory(p), false) => finalized.in_memory.push((path, p)),
                (Finalized::Spilled(s), false) => finalized.spilled.push((path, s)),
                (Finalized::InMemory(p), true) => {
                    finalized.null_aware = Some(NullAwareRows::InMemory(p))
                }
                (Finalized::Spilled(s), true) => {
                    finalized.null_aware = Some(NullAwareRows::Spilled(s))
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        timer.done();

        info!(
            "Hash join build level {}: {} partitions in memory, {} spilled",
            self.level,
            finalized.in_memory.len(),
            finalized.spilled.len()
        );
        for (path, stream) in &finalized.spilled {
            debug!(
                "Spilled partition {}: {} rows, {} bytes",
                path,
                stream.num_rows(),
                stream.byte_size()
            );
        }
        Ok(finalized)
    }

    /// Releases every partition without further spilling.
    pub fn close(mut self) {
        for partition in self
            .partitions
            .iter_mut()
            .chain(self.null_aware_partition.iter_mut())
        {
            partition.close();
        }
    }
}
