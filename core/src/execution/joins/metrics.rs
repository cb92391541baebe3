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

use datafusion::physical_plan::metrics::{Count, ExecutionPlanMetricsSet, MetricBuilder, Time};

/// Metrics of one hash join build.
#[derive(Clone, Debug)]
pub struct BuildMetrics {
    /// Time spent hashing and routing build rows
    pub build_time: Time,
    /// Time spent building hash tables
    pub finalize_time: Time,
    /// Number of build-side input rows
    pub build_input_rows: Count,
    /// Number of build-side input batches
    pub build_input_batches: Count,
    /// Number of spill events
    pub spill_count: Count,
    /// Total bytes spilled to disk
    pub spilled_bytes: Count,
    /// Number of spilled partitions that were repartitioned
    pub repartition_count: Count,
    /// Number of level-0 rows with a null join key
    pub null_key_rows: Count,
}

impl BuildMetrics {
    pub fn new(metrics: &ExecutionPlanMetricsSet, partition: usize) -> Self {
        Self {
            build_time: MetricBuilder::new(metrics).subset_time("build_time", partition),
            finalize_time: MetricBuilder::new(metrics).subset_time("finalize_time", partition),
            build_input_rows: MetricBuilder::new(metrics).counter("build_input_rows", partition),
            build_input_batches: MetricBuilder::new(metrics)
                .counter("build_input_batches", partition),
            spill_count: MetricBuilder::new(metrics).spill_count(partition),
            spilled_bytes: MetricBuilder::new(metrics).spilled_bytes(partition),
            repartition_count: MetricBuilder::new(metrics).counter("repartition_count", partition),
            null_key_rows: MetricBuilder::new(metrics).counter("null_key_rows", partition),
        }
    }
}
