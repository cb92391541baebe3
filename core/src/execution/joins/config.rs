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

use std::collections::HashMap;
use std::str::FromStr;

use crate::errors::{HashJoinBuildError, HashJoinBuildResult};

pub const CONF_PARTITIONING_BITS: &str = "hashjoin.build.partitioningBits";
pub const CONF_MAX_RECURSION_DEPTH: &str = "hashjoin.build.maxRecursionDepth";
pub const CONF_PREFETCH_MODE: &str = "hashjoin.build.prefetchMode";
pub const CONF_EXPR_CACHE_CAPACITY: &str = "hashjoin.build.exprCacheCapacity";
pub const CONF_PAGE_SIZE: &str = "hashjoin.build.pageSize";
pub const CONF_MAX_PAGE_SIZE: &str = "hashjoin.build.maxPageSize";
pub const CONF_MAX_PARTITION_BYTES: &str = "hashjoin.build.maxPartitionBytes";
pub const CONF_FINALIZE_CONCURRENCY: &str = "hashjoin.build.finalizeConcurrency";
pub const CONF_RUNTIME_FILTER_MAX_BYTES: &str = "hashjoin.build.runtimeFilter.maxBytes";
pub const CONF_RUNTIME_FILTER_FPP: &str = "hashjoin.build.runtimeFilter.fpp";

/// Whether hash table buckets are prefetched before inserting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrefetchMode {
    None,
    HtBucket,
}

impl FromStr for PrefetchMode {
    type Err = HashJoinBuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(PrefetchMode::None),
            "ht_bucket" | "htbucket" => Ok(PrefetchMode::HtBucket),
            other => Err(HashJoinBuildError::Config(format!(
                "Unsupported prefetch mode: {other}"
            ))),
        }
    }
}

/// Tuning knobs of the partitioned build side.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildConfig {
    /// Hash bits consumed per partitioning level; each level has
    /// `2^num_partitioning_bits` partitions.
    pub num_partitioning_bits: u32,
    /// Deepest level a spilled partition may be repartitioned to.
    pub max_recursion_depth: usize,
    pub prefetch_mode: PrefetchMode,
    /// Rows hashed per group by the expression value cache.
    pub expr_cache_capacity: usize,
    pub page_size: usize,
    /// Largest page a single row may claim.
    pub max_page_size: usize,
    /// Encoded stream bytes above which a partition is not built in memory.
    /// 0 leaves the decision to the memory pool alone.
    pub max_partition_bytes: usize,
    pub finalize_concurrency: usize,
    pub runtime_filter_max_bytes: usize,
    pub runtime_filter_fpp: f64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            num_partitioning_bits: 4,
            max_recursion_depth: 3,
            prefetch_mode: PrefetchMode::HtBucket,
            expr_cache_capacity: 1024,
            page_size: 64 * 1024,
            max_page_size: 8 * 1024 * 1024,
            max_partition_bytes: 0,
            finalize_concurrency: 1,
            runtime_filter_max_bytes: 16 * 1024 * 1024,
            runtime_filter_fpp: 0.03,
        }
    }
}

fn parse_option<T>(
    options: &HashMap<String, String>,
    key: &str,
    target: &mut T,
) -> HashJoinBuildResult<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = options.get(key) {
        *target = value.trim().parse::<T>().map_err(|e| {
            HashJoinBuildError::Config(format!("Invalid value '{value}' for {key}: {e}"))
        })?;
    }
    Ok(())
}

impl BuildConfig {
    /// Overrides defaults with any `hashjoin.build.*` entries in `options` and
    /// validates the result. Unknown keys are ignored.
    pub fn from_options(options: &HashMap<String, String>) -> HashJoinBuildResult<Self> {
        let mut config = Self::default();
        parse_option(options, CONF_PARTITIONING_BITS, &mut config.num_partitioning_bits)?;
        parse_option(options, CONF_MAX_RECURSION_DEPTH, &mut config.max_recursion_depth)?;
        parse_option(options, CONF_PREFETCH_MODE, &mut config.prefetch_mode)?;
        parse_option(options, CONF_EXPR_CACHE_CAPACITY, &mut config.expr_cache_capacity)?;
        parse_option(options, CONF_PAGE_SIZE, &mut config.page_size)?;
        parse_option(options, CONF_MAX_PAGE_SIZE, &mut config.max_page_size)?;
        parse_option(options, CONF_MAX_PARTITION_BYTES, &mut config.max_partition_bytes)?;
        parse_option(options, CONF_FINALIZE_CONCURRENCY, &mut config.finalize_concurrency)?;
        parse_option(options, CONF_RUNTIME_FILTER_MAX_BYTES, &mut config.runtime_filter_max_bytes)?;
        parse_option(options, CONF_RUNTIME_FILTER_FPP, &mut config.runtime_filter_fpp)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HashJoinBuildResult<()> {
        if !(1..=16).contains(&self.num_partitioning_bits) {
            return Err(HashJoinBuildError::Config(format!(
                "{CONF_PARTITIONING_BITS} must be between 1 and 16, got {}",
                self.num_partitioning_bits
            )));
        }
        let bits_needed = (self.max_recursion_depth as u64 + 1) * self.num_partitioning_bits as u64;
        if bits_needed > 32 {
            return Err(HashJoinBuildError::Config(format!(
                "{} levels of {} partitioning bits need {bits_needed} hash bits, only 32 are available",
                self.max_recursion_depth + 1,
                self.num_partitioning_bits
            )));
        }
        for (key, value) in [
            (CONF_EXPR_CACHE_CAPACITY, self.expr_cache_capacity),
            (CONF_PAGE_SIZE, self.page_size),
            (CONF_FINALIZE_CONCURRENCY, self.finalize_concurrency),
        ] {
            if value == 0 {
                return Err(HashJoinBuildError::Config(format!("{key} must be positive")));
            }
        }
        // row offsets within a page are i32
        if self.max_page_size > i32::MAX as usize {
            return Err(HashJoinBuildError::Config(format!(
                "{CONF_MAX_PAGE_SIZE} must not exceed {} bytes, got {}",
                i32::MAX,
                self.max_page_size
            )));
        }
        if self.page_size > self.max_page_size {
            return Err(HashJoinBuildError::Config(format!(
                "{CONF_PAGE_SIZE} ({}) must not exceed {CONF_MAX_PAGE_SIZE} ({})",
                self.page_size, self.max_page_size
            )));
        }
        if !(self.runtime_filter_fpp > 0.0 && self.runtime_filter_fpp < 1.0) {
            return Err(HashJoinBuildError::Config(format!(
                "{CONF_RUNTIME_FILTER_FPP} must be in (0, 1), got {}",
                self.runtime_filter_fpp
            )));
        }
        Ok(())
    }

    pub fn num_partitions(&self) -> usize {
        1 << self.num_partitioning_bits
    }
}
