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

//! Construction of the memory pool and runtime environment that the build
//! side reserves its pages, decoded rows and hash tables from.

mod config;

pub use config::{parse_memory_pool_config, MemoryPoolConfig, MemoryPoolType};

use std::num::NonZeroUsize;
use std::sync::Arc;

use datafusion::common::Result as DFResult;
use datafusion::execution::memory_pool::{
    FairSpillPool, GreedyMemoryPool, MemoryPool, TrackConsumersPool, UnboundedMemoryPool,
};
use datafusion::execution::runtime_env::{RuntimeEnv, RuntimeEnvBuilder};

/// Number of largest consumers listed when a reservation fails.
const NUM_TRACKED_CONSUMERS: usize = 10;

pub fn create_memory_pool(memory_pool_config: &MemoryPoolConfig) -> Arc<dyn MemoryPool> {
    let tracked = NonZeroUsize::new(NUM_TRACKED_CONSUMERS).unwrap_or(NonZeroUsize::MIN);
    match memory_pool_config.pool_type {
        MemoryPoolType::Greedy => Arc::new(TrackConsumersPool::new(
            GreedyMemoryPool::new(memory_pool_config.pool_size),
            tracked,
        )),
        MemoryPoolType::FairSpill => Arc::new(TrackConsumersPool::new(
            FairSpillPool::new(memory_pool_config.pool_size),
            tracked,
        )),
        MemoryPoolType::Unbounded => Arc::new(UnboundedMemoryPool::default()),
    }
}

/// Builds a runtime whose memory pool follows `memory_pool_config`. Spill
/// files go to the OS temp directory through the default disk manager.
pub fn create_runtime_env(memory_pool_config: &MemoryPoolConfig) -> DFResult<Arc<RuntimeEnv>> {
    RuntimeEnvBuilder::new()
        .with_memory_pool(create_memory_pool(memory_pool_config))
        .build_arc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::execution::memory_pool::MemoryConsumer;

    #[test]
    fn test_greedy_runtime_enforces_limit() -> DFResult<()> {
        let runtime = create_runtime_env(&MemoryPoolConfig::new(MemoryPoolType::Greedy, 1024))?;
        let mut reservation = MemoryConsumer::new("test").register(&runtime.memory_pool);
        reservation.try_grow(1000)?;
        assert!(reservation.try_grow(100).is_err());
        reservation.free();
        assert_eq!(runtime.memory_pool.reserved(), 0);
        Ok(())
    }

    #[test]
    fn test_unbounded_runtime() -> DFResult<()> {
        let runtime = create_runtime_env(&MemoryPoolConfig::new(MemoryPoolType::Unbounded, 0))?;
        let mut reservation = MemoryConsumer::new("test").register(&runtime.memory_pool);
        reservation.try_grow(1 << 40)?;
        Ok(())
    }
}
