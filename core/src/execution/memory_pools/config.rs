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

use crate::errors::{HashJoinBuildError, HashJoinBuildResult};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryPoolType {
    Greedy,
    FairSpill,
    Unbounded,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryPoolConfig {
    pub pool_type: MemoryPoolType,
    pub pool_size: usize,
}

impl MemoryPoolConfig {
    pub fn new(pool_type: MemoryPoolType, pool_size: usize) -> Self {
        Self {
            pool_type,
            pool_size,
        }
    }
}

pub fn parse_memory_pool_config(
    memory_pool_type: &str,
    memory_limit: i64,
) -> HashJoinBuildResult<MemoryPoolConfig> {
    if memory_limit < 0 {
        return Err(HashJoinBuildError::Config(format!(
            "Memory limit must not be negative, got {memory_limit}"
        )));
    }
    let pool_size = memory_limit as usize;
    let memory_pool_config = match memory_pool_type {
        "default" | "greedy" => MemoryPoolConfig::new(MemoryPoolType::Greedy, pool_size),
        "fair_spill" => MemoryPoolConfig::new(MemoryPoolType::FairSpill, pool_size),
        // the unbounded pool never refuses a reservation so the size is ignored
        "unbounded" => MemoryPoolConfig::new(MemoryPoolType::Unbounded, 0),
        _ => {
            return Err(HashJoinBuildError::Config(format!(
                "Unsupported memory pool type: {memory_pool_type}"
            )))
        }
    };
    if memory_pool_config.pool_type != MemoryPoolType::Unbounded && pool_size == 0 {
        return Err(HashJoinBuildError::Config(format!(
            "Memory pool type {memory_pool_type} requires a positive memory limit"
        )));
    }
    Ok(memory_pool_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pool_types() {
        let config = parse_memory_pool_config("greedy", 1024).unwrap();
        assert_eq!(config, MemoryPoolConfig::new(MemoryPoolType::Greedy, 1024));

        let config = parse_memory_pool_config("default", 1024).unwrap();
        assert_eq!(config.pool_type, MemoryPoolType::Greedy);

        let config = parse_memory_pool_config("fair_spill", 2048).unwrap();
        assert_eq!(config, MemoryPoolConfig::new(MemoryPoolType::FairSpill, 2048));

        let config = parse_memory_pool_config("unbounded", 0).unwrap();
        assert_eq!(config.pool_type, MemoryPoolType::Unbounded);
    }

    #[test]
    fn test_parse_pool_errors() {
        assert!(parse_memory_pool_config("fancy", 1024).is_err());
        assert!(parse_memory_pool_config("greedy", 0).is_err());
        assert!(parse_memory_pool_config("greedy", -1).is_err());
    }
}
