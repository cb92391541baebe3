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

//! Errors raised outside of the DataFusion execution path: configuration,
//! logging setup and conversions between the two error domains.

use std::result;

use datafusion::common::DataFusionError;

#[derive(thiserror::Error, Debug)]
pub enum HashJoinBuildError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("{msg}")]
    DataFusion {
        msg: String,
        #[source]
        source: DataFusionError,
    },
}

impl From<DataFusionError> for HashJoinBuildError {
    fn from(value: DataFusionError) -> Self {
        HashJoinBuildError::DataFusion {
            msg: value.message().to_string(),
            source: value,
        }
    }
}

impl From<HashJoinBuildError> for DataFusionError {
    fn from(value: HashJoinBuildError) -> Self {
        match value {
            HashJoinBuildError::DataFusion { msg: _, source } => source,
            HashJoinBuildError::Config(_) => DataFusionError::Configuration(value.to_string()),
        }
    }
}

/// A specialized `Result` for configuration and setup errors.
pub type HashJoinBuildResult<T> = result::Result<T, HashJoinBuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_datafusion_error() {
        let err = DataFusionError::ResourcesExhausted("no memory".to_string());
        let wrapped = HashJoinBuildError::from(err);
        assert_eq!(wrapped.to_string(), "no memory");
        let unwrapped = DataFusionError::from(wrapped);
        assert!(matches!(unwrapped, DataFusionError::ResourcesExhausted(_)));
    }

    #[test]
    fn test_config_error_message() {
        let err = DataFusionError::from(HashJoinBuildError::Config("bad value".to_string()));
        match err {
            DataFusionError::Configuration(msg) => {
                assert_eq!(msg, "Configuration Error: bad value")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
