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

//! Build side of a partitioned hash join.
//!
//! Build rows are hashed on their join keys and routed into `2^B` partitions
//! whose row streams spill to disk under memory pressure. Partitions that fit
//! get an in-memory hash table; the rest are repartitioned on further hash bits
//! until they fit or the recursion limit is hit. Bloom filters over build-side
//! values are populated on the first pass for pruning the probe side.

// The clippy throws an error if the reference clone not wrapped into `Arc::clone`
#![deny(clippy::clone_on_ref_ptr)]

use log::{info, warn, LevelFilter};
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{load_config_file, Appender, Deserializers, Root},
    encode::pattern::PatternEncoder,
    Config,
};
use once_cell::sync::OnceCell;

use errors::{HashJoinBuildError, HashJoinBuildResult};

pub mod errors;
pub mod execution;

pub use execution::joins::{
    build_hash_join, BuildCancellation, BuildConfig, BuildContext, HashJoinBuildOutput,
    PartitionPath, PrefetchMode, RuntimeFilterDesc, RuntimeFilterExport,
};
pub use execution::memory_pools::{create_runtime_env, MemoryPoolConfig, MemoryPoolType};

static LOGGER: OnceCell<()> = OnceCell::new();

/// Installs the global logger once per process. `log_conf_path` points to a
/// log4rs YAML file; `None` or an empty path logs to stderr at `INFO`.
pub fn init_logging(log_conf_path: Option<&str>) -> HashJoinBuildResult<()> {
    LOGGER.get_or_try_init(|| {
        let log_config = match log_conf_path {
            Some(path) if !path.is_empty() => load_config_file(path, Deserializers::default())
                .map_err(|err| HashJoinBuildError::Config(err.to_string())),
            _ => default_logger_config(),
        }?;
        // another logger may already be installed by the embedding process
        match log4rs::init_config(log_config) {
            Ok(_) => info!(
                "hashjoin-build {} logging initialized",
                env!("CARGO_PKG_VERSION")
            ),
            Err(err) => warn!("Keeping the installed logger: {err}"),
        }
        Ok::<(), HashJoinBuildError>(())
    })?;
    Ok(())
}

const LOG_PATTERN: &str = "{d(%y/%m/%d %H:%M:%S)} {l} {f}: {m}{n}";

// Creates a default log4rs config, which logs to console with `INFO` level.
fn default_logger_config() -> HashJoinBuildResult<Config> {
    let console_append = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();
    let appender = Appender::builder().build("console", Box::new(console_append));
    let root = Root::builder().appender("console").build(LevelFilter::Info);
    Config::builder()
        .appender(appender)
        .build(root)
        .map_err(|err| HashJoinBuildError::Config(err.to_string()))
}
