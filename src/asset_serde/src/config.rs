use std::{path::Path, time::Duration};

use clap::ValueEnum;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{error::IngestResult, pool::WorkerLimits};

const GIB: u64 = 1024 * 1024 * 1024;

/// How the Store Loader moves rows into the store. `Auto` picks one of the
/// other three per load based on candidate byte size and memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    #[default]
    Auto,
    Parallel,
    Isolated,
    Streaming,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::Auto => f.write_str("auto"),
            LoadMode::Parallel => f.write_str("parallel"),
            LoadMode::Isolated => f.write_str("isolated"),
            LoadMode::Streaming => f.write_str("streaming"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_transform_workers")]
    pub transform_workers: usize,
    #[serde(default = "default_load_workers")]
    pub load_workers: usize,
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: u64,
    #[serde(default = "default_isolated_threshold")]
    pub isolated_threshold_bytes: u64,
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_secs: u64,
    #[serde(default = "default_overall_timeout")]
    pub overall_timeout_secs: u64,
    #[serde(default)]
    pub load_mode: LoadMode,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            transform_workers: default_transform_workers(),
            load_workers: default_load_workers(),
            memory_limit_bytes: default_memory_limit(),
            isolated_threshold_bytes: default_isolated_threshold(),
            chunk_timeout_secs: default_chunk_timeout(),
            overall_timeout_secs: default_overall_timeout(),
            load_mode: LoadMode::default(),
        }
    }
}

impl IngestConfig {
    /// Layers an optional YAML/JSON/TOML file and then `ASSETINSIGHT_*`
    /// environment variables over the built-in defaults.
    pub fn load(file: Option<&Path>) -> IngestResult<IngestConfig> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(true));
        }
        let config = builder
            .add_source(Environment::with_prefix("ASSETINSIGHT").try_parsing(true))
            .build()?
            .try_deserialize::<IngestConfig>()?;
        Ok(config)
    }

    pub fn with_load_mode(mut self, mode: LoadMode) -> Self {
        self.load_mode = mode;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.transform_workers = workers.max(1);
        self.load_workers = workers.max(1);
        self
    }

    pub fn transform_limits(&self) -> WorkerLimits {
        self.limits(self.transform_workers)
    }

    pub fn load_limits(&self) -> WorkerLimits {
        self.limits(self.load_workers)
    }

    fn limits(&self, workers: usize) -> WorkerLimits {
        WorkerLimits {
            max_workers: workers.max(1),
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs),
            overall_timeout: Duration::from_secs(self.overall_timeout_secs),
        }
    }
}

fn default_transform_workers() -> usize {
    common::HOST.workers(16)
}

fn default_load_workers() -> usize {
    common::HOST.workers(4)
}

fn default_memory_limit() -> u64 {
    2 * GIB
}

fn default_isolated_threshold() -> u64 {
    GIB / 2
}

fn default_chunk_timeout() -> u64 {
    60
}

fn default_overall_timeout() -> u64 {
    300
}
