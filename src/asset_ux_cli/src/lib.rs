use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use asset_serde::{
    cmd::{AnalyseArgs, LoadArgs, ReadinessArgs, TransformArgs},
    AssetStore, IngestConfig, SchemaRegistry, StoreRegistry,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

pub mod analyse;
pub mod format;
pub mod load;
pub mod readiness;
pub mod service_management;
pub mod transform;

#[derive(Debug, Clone, Copy, ValueEnum, Default, Serialize)]
pub enum LogMode {
    Full,
    Json,
    #[default]
    Compact,
}

#[derive(Debug, Serialize, Parser, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Turn debugging information on (repeat for higher levels)
    #[arg(short, long, action = clap::ArgAction::Count, env = "ASSETINSIGHT_DEBUG")]
    pub debug: u8,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Output logs in json format.
    #[clap(long, value_enum)]
    pub log_mode: Option<LogMode>,

    /// File for logs to be written to
    #[arg(long, value_parser)]
    pub log_file: Option<PathBuf>,

    /// YAML, JSON or TOML file with pipeline settings (workers, memory limits, timeouts)
    #[arg(long, env = "ASSETINSIGHT_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Serialize, Subcommand, Clone)]
pub enum CliCommands {
    Transform(TransformArgs),
    Load(LoadArgs),
    Analyse(AnalyseArgs),
    Readiness(ReadinessArgs),
}

pub async fn execute(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        CliCommands::Transform(args) => transform::Transform::default().execute(cli, args).await,
        CliCommands::Load(args) => load::Load::default().execute(cli, args).await,
        CliCommands::Analyse(args) => analyse::Analyse::default().execute(cli, args),
        CliCommands::Readiness(args) => readiness::Readiness::default().execute(args),
    }
}

/// Pipeline settings layered from `--config` and the environment.
pub(crate) fn ingest_config(cli: &Cli) -> anyhow::Result<IngestConfig> {
    IngestConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("[ingest_config] unable to load settings from {}", path.display()),
        None => "[ingest_config] unable to load settings from the environment".to_string(),
    })
}

/// Opens the store for `target_dir` using the schema document at `schema`.
pub(crate) fn open_store(
    registry: &StoreRegistry,
    target_dir: &Path,
    schema: &Path,
) -> anyhow::Result<Arc<AssetStore>> {
    let schema = SchemaRegistry::from_path(schema)
        .with_context(|| format!("[open_store] invalid schema {}", schema.display()))?;
    registry
        .open(target_dir, Arc::new(schema))
        .with_context(|| format!("[open_store] unable to open store in {}", target_dir.display()))
}
