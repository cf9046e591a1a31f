use std::path::PathBuf;

use clap::{Args, ValueEnum};
use serde::Serialize;

use crate::config::LoadMode;

/// Flatten every `*.json` asset inventory file of a directory
#[derive(Debug, Serialize, Args, Clone)]
pub struct TransformArgs {
    /// directory holding the raw asset inventory JSON files
    #[arg(short, long, env = "ASSETINSIGHT_SOURCE_DIR")]
    pub source_dir: PathBuf,

    /// directory receiving the `<stem>_flattened.json` artifacts
    #[arg(short, long, env = "ASSETINSIGHT_TARGET_DIR")]
    pub target_dir: PathBuf,

    /// worker count (defaults to the configured transform workers)
    #[arg(short, long)]
    pub workers: Option<usize>,
}

/// Rebuild the asset store from the flattened artifacts of a directory
#[derive(Debug, Serialize, Args, Clone)]
pub struct LoadArgs {
    /// directory holding the flattened artifacts and the store file
    #[arg(short, long, env = "ASSETINSIGHT_TARGET_DIR")]
    pub target_dir: PathBuf,

    /// YAML document describing the store columns
    #[arg(long, env = "ASSETINSIGHT_SCHEMA")]
    pub schema: PathBuf,

    /// loading strategy; `auto` picks one from the artifact size and free memory
    #[arg(short, long, value_enum)]
    pub mode: Option<LoadMode>,

    /// worker count (defaults to the configured load workers)
    #[arg(short, long)]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, Serialize)]
pub enum ReportFormat {
    #[default]
    Json,
    Table,
}

/// Ownership distributions over a loaded store
#[derive(Debug, Serialize, Args, Clone)]
pub struct AnalyseArgs {
    /// directory holding the store file
    #[arg(short, long, env = "ASSETINSIGHT_TARGET_DIR")]
    pub target_dir: PathBuf,

    /// YAML document describing the store columns
    #[arg(long, env = "ASSETINSIGHT_SCHEMA")]
    pub schema: PathBuf,

    /// restrict to one table; all tables present in the store otherwise
    #[arg(long)]
    pub table: Option<String>,

    /// how the report is rendered
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Json)]
    pub format: ReportFormat,

    /// also write the JSON report to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Health of the store in a directory
#[derive(Debug, Serialize, Args, Clone)]
pub struct ReadinessArgs {
    /// directory holding the store file
    #[arg(short, long, env = "ASSETINSIGHT_TARGET_DIR")]
    pub target_dir: PathBuf,

    /// YAML document describing the store columns
    #[arg(long, env = "ASSETINSIGHT_SCHEMA")]
    pub schema: PathBuf,
}
