use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    /// A source or artifact file could not be read or parsed. Recorded per
    /// file; the run continues with the remaining files.
    #[error("unable to read {path}: {reason}")]
    SourceRead { path: PathBuf, reason: String },
    /// Missing or invalid column schema. Fatal since no row shape can be derived.
    #[error("schema error: {0}")]
    Schema(String),
    /// A worker chunk crashed or timed out; the chunk is dropped.
    #[error("chunk {chunk} dropped: {reason}")]
    Capacity { chunk: usize, reason: String },
    #[error("query failed: {0}")]
    Query(String),
    /// A coordinator task running blocking store work did not complete.
    #[error("background task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl IngestError {
    pub fn source_read(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        IngestError::SourceRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn capacity(chunk: usize, reason: impl ToString) -> Self {
        IngestError::Capacity {
            chunk,
            reason: reason.to_string(),
        }
    }

    /// Short category name used in per-file and per-chunk report entries.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::SourceRead { .. } => "SourceReadError",
            IngestError::Schema(_) => "SchemaError",
            IngestError::Capacity { .. } | IngestError::Task(_) => "CapacityError",
            IngestError::Query(_) | IngestError::Sqlite(_) => "QueryError",
            IngestError::Io(_) => "IoError",
            IngestError::Json(_) | IngestError::Yaml(_) => "ParseError",
            IngestError::Config(_) => "ConfigError",
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;
