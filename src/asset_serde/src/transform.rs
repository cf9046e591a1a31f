use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::{
    chunk::ChunkPlanner,
    config::IngestConfig,
    error::{IngestError, IngestResult},
    flatten::{flatten, FileCounters, FlatRecord},
    pool::{run_chunks, ChunkContext},
};

pub const FLATTENED_SUFFIX: &str = "_flattened";

/// Outcome of flattening one source file.
#[derive(Debug, Clone, Serialize)]
pub struct FileResult {
    pub success: bool,
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub source_assets: usize,
    pub normalised_assets: usize,
    #[serde(flatten)]
    pub counters: FileCounters,
    pub error: Option<String>,
}

impl FileResult {
    fn failed(input: &Path, err: &IngestError) -> FileResult {
        FileResult {
            success: false,
            input: input.to_path_buf(),
            output: None,
            source_assets: 0,
            normalised_assets: 0,
            counters: FileCounters::default(),
            error: Some(format!("{}: {}", err.kind(), err)),
        }
    }
}

/// A worker chunk that was dropped as a whole (crash or timeout).
#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub chunk: usize,
    pub files: Vec<PathBuf>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub started_at: DateTime<Utc>,
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub workers: usize,
    pub chunks: usize,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub source_assets: usize,
    pub normalised_assets: usize,
    pub totals: FileCounters,
    pub files: Vec<FileResult>,
    pub chunk_failures: Vec<ChunkFailure>,
    pub elapsed_ms: u128,
}

/// `*.json` files directly inside `dir` with their byte sizes, sorted by path.
pub fn json_files(dir: &Path) -> IngestResult<Vec<(PathBuf, u64)>> {
    if !dir.is_dir() {
        return Err(IngestError::source_read(dir, "not a directory"));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|err| IngestError::source_read(dir, err))?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some("json")
        {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|err| IngestError::source_read(path, err))?
            .len();
        files.push((path.to_path_buf(), size));
    }
    files.sort();
    Ok(files)
}

/// Reads a JSON file holding one object or an array of objects. Array
/// entries that are not objects are skipped.
pub fn read_objects(path: &Path) -> IngestResult<Vec<Map<String, Value>>> {
    let file = File::open(path).map_err(|err| IngestError::source_read(path, err))?;
    let value: Value = serde_json::from_reader(BufReader::new(file))
        .map_err(|err| IngestError::source_read(path, err))?;
    match value {
        Value::Object(asset) => Ok(vec![asset]),
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(asset) => Some(asset),
                _ => None,
            })
            .collect()),
        other => Err(IngestError::source_read(
            path,
            format!("expected an object or array, found {}", type_name(&other)),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn flattened_path(source: &Path, target_dir: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "assets".to_string());
    target_dir.join(format!("{stem}{FLATTENED_SUFFIX}.json"))
}

fn write_records(path: &Path, records: &[FlatRecord]) -> IngestResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.flush()?;
    Ok(())
}

/// Flattens one source file into `<stem>_flattened.json` under `target_dir`.
/// Never fails: problems are reported in the returned result.
pub fn transform_file(source: &Path, target_dir: &Path) -> FileResult {
    let assets = match read_objects(source) {
        Ok(assets) => assets,
        Err(err) => {
            error!("[transform_file] {}", err);
            return FileResult::failed(source, &err);
        }
    };

    let mut counters = FileCounters::default();
    let flattened: Vec<FlatRecord> = assets
        .iter()
        .map(|asset| {
            let flat = flatten(asset);
            counters.observe(asset, &flat);
            flat
        })
        .collect();

    let output = flattened_path(source, target_dir);
    if let Err(err) = write_records(&output, &flattened) {
        error!("[transform_file] writing {}: {}", output.display(), err);
        return FileResult::failed(source, &err);
    }

    debug!(
        "[transform_file] {} -> {} ({} assets)",
        source.display(),
        output.display(),
        flattened.len()
    );
    FileResult {
        success: true,
        input: source.to_path_buf(),
        output: Some(output),
        source_assets: assets.len(),
        normalised_assets: flattened.len(),
        counters,
        error: None,
    }
}

/// Deletes an artifact written by a chunk that was dropped, so the loader
/// never picks up output the report counts as failed.
fn remove_artifact(path: Option<&Path>) {
    let Some(path) = path else { return };
    match std::fs::remove_file(path) {
        Ok(()) => debug!("[transform] removed artifact of dropped chunk {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("[transform] unable to remove {}: {}", path.display(), err),
    }
}

/// Parallel transform stage: plans file chunks by byte size and flattens
/// each chunk on its own worker.
pub struct Transformer {
    config: IngestConfig,
}

impl Transformer {
    pub fn new(config: IngestConfig) -> Transformer {
        Transformer { config }
    }

    pub async fn transform_directory(
        &self,
        source_dir: &Path,
        target_dir: &Path,
    ) -> IngestResult<TransformReport> {
        let started_at = Utc::now();
        let timer = Instant::now();

        let files = json_files(source_dir)?;
        std::fs::create_dir_all(target_dir)?;

        let limits = self.config.transform_limits();
        let plan = ChunkPlanner::files(limits.max_workers).plan(files);
        let chunks = plan.into_chunks();
        let chunk_files: Vec<Vec<PathBuf>> = chunks.clone();
        info!(
            "[transform_directory] {} files from {} in {} chunks over {} workers",
            chunk_files.iter().map(Vec::len).sum::<usize>(),
            source_dir.display(),
            chunks.len(),
            limits.max_workers
        );

        let target = target_dir.to_path_buf();
        let work = move |ctx: &ChunkContext, files: Vec<PathBuf>| {
            let mut results = Vec::with_capacity(files.len());
            for file in &files {
                if ctx.is_cancelled() {
                    return Err(ctx.cancelled_error());
                }
                let result = transform_file(file, &target);
                // the coordinator may have given up while this file was written
                if ctx.is_cancelled() {
                    remove_artifact(result.output.as_deref());
                    return Err(ctx.cancelled_error());
                }
                results.push(result);
            }
            Ok(results)
        };
        let outcomes = run_chunks(chunks, limits, work).await;

        let mut files = Vec::new();
        let mut chunk_failures = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(results) => files.extend(results),
                Err(err) => {
                    let dropped = chunk_files[outcome.chunk].clone();
                    for file in &dropped {
                        remove_artifact(Some(&flattened_path(file, target_dir)));
                        files.push(FileResult::failed(file, &err));
                    }
                    chunk_failures.push(ChunkFailure {
                        chunk: outcome.chunk,
                        files: dropped,
                        error: err.to_string(),
                    });
                }
            }
        }
        files.sort_by(|a, b| a.input.cmp(&b.input));

        let mut totals = FileCounters::default();
        for result in &files {
            totals.merge(&result.counters);
        }
        let successful = files.iter().filter(|f| f.success).count();
        let report = TransformReport {
            started_at,
            source_dir: source_dir.to_path_buf(),
            target_dir: target_dir.to_path_buf(),
            workers: limits.max_workers,
            chunks: chunk_files.len(),
            total: files.len(),
            successful,
            failed: files.len() - successful,
            source_assets: files.iter().map(|f| f.source_assets).sum(),
            normalised_assets: files.iter().map(|f| f.normalised_assets).sum(),
            totals,
            files,
            chunk_failures,
            elapsed_ms: timer.elapsed().as_millis(),
        };
        info!(
            "[transform_directory] {} of {} files flattened ({} failed) in {}ms",
            report.successful, report.total, report.failed, report.elapsed_ms
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn write_json(dir: &Path, name: &str, value: &Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string(value).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_transform_file_single_object() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let path = write_json(
            source.path(),
            "one.json",
            &json!({"id": "s1", "name": "web", "properties": {"os": "linux"}}),
        );

        let result = transform_file(&path, target.path());
        assert!(result.success);
        assert_eq!(result.source_assets, 1);
        assert_eq!(result.counters.missing_attribution, 1);
        assert_eq!(
            result.output.as_deref(),
            Some(target.path().join("one_flattened.json").as_path())
        );

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(result.output.unwrap()).unwrap())
                .unwrap();
        assert_eq!(
            written,
            json!([{"id": "s1", "name": "web", "properties_os": "linux"}])
        );
    }

    #[test]
    fn test_transform_file_reports_parse_failure() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let path = source.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        let result = transform_file(&path, target.path());
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("SourceReadError"));
        assert!(!target.path().join("broken_flattened.json").exists());
    }

    #[test]
    fn test_transform_file_reports_artifact_write_failure() {
        let source = tempfile::tempdir().unwrap();
        let path = write_json(source.path(), "one.json", &json!({"id": "s1"}));

        let result = transform_file(&path, &source.path().join("missing"));
        assert!(!result.success);
        assert_eq!(result.source_assets, 0);
        assert!(result.error.unwrap().starts_with("IoError"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transform_directory_isolates_bad_files() -> anyhow::Result<()> {
        let source = tempfile::tempdir()?;
        let target = source.path().join("flattened");
        write_json(
            source.path(),
            "servers.json",
            &json!([
                {"id": "s1", "assetClass": "server", "assetAttributions": [
                    {"roles": ["resource_owner"], "parentCloud": {"name": "AWS"}}
                ]},
                {"id": "s2", "assetClass": "server"},
                42
            ]),
        );
        write_json(source.path(), "scalar.json", &json!("nope"));
        std::fs::write(source.path().join("notes.txt"), "ignored")?;

        let report = Transformer::new(IngestConfig::default().with_workers(2))
            .transform_directory(source.path(), &target)
            .await?;

        assert_eq!(report.total, 2);
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.normalised_assets, 2);
        assert_eq!(report.totals.missing_parent_cloud, 1);
        assert!(report.chunk_failures.is_empty());
        assert!(target.join("servers_flattened.json").exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_chunks_leave_no_artifacts() -> anyhow::Result<()> {
        let source = tempfile::tempdir()?;
        let target = source.path().join("flattened");
        for index in 0..40 {
            let assets: Vec<Value> = (0..200)
                .map(|n| json!({"id": format!("a{index}-{n}"), "properties": {"n": n}}))
                .collect();
            write_json(source.path(), &format!("batch_{index:02}.json"), &Value::Array(assets));
        }

        let config = IngestConfig {
            chunk_timeout_secs: 0,
            ..IngestConfig::default().with_workers(2)
        };
        let report = Transformer::new(config)
            .transform_directory(source.path(), &target)
            .await?;
        assert_eq!(report.total, 40);
        assert_eq!(report.successful, 0);
        assert!(!report.chunk_failures.is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let leftovers: Vec<_> = std::fs::read_dir(&target)?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with("_flattened.json"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_source_directory_is_fatal() {
        let report = Transformer::new(IngestConfig::default())
            .transform_directory(Path::new("/definitely/not/here"), Path::new("/tmp/unused"))
            .await;
        assert!(matches!(report, Err(IngestError::SourceRead { .. })));
    }
}
