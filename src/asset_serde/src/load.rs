//! Store Loader: shapes flattened artifacts into schema rows and bulk-loads
//! them into the store using one of three strategies.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::{
    chunk::ChunkPlanner,
    config::{IngestConfig, LoadMode},
    error::{IngestError, IngestResult},
    flatten::FlatRecord,
    persist::{self, RowBuilder, RowSet},
    pool::{run_chunks, ChunkContext, ChunkOutcome},
    registry::AssetStore,
    schema::SchemaRegistry,
    transform::{json_files, read_objects, ChunkFailure},
};

#[derive(Debug, Clone, Serialize)]
pub struct FileLoad {
    pub path: PathBuf,
    pub success: bool,
    pub records: usize,
    pub error: Option<String>,
}

impl FileLoad {
    fn loaded(path: &Path, records: usize) -> FileLoad {
        FileLoad {
            path: path.to_path_buf(),
            success: true,
            records,
            error: None,
        }
    }

    fn failed(path: &Path, err: &IngestError) -> FileLoad {
        FileLoad {
            path: path.to_path_buf(),
            success: false,
            records: 0,
            error: Some(format!("{}: {}", err.kind(), err)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub started_at: DateTime<Utc>,
    pub store: PathBuf,
    pub mode: LoadMode,
    pub workers: usize,
    pub total_bytes: u64,
    pub available_memory: u64,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub valid_records: usize,
    pub rows_loaded: i64,
    pub table_rows: BTreeMap<String, i64>,
    pub files: Vec<FileLoad>,
    pub chunk_failures: Vec<ChunkFailure>,
    pub elapsed_ms: u128,
}

/// Largest run of records from one artifact that the row planner places as
/// a single item.
const ROW_SLICE: usize = 10_000;

/// A slice of one flattened artifact's records, the unit the row planner
/// balances. Large artifacts contribute several slices.
type Batch = (PathBuf, Vec<FlatRecord>);

/// Per-file bookkeeping shared by all three modes. `valid_records` counts
/// records from files whose rows actually landed in the store.
#[derive(Default)]
struct Staged {
    files: Vec<FileLoad>,
    chunk_failures: Vec<ChunkFailure>,
    valid_records: usize,
}

impl Staged {
    /// Marks every file with a slice in a dropped chunk as failed and records
    /// the chunk. Only the dropped slices' records leave `valid_records`.
    fn drop_chunk(&mut self, chunk: usize, slices: &[(PathBuf, usize)], err: &IngestError) {
        let mut paths = BTreeSet::new();
        for (path, records) in slices {
            self.valid_records = self.valid_records.saturating_sub(*records);
            if let Some(load) = self.files.iter_mut().find(|f| &f.path == path) {
                *load = FileLoad::failed(path, err);
            }
            paths.insert(path.clone());
        }
        self.chunk_failures.push(ChunkFailure {
            chunk,
            files: paths.into_iter().collect(),
            error: err.to_string(),
        });
    }
}

/// Private store produced by one isolated-mode worker.
struct IsolatedChunk {
    path: PathBuf,
    rows: usize,
}

pub struct Loader {
    config: IngestConfig,
}

impl Loader {
    pub fn new(config: IngestConfig) -> Loader {
        Loader { config }
    }

    /// Picks the loading strategy for `total_bytes` of candidate artifacts.
    /// An explicitly configured mode always wins over `Auto`.
    pub fn select_mode(&self, total_bytes: u64, available_memory: u64) -> LoadMode {
        match self.config.load_mode {
            LoadMode::Auto => {
                let memory_pressure =
                    available_memory > 0 && total_bytes.saturating_mul(2) > available_memory;
                if total_bytes > self.config.memory_limit_bytes || memory_pressure {
                    LoadMode::Streaming
                } else if total_bytes > self.config.isolated_threshold_bytes {
                    LoadMode::Isolated
                } else {
                    LoadMode::Parallel
                }
            }
            forced => forced,
        }
    }

    /// Rebuilds the store from every flattened artifact in the store's
    /// backing directory. Fatal only when the directory or store cannot be
    /// used at all; file and chunk problems are reported in the result.
    pub async fn load(&self, store: &Arc<AssetStore>) -> IngestResult<LoadReport> {
        let started_at = Utc::now();
        let timer = Instant::now();

        let files = json_files(store.backing_dir())?;
        let total_bytes: u64 = files.iter().map(|(_, size)| *size).sum();
        let available_memory = common::HOST.available_memory();
        let mode = self.select_mode(total_bytes, available_memory);
        let workers = self.config.load_limits().max_workers;
        info!(
            "[load] {} artifacts ({} bytes, {} bytes available) into {} using {} mode",
            files.len(),
            total_bytes,
            available_memory,
            store.path().display(),
            mode
        );

        on_store(store, |store| {
            store.with_connection(true, |conn| {
                persist::reset_tables(conn, store.schema())?;
                persist::create_tables(conn, store.schema())?;
                Ok(())
            })
        })
        .await?;

        let staged = match mode {
            LoadMode::Streaming => self.load_streaming(store, files).await?,
            LoadMode::Isolated => self.load_isolated(store, files).await?,
            LoadMode::Parallel | LoadMode::Auto => self.load_parallel(store, files).await?,
        };

        let table_rows = on_store(store, |store| {
            store.with_connection(true, |conn| {
                persist::create_indexes(conn, store.schema())?;
                Ok(())
            })?;
            store.table_counts()
        })
        .await?;

        let successful = staged.files.iter().filter(|f| f.success).count();
        let report = LoadReport {
            started_at,
            store: store.path().to_path_buf(),
            mode,
            workers,
            total_bytes,
            available_memory,
            total: staged.files.len(),
            successful,
            failed: staged.files.len() - successful,
            valid_records: staged.valid_records,
            rows_loaded: table_rows.values().sum(),
            table_rows,
            files: staged.files,
            chunk_failures: staged.chunk_failures,
            elapsed_ms: timer.elapsed().as_millis(),
        };
        info!(
            "[load] {} rows from {} of {} files in {}ms ({} mode)",
            report.rows_loaded, report.successful, report.total, report.elapsed_ms, report.mode
        );
        Ok(report)
    }

    /// Reads artifacts in byte-balanced file chunks, cuts their records into
    /// slices of at most `ROW_SLICE` and plans the slices into row-balanced
    /// chunks.
    async fn read_and_plan(&self, files: Vec<(PathBuf, u64)>) -> (Staged, Vec<Vec<Batch>>) {
        let limits = self.config.load_limits();
        let file_chunks = ChunkPlanner::files(limits.max_workers)
            .plan(files)
            .into_chunks();
        let chunk_files = file_chunks.clone();

        let read_files = |ctx: &ChunkContext, paths: Vec<PathBuf>| {
            let mut read = Vec::with_capacity(paths.len());
            for path in paths {
                if ctx.is_cancelled() {
                    return Err(ctx.cancelled_error());
                }
                let records = read_objects(&path);
                read.push((path, records));
            }
            Ok(read)
        };
        let outcomes = run_chunks(file_chunks, limits, read_files).await;

        let mut staged = Staged::default();
        let mut batches = Vec::new();
        for ChunkOutcome { chunk, result } in outcomes {
            match result {
                Ok(read) => {
                    for (path, records) in read {
                        match records {
                            Ok(records) => {
                                staged.files.push(FileLoad::loaded(&path, records.len()));
                                staged.valid_records += records.len();
                                batches.extend(row_slices(path, records));
                            }
                            Err(err) => {
                                error!("[load] {}", err);
                                staged.files.push(FileLoad::failed(&path, &err));
                            }
                        }
                    }
                }
                Err(err) => {
                    for path in &chunk_files[chunk] {
                        staged.files.push(FileLoad::failed(path, &err));
                    }
                    staged.chunk_failures.push(ChunkFailure {
                        chunk,
                        files: chunk_files[chunk].clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        staged.files.sort_by(|a, b| a.path.cmp(&b.path));

        let items: Vec<(Batch, u64)> = batches
            .into_iter()
            .map(|batch| {
                let rows = batch.1.len() as u64;
                (batch, rows)
            })
            .collect();
        let row_chunks = ChunkPlanner::rows(limits.max_workers)
            .plan(items)
            .into_chunks();
        debug!(
            "[load] {} valid records in {} slices planned into {} row chunks",
            staged.valid_records,
            row_chunks.iter().map(Vec::len).sum::<usize>(),
            row_chunks.len()
        );
        (staged, row_chunks)
    }

    /// Workers shape rows without touching the store; the coordinator then
    /// inserts each chunk in its own transaction on the single connection.
    async fn load_parallel(
        &self,
        store: &Arc<AssetStore>,
        files: Vec<(PathBuf, u64)>,
    ) -> IngestResult<Staged> {
        let (mut staged, row_chunks) = self.read_and_plan(files).await;
        let chunk_files = batch_files(&row_chunks);

        let schema = store.shared_schema();
        let outcomes = run_chunks(
            row_chunks,
            self.config.load_limits(),
            move |_: &ChunkContext, batches: Vec<Batch>| {
                let builder = RowBuilder::new(&schema);
                Ok(builder.rows(batches.iter().flat_map(|(_, records)| records.iter())))
            },
        )
        .await;

        let inserted = on_store(store, move |store| {
            let mut results = Vec::with_capacity(outcomes.len());
            for ChunkOutcome { chunk, result } in outcomes {
                let result = result.and_then(|rows| insert_chunk(store, &rows));
                results.push((chunk, result));
            }
            Ok(results)
        })
        .await?;

        for (chunk, result) in inserted {
            match result {
                Ok(rows) => debug!("[load_parallel] chunk {chunk} inserted {rows} rows"),
                Err(err) => staged.drop_chunk(chunk, &chunk_files[chunk], &err),
            }
        }
        Ok(staged)
    }

    /// Each worker writes its chunk into a private store; the coordinator
    /// merges them one at a time since only one writer may hold the store.
    async fn load_isolated(
        &self,
        store: &Arc<AssetStore>,
        files: Vec<(PathBuf, u64)>,
    ) -> IngestResult<Staged> {
        let (mut staged, row_chunks) = self.read_and_plan(files).await;
        let chunk_files = batch_files(&row_chunks);

        let scratch = tempfile::Builder::new()
            .prefix("assetinsight-chunks")
            .tempdir()?;
        let scratch_dir = scratch.path().to_path_buf();
        let schema = store.shared_schema();
        let outcomes = run_chunks(
            row_chunks,
            self.config.load_limits(),
            move |ctx: &ChunkContext, batches: Vec<Batch>| {
                let name = format!("chunk_{}_{}.sqlite.db", ctx.chunk, Ulid::new());
                let path = scratch_dir.join(name);
                build_chunk_store(ctx, &schema, &path, &batches)
            },
        )
        .await;

        let merged = on_store(store, move |store| {
            let mut results = Vec::with_capacity(outcomes.len());
            for ChunkOutcome { chunk, result } in outcomes {
                let result = result.and_then(|isolated| {
                    let copied = store.with_connection(true, |conn| {
                        Ok(persist::merge_chunk_store(conn, store.schema(), &isolated.path)?)
                    });
                    if let Err(err) = std::fs::remove_file(&isolated.path) {
                        warn!(
                            "[load_isolated] unable to remove {}: {}",
                            isolated.path.display(),
                            err
                        );
                    }
                    let copied = copied?;
                    if copied != isolated.rows {
                        warn!(
                            "[load_isolated] chunk {chunk} built {} rows but merged {copied}",
                            isolated.rows
                        );
                    }
                    Ok(copied)
                });
                results.push((chunk, result));
            }
            Ok(results)
        })
        .await?;

        for (chunk, result) in merged {
            match result {
                Ok(rows) => debug!("[load_isolated] chunk {chunk} merged {rows} rows"),
                Err(err) => staged.drop_chunk(chunk, &chunk_files[chunk], &err),
            }
        }
        drop(scratch);
        Ok(staged)
    }

    /// Sequential, largest-first batches; each batch is inserted and dropped
    /// before the next is read to bound peak memory.
    async fn load_streaming(
        &self,
        store: &Arc<AssetStore>,
        files: Vec<(PathBuf, u64)>,
    ) -> IngestResult<Staged> {
        let workers = self.config.load_limits().max_workers;
        on_store(store, move |store| {
            let mut files = files;
            files.sort_by(|a, b| b.1.cmp(&a.1));
            let batch_size = (files.len() / (workers * 2)).max(1);

            let mut staged = Staged::default();
            for (index, batch) in files.chunks(batch_size).enumerate() {
                let mut loaded = Vec::new();
                for (path, _) in batch {
                    match read_objects(path) {
                        Ok(records) => {
                            staged.files.push(FileLoad::loaded(path, records.len()));
                            staged.valid_records += records.len();
                            loaded.push((path.clone(), records));
                        }
                        Err(err) => {
                            error!("[load_streaming] {}", err);
                            staged.files.push(FileLoad::failed(path, &err));
                        }
                    }
                }

                let rows = RowBuilder::new(store.schema())
                    .rows(loaded.iter().flat_map(|(_, records)| records.iter()));
                match insert_chunk(store, &rows) {
                    Ok(inserted) => debug!(
                        "[load_streaming] batch {index} of {} files inserted {inserted} rows",
                        batch.len()
                    ),
                    Err(err) => {
                        let dropped: Vec<(PathBuf, usize)> = loaded
                            .iter()
                            .map(|(path, records)| (path.clone(), records.len()))
                            .collect();
                        staged.drop_chunk(index, &dropped, &err);
                    }
                }
            }
            staged.files.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(staged)
        })
        .await
    }
}

/// Cuts one artifact's records into consecutive slices of at most `ROW_SLICE`.
fn row_slices(path: PathBuf, mut records: Vec<FlatRecord>) -> Vec<Batch> {
    let mut slices = Vec::with_capacity(records.len() / ROW_SLICE + 1);
    while records.len() > ROW_SLICE {
        let rest = records.split_off(ROW_SLICE);
        slices.push((path.clone(), records));
        records = rest;
    }
    slices.push((path, records));
    slices
}

fn batch_files(chunks: &[Vec<Batch>]) -> Vec<Vec<(PathBuf, usize)>> {
    chunks
        .iter()
        .map(|chunk| {
            chunk
                .iter()
                .map(|(path, records)| (path.clone(), records.len()))
                .collect()
        })
        .collect()
}

fn insert_chunk(store: &AssetStore, rows: &RowSet) -> IngestResult<usize> {
    store.with_connection(true, |conn| {
        let tx = conn.transaction()?;
        let inserted = persist::insert_rows(&tx, store.schema(), rows)?;
        tx.commit()?;
        Ok(inserted)
    })
}

fn build_chunk_store(
    ctx: &ChunkContext,
    schema: &SchemaRegistry,
    path: &Path,
    batches: &[Batch],
) -> IngestResult<IsolatedChunk> {
    let rows = RowBuilder::new(schema).rows(batches.iter().flat_map(|(_, records)| records.iter()));
    let mut conn = persist::open_chunk_store(path)?;
    persist::create_tables(&conn, schema)?;
    persist::create_indexes(&conn, schema)?;
    let tx = conn.transaction()?;
    let inserted = persist::insert_rows(&tx, schema, &rows)?;
    // dropping the transaction rolls the rows back
    if ctx.is_cancelled() {
        return Err(ctx.cancelled_error());
    }
    tx.commit()?;
    Ok(IsolatedChunk {
        path: path.to_path_buf(),
        rows: inserted,
    })
}

/// Runs blocking store work off the async executor.
async fn on_store<R, F>(store: &Arc<AssetStore>, f: F) -> IngestResult<R>
where
    R: Send + 'static,
    F: FnOnce(&AssetStore) -> IngestResult<R> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|err| IngestError::Task(err.to_string()))?
}
