use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::Semaphore, task::JoinSet, time::Instant};
use tracing::{debug, warn};

use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLimits {
    pub max_workers: usize,
    pub chunk_timeout: Duration,
    pub overall_timeout: Duration,
}

#[derive(Debug)]
pub struct ChunkOutcome<R> {
    pub chunk: usize,
    pub result: IngestResult<R>,
}

/// Handed to every worker. Once the coordinator gives up on the chunk the
/// context reports cancelled; long-running work checks it between units and
/// stops without producing side effects.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub chunk: usize,
    cancelled: Arc<AtomicBool>,
}

impl ChunkContext {
    fn new(chunk: usize) -> ChunkContext {
        ChunkContext {
            chunk,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// `Capacity` error for work that noticed the cancellation.
    pub fn cancelled_error(&self) -> IngestError {
        IngestError::capacity(self.chunk, "cancelled")
    }
}

/// Fans `chunks` out over blocking worker threads, at most
/// `limits.max_workers` at a time, and waits for all of them.
///
/// Every chunk is isolated: a chunk that panics or exceeds `chunk_timeout`
/// becomes a `Capacity` outcome, an error returned by `work` is kept as is,
/// and the other chunks are still collected. Chunks still outstanding when
/// `overall_timeout` elapses are dropped the same way.
///
/// A timed-out worker thread cannot be interrupted. Its context is cancelled
/// and it keeps its worker slot until it returns, so no more than
/// `max_workers` threads ever run at once.
pub async fn run_chunks<T, R, F>(
    chunks: Vec<Vec<T>>,
    limits: WorkerLimits,
    work: F,
) -> Vec<ChunkOutcome<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(&ChunkContext, Vec<T>) -> IngestResult<R> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let permits = Arc::new(Semaphore::new(limits.max_workers.max(1)));
    let deadline = Instant::now() + limits.overall_timeout;

    let mut pending: BTreeMap<usize, ChunkContext> = BTreeMap::new();
    let mut set = JoinSet::new();
    for (chunk, items) in chunks.into_iter().enumerate() {
        let ctx = ChunkContext::new(chunk);
        pending.insert(chunk, ctx.clone());
        let work = Arc::clone(&work);
        let permits = Arc::clone(&permits);
        let chunk_timeout = limits.chunk_timeout;
        set.spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => return (chunk, Err(IngestError::capacity(chunk, err))),
            };
            let worker_ctx = ctx.clone();
            let worker = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                work(&worker_ctx, items)
            });
            let result = match tokio::time::timeout(chunk_timeout, worker).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(IngestError::capacity(
                    chunk,
                    format!("worker crashed: {join_err}"),
                )),
                Err(_) => {
                    ctx.cancel();
                    Err(IngestError::capacity(
                        chunk,
                        format!("timed out after {}s", chunk_timeout.as_secs_f32()),
                    ))
                }
            };
            (chunk, result)
        });
    }

    let mut outcomes = Vec::with_capacity(pending.len());
    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok((chunk, result)))) => {
                pending.remove(&chunk);
                if let Err(err) = &result {
                    warn!("[run_chunks] chunk {chunk} failed: {err}");
                }
                outcomes.push(ChunkOutcome { chunk, result });
            }
            // the wrapper task itself never panics, but a cancelled runtime can abort it
            Ok(Some(Err(join_err))) => {
                warn!("[run_chunks] chunk task aborted: {join_err}");
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "[run_chunks] overall timeout of {}s reached with {} chunks outstanding",
                    limits.overall_timeout.as_secs_f32(),
                    pending.len()
                );
                set.abort_all();
                break;
            }
        }
    }

    for (chunk, ctx) in pending {
        ctx.cancel();
        outcomes.push(ChunkOutcome {
            chunk,
            result: Err(IngestError::capacity(chunk, "not collected before overall timeout")),
        });
    }

    outcomes.sort_by_key(|o| o.chunk);
    debug!("[run_chunks] collected {} chunk outcomes", outcomes.len());
    outcomes
}
