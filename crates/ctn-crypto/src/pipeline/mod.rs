//! Producer → worker pool → consumer plumbing shared by both directions.
//!
//! ```text
//! producer ──Work<J>──▶ [jobs: bounded] ──▶ N workers ──Sequenced<T>──▶ [results: bounded] ──▶ consumer
//! ```
//!
//! The producer and consumer run inside the caller's task (they borrow the
//! caller's reader and writer); workers are spawned into a `JoinSet` and share
//! the job receiver. Stage failures travel in-band, tagged with the chunk
//! index they belong to, and the consumer raises them only when that index
//! reaches the write cursor. The run therefore always ends with the failure
//! earliest in stream order. Cancellation and worker panics end the run at
//! once.

pub mod decrypt;
pub mod encrypt;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{StreamError, StreamResult};
use crate::reorder::ReorderWindow;

/// Totals reported by a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Chunks written to the output.
    pub chunks: u64,
    /// Plaintext bytes processed (equal to ciphertext bytes, headers excluded).
    pub bytes: u64,
}

/// Per-run parameters.
#[derive(Debug, Clone)]
pub(crate) struct RunParams {
    pub key_id: i32,
    pub nonce_prefix: u32,
    pub threads: usize,
    pub window_cap: usize,
    /// Encrypt: plaintext bytes per chunk. Decrypt: largest chunk accepted.
    pub chunk_limit: usize,
    pub expected_total: Option<u64>,
    pub strict_length: bool,
    /// Decrypt only: bytes left in the input after the file header.
    pub input_len: Option<u64>,
}

impl RunParams {
    pub fn channel_capacity(&self) -> usize {
        self.threads.saturating_mul(4).max(1)
    }

    /// Enforce the strict length check against what the run produced.
    pub fn check_total(&self, stats: &PipelineStats) -> StreamResult<()> {
        match self.expected_total {
            Some(expected) if self.strict_length && expected != stats.bytes => {
                Err(StreamError::LengthMismatch {
                    expected,
                    actual: stats.bytes,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Item on the job channel.
pub(crate) enum Work<J> {
    Job(J),
    /// The producer could not build chunk `index`.
    Failed { index: u64, error: StreamError },
}

/// Item on the result channel.
pub(crate) struct Sequenced<T> {
    pub index: u64,
    pub payload: StreamResult<T>,
}

/// Spawn `threads` workers that pull from `jobs`, run `process` (one
/// instance per worker, built by `make`) on the blocking pool and push to
/// `results`.
pub(crate) fn spawn_workers<J, T, F>(
    threads: usize,
    jobs: mpsc::Receiver<Work<J>>,
    results: mpsc::Sender<Sequenced<T>>,
    cancel: &CancellationToken,
    mut make: impl FnMut() -> F,
) -> JoinSet<StreamResult<()>>
where
    J: Send + 'static,
    T: Send + 'static,
    F: FnMut(J) -> Sequenced<T> + Send + 'static,
{
    let jobs = Arc::new(Mutex::new(jobs));
    let mut set = JoinSet::new();
    for _ in 0..threads {
        let jobs = Arc::clone(&jobs);
        let results = results.clone();
        let cancel = cancel.clone();
        let mut process = make();
        set.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return Err(StreamError::Cancelled);
                }
                let next = {
                    let mut rx = jobs.lock().await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                        next = rx.recv() => next,
                    }
                };
                let out = match next {
                    None => return Ok(()),
                    Some(Work::Job(job)) => {
                        // The AEAD transform is CPU-bound; keep it off the
                        // async executor so workers run in parallel on any
                        // runtime flavour.
                        let (returned, out) = tokio::task::spawn_blocking(move || {
                            let out = process(job);
                            (process, out)
                        })
                        .await
                        .map_err(|e| StreamError::Internal(format!("worker task failed: {e}")))?;
                        process = returned;
                        out
                    }
                    Some(Work::Failed { index, error }) => Sequenced {
                        index,
                        payload: Err(error),
                    },
                };
                if results.send(out).await.is_err() {
                    // Consumer is gone; the run is already ending.
                    return Ok(());
                }
            }
        });
    }
    set
}

async fn join_workers(mut workers: JoinSet<StreamResult<()>>) -> StreamResult<()> {
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(StreamError::Internal(format!("worker task failed: {e}"))),
        }
    }
    Ok(())
}

/// Run the three stages to completion. The first short-circuiting failure
/// wins; dropping the `JoinSet` on the way out aborts any live worker.
pub(crate) async fn drive<P, C>(
    cancel: &CancellationToken,
    workers: JoinSet<StreamResult<()>>,
    producer: P,
    consumer: C,
) -> StreamResult<PipelineStats>
where
    P: Future<Output = StreamResult<()>>,
    C: Future<Output = StreamResult<PipelineStats>>,
{
    let stages = async {
        let ((), (), stats) = tokio::try_join!(producer, join_workers(workers), consumer)?;
        Ok(stats)
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StreamError::Cancelled),
        result = stages => result,
    }
}

/// Consumer side: receives sequenced results and yields them in index order.
pub(crate) struct Reassembly<T> {
    window: ReorderWindow<StreamResult<T>>,
    results: mpsc::Receiver<Sequenced<T>>,
    drained: bool,
}

impl<T> Reassembly<T> {
    pub fn new(results: mpsc::Receiver<Sequenced<T>>, threads: usize, window_cap: usize) -> Self {
        Self {
            window: ReorderWindow::new(threads.saturating_mul(4), window_cap),
            results,
            drained: false,
        }
    }

    pub fn window_capacity(&self) -> usize {
        self.window.capacity()
    }

    /// Next item in index order, `Ok(None)` once every result has been
    /// emitted, or the in-band failure of the chunk at the write cursor.
    pub async fn next(&mut self, cancel: &CancellationToken) -> StreamResult<Option<T>> {
        loop {
            if let Some(ready) = self.window.pop_ready() {
                return ready.map(Some);
            }
            if self.drained {
                self.window.finish()?;
                return Ok(None);
            }
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                received = self.results.recv() => received,
            };
            match received {
                Some(Sequenced { index, payload }) => self.window.push(index, payload)?,
                None => self.drained = true,
            }
        }
    }
}
