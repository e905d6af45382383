//! Encryption pipeline: plaintext in, `chunk header || ciphertext` frames out.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{drive, spawn_workers, PipelineStats, Reassembly, RunParams, Sequenced, Work};
use crate::aead::{AeadFactory, ChunkAead};
use crate::error::{StreamError, StreamResult};
use crate::format::{build_aad, build_chunk_header, compose_nonce, read_fill};
use crate::keys::{FileKey, FILE_KEY_INDEX};
use crate::scope::{BufferScope, PooledBuffer};
use crate::tag::Tag128;

pub(crate) struct EncryptJob {
    index: u64,
    buf: PooledBuffer,
}

pub(crate) struct SealedChunk {
    index: u64,
    tag: Tag128,
    buf: PooledBuffer,
}

/// Encrypt `input` into chunk frames on `output`. The file header must
/// already have been written.
pub(crate) async fn run<R, W>(
    input: &mut R,
    output: &mut W,
    file_key: &FileKey,
    aead: &Arc<dyn AeadFactory>,
    scope: &Arc<BufferScope>,
    params: &RunParams,
    cancel: &CancellationToken,
) -> StreamResult<PipelineStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let capacity = params.channel_capacity();
    let (job_tx, job_rx) = mpsc::channel(capacity);
    let (result_tx, result_rx) = mpsc::channel(capacity);

    let workers = spawn_workers(params.threads, job_rx, result_tx, cancel, || {
        let ctx = aead.context(file_key.as_bytes());
        let key_id = params.key_id;
        let nonce_prefix = params.nonce_prefix;
        move |job: EncryptJob| {
            let index = job.index;
            Sequenced {
                index,
                payload: seal_chunk(ctx.as_ref(), key_id, nonce_prefix, job),
            }
        }
    });

    let reassembly = Reassembly::new(result_rx, params.threads, params.window_cap);
    debug!(
        threads = params.threads,
        window = reassembly.window_capacity(),
        window_cap = params.window_cap,
        chunk_size = params.chunk_limit,
        "encryption pipeline started"
    );

    let producer = produce(input, job_tx, scope, params, cancel);
    let consumer = consume(reassembly, output, params, cancel);

    let outcome = drive(cancel, workers, producer, consumer)
        .await
        .and_then(|stats| params.check_total(&stats).map(|()| stats));
    match &outcome {
        Ok(stats) => debug!(chunks = stats.chunks, bytes = stats.bytes, "encryption pipeline finished"),
        Err(e) => warn!(error = %e, kind = ?e.kind(), "encryption pipeline failed"),
    }
    outcome
}

async fn produce<R>(
    input: &mut R,
    jobs: mpsc::Sender<Work<EncryptJob>>,
    scope: &BufferScope,
    params: &RunParams,
    cancel: &CancellationToken,
) -> StreamResult<()>
where
    R: AsyncRead + Unpin,
{
    let chunk_size = params.chunk_limit;
    let mut index = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let (work, last) = match read_chunk(input, scope, chunk_size, index).await {
            Ok(None) => return Ok(()),
            Ok(Some(job)) => {
                let last = job.buf.len() < chunk_size;
                (Work::Job(job), last)
            }
            Err(error) => (Work::Failed { index, error }, true),
        };
        if jobs.send(work).await.is_err() || last {
            return Ok(());
        }
        index += 1;
    }
}

/// Fill one chunk. A short fill means the input is exhausted.
async fn read_chunk<R>(
    input: &mut R,
    scope: &BufferScope,
    chunk_size: usize,
    index: u64,
) -> StreamResult<Option<EncryptJob>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = scope.rent(chunk_size)?;
    let filled = read_fill(input, &mut buf.spare_mut()[..chunk_size]).await?;
    if filled == 0 {
        return Ok(None);
    }
    if index == FILE_KEY_INDEX {
        return Err(StreamError::ChunkCounterExhausted);
    }
    buf.set_len(filled);
    Ok(Some(EncryptJob { index, buf }))
}

fn seal_chunk(
    ctx: &dyn ChunkAead,
    key_id: i32,
    nonce_prefix: u32,
    job: EncryptJob,
) -> StreamResult<SealedChunk> {
    let EncryptJob { index, mut buf } = job;
    let nonce = compose_nonce(nonce_prefix, index);
    let aad = build_aad(key_id, index, buf.len() as u64);
    let tag = ctx
        .seal(&nonce, &aad, &mut buf)
        .map_err(|e| StreamError::Internal(format!("chunk {index}: encryption failed: {e}")))?;
    Ok(SealedChunk { index, tag, buf })
}

async fn consume<W>(
    mut reassembly: Reassembly<SealedChunk>,
    output: &mut W,
    params: &RunParams,
    cancel: &CancellationToken,
) -> StreamResult<PipelineStats>
where
    W: AsyncWrite + Unpin,
{
    let mut stats = PipelineStats::default();
    while let Some(chunk) = reassembly.next(cancel).await? {
        let header = build_chunk_header(
            params.key_id,
            params.nonce_prefix,
            chunk.index,
            &chunk.tag,
            chunk.buf.len(),
        );
        output.write_all(&header).await?;
        output.write_all(&chunk.buf).await?;
        stats.chunks += 1;
        stats.bytes += chunk.buf.len() as u64;
    }
    output.flush().await?;
    Ok(stats)
}
