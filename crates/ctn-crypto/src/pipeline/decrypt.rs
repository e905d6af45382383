//! Decryption pipeline: chunk headers + ciphertext in, plaintext out.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{drive, spawn_workers, PipelineStats, Reassembly, RunParams, Sequenced, Work};
use crate::aead::{AeadFactory, ChunkAead};
use crate::error::{StreamError, StreamResult};
use crate::format::{build_aad, compose_nonce, read_chunk_header, read_exactly, CHUNK_HEADER_LEN};
use crate::keys::{FileKey, FILE_KEY_INDEX};
use crate::scope::{BufferScope, PooledBuffer};
use crate::tag::Tag128;

pub(crate) struct DecryptJob {
    index: u64,
    tag: Tag128,
    ciphertext: PooledBuffer,
}

/// Decrypt every chunk after the file header from `input` into `output`.
///
/// `input` must be positioned just past the file header. All buffers come
/// from `scope`; the caller disposes it afterwards.
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
        let scope = Arc::clone(scope);
        let key_id = params.key_id;
        let nonce_prefix = params.nonce_prefix;
        move |job: DecryptJob| {
            let index = job.index;
            Sequenced {
                index,
                payload: open_chunk(ctx.as_ref(), &scope, key_id, nonce_prefix, job),
            }
        }
    });

    let reassembly = Reassembly::new(result_rx, params.threads, params.window_cap);
    debug!(
        threads = params.threads,
        window = reassembly.window_capacity(),
        window_cap = params.window_cap,
        max_chunk = params.chunk_limit,
        "decryption pipeline started"
    );

    let producer = produce(input, job_tx, scope, params, cancel);
    let consumer = consume(reassembly, output, cancel);

    let outcome = drive(cancel, workers, producer, consumer)
        .await
        .and_then(|stats| params.check_total(&stats).map(|()| stats));
    match &outcome {
        Ok(stats) => debug!(chunks = stats.chunks, bytes = stats.bytes, "decryption pipeline finished"),
        Err(e) => warn!(error = %e, kind = ?e.kind(), "decryption pipeline failed"),
    }
    outcome
}

async fn produce<R>(
    input: &mut R,
    jobs: mpsc::Sender<Work<DecryptJob>>,
    scope: &BufferScope,
    params: &RunParams,
    cancel: &CancellationToken,
) -> StreamResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut remaining = params.input_len;
    let mut index = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let work = match read_job(input, scope, params, index, &mut remaining).await {
            Ok(Some(job)) => Work::Job(job),
            Ok(None) => return Ok(()),
            Err(error) => Work::Failed { index, error },
        };
        let failed = matches!(work, Work::Failed { .. });
        if jobs.send(work).await.is_err() || failed {
            return Ok(());
        }
        index += 1;
    }
}

/// Read and validate one chunk. `Ok(None)` marks a clean end of stream.
async fn read_job<R>(
    input: &mut R,
    scope: &BufferScope,
    params: &RunParams,
    index: u64,
    remaining: &mut Option<u64>,
) -> StreamResult<Option<DecryptJob>>
where
    R: AsyncRead + Unpin,
{
    match *remaining {
        Some(0) => return Ok(None),
        Some(left) if left < CHUNK_HEADER_LEN as u64 => {
            return Err(StreamError::Truncated {
                what: "chunk header",
            })
        }
        _ => {}
    }

    let Some(header) = read_chunk_header(input, params.nonce_prefix, index).await? else {
        return Ok(None);
    };
    if header.key_id != params.key_id {
        return Err(StreamError::KeyIdMismatch {
            expected: params.key_id,
            actual: header.key_id,
        });
    }
    if header.plaintext_length <= 0 || header.plaintext_length as u64 > params.chunk_limit as u64 {
        return Err(StreamError::InvalidChunkLength {
            index,
            length: header.plaintext_length,
            max: params.chunk_limit,
        });
    }
    if index == FILE_KEY_INDEX {
        return Err(StreamError::ChunkCounterExhausted);
    }

    let len = header.plaintext_length as usize;
    if let Some(left) = remaining.as_mut() {
        let needed = (CHUNK_HEADER_LEN + len) as u64;
        if *left < needed {
            return Err(StreamError::Truncated { what: "chunk body" });
        }
        *left -= needed;
    }

    let mut ciphertext = scope.rent(len)?;
    read_exactly(input, &mut ciphertext, "chunk body").await?;
    Ok(Some(DecryptJob {
        index,
        tag: header.tag,
        ciphertext,
    }))
}

fn open_chunk(
    ctx: &dyn ChunkAead,
    scope: &BufferScope,
    key_id: i32,
    nonce_prefix: u32,
    job: DecryptJob,
) -> StreamResult<PooledBuffer> {
    let DecryptJob {
        index,
        tag,
        ciphertext,
    } = job;
    let mut plaintext = scope.rent(ciphertext.len())?;
    plaintext.copy_from_slice(&ciphertext);
    drop(ciphertext);

    let nonce = compose_nonce(nonce_prefix, index);
    let aad = build_aad(key_id, index, plaintext.len() as u64);
    ctx.open(&nonce, &aad, &mut plaintext, &tag)
        .map_err(|_| StreamError::AuthenticationFailed { chunk: Some(index) })?;
    Ok(plaintext)
}

async fn consume<W>(
    mut reassembly: Reassembly<PooledBuffer>,
    output: &mut W,
    cancel: &CancellationToken,
) -> StreamResult<PipelineStats>
where
    W: AsyncWrite + Unpin,
{
    let mut stats = PipelineStats::default();
    while let Some(plaintext) = reassembly.next(cancel).await? {
        output.write_all(&plaintext).await?;
        stats.chunks += 1;
        stats.bytes += plaintext.len() as u64;
    }
    output.flush().await?;
    Ok(stats)
}
