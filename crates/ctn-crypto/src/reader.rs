//! Pipe-style adapter: run a pipeline on a background task and expose its
//! output as an [`AsyncRead`].

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::StreamResult;
use crate::pipeline::PipelineStats;

/// In-memory pipe size between the background run and the reader.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Reader over the output of a background pipeline run.
///
/// Reads return data as the run produces it. Once the pipe drains, a failed
/// run surfaces as an `io::Error` (recoverable with
/// [`StreamError::from_io`](crate::StreamError::from_io)); a clean run
/// surfaces as EOF. Dropping the reader cancels the run.
pub struct PipelineReader {
    pipe: DuplexStream,
    task: Option<JoinHandle<StreamResult<PipelineStats>>>,
    stats: Option<PipelineStats>,
    cancel: CancellationToken,
}

impl PipelineReader {
    pub(crate) fn spawn<F, Fut>(cancel: &CancellationToken, run: F) -> Self
    where
        F: FnOnce(DuplexStream, CancellationToken) -> Fut,
        Fut: Future<Output = StreamResult<PipelineStats>> + Send + 'static,
    {
        let (pipe, sink) = tokio::io::duplex(PIPE_CAPACITY);
        let token = cancel.child_token();
        let task = tokio::spawn(run(sink, token.clone()));
        Self {
            pipe,
            task: Some(task),
            stats: None,
            cancel: token,
        }
    }

    /// Totals of the background run, available once EOF has been read.
    pub fn stats(&self) -> Option<PipelineStats> {
        self.stats
    }
}

impl AsyncRead for PipelineReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.pipe).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }

        // Pipe drained: the run's outcome decides between EOF and an error.
        if let Some(task) = this.task.as_mut() {
            let joined = ready!(Pin::new(task).poll(cx));
            this.task = None;
            match joined {
                Ok(Ok(stats)) => this.stats = Some(stats),
                Ok(Err(e)) => return Poll::Ready(Err(e.into())),
                Err(e) => {
                    return Poll::Ready(Err(io::Error::other(format!(
                        "pipeline task failed: {e}"
                    ))))
                }
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipelineReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PipelineReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineReader")
            .field("running", &self.task.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_reader_yields_output_then_eof() {
        let cancel = CancellationToken::new();
        let mut reader = PipelineReader::spawn(&cancel, |mut sink, _token| async move {
            sink.write_all(b"hello pipe").await.unwrap();
            Ok(PipelineStats {
                chunks: 1,
                bytes: 10,
            })
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello pipe");
        assert_eq!(
            reader.stats(),
            Some(PipelineStats {
                chunks: 1,
                bytes: 10
            })
        );
    }

    #[tokio::test]
    async fn test_reader_surfaces_failure_after_drain() {
        let cancel = CancellationToken::new();
        let mut reader = PipelineReader::spawn(&cancel, |mut sink, _token| async move {
            sink.write_all(b"partial").await.unwrap();
            Err(StreamError::AuthenticationFailed { chunk: Some(1) })
        });

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(out, b"partial");
        assert!(matches!(
            StreamError::from_io(err),
            StreamError::AuthenticationFailed { chunk: Some(1) }
        ));
    }

    #[tokio::test]
    async fn test_drop_cancels_run() {
        let cancel = CancellationToken::new();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let reader = PipelineReader::spawn(&cancel, |_sink, token| async move {
            token.cancelled().await;
            let _ = seen_tx.send(());
            Err(StreamError::Cancelled)
        });
        drop(reader);
        seen_rx.await.unwrap();
        assert!(!cancel.is_cancelled(), "only the child token is cancelled");
    }
}
