//! High-level entry point: file header handling, key wrapping, per-run
//! buffer scopes, and the two pipelines.

use std::str::FromStr;
use std::sync::Arc;

use ctn_core::CryptoConfig;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::aead::{AeadFactory, CipherSuite};
use crate::allocator::{BufferAllocator, HeapAllocator};
use crate::error::{StreamError, StreamResult};
use crate::format::{
    build_file_header, read_chunk_header, read_file_header, FileHeader, CHUNK_HEADER_LEN,
    FILE_HEADER_LEN,
};
use crate::keys::{generate_file_key, unwrap_file_key, wrap_file_key, MasterKey, WrappedFileKey};
use crate::pipeline::{decrypt, encrypt, PipelineStats, RunParams};
use crate::reader::PipelineReader;
use crate::reorder::MIN_WINDOW;
use crate::scope::{BufferScope, ScopeLimits};
use crate::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Tuning for a [`StreamCipher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Plaintext bytes per chunk when encrypting.
    pub chunk_size: usize,
    /// Worker tasks per run.
    pub threads: usize,
    /// Largest chunk accepted when decrypting.
    pub max_chunk_size: usize,
    /// Upper bound on the reorder window, in chunks.
    pub window_cap: usize,
    /// Fail a run whose byte count disagrees with the known total.
    pub strict_length: bool,
    pub scope_max_buffers: Option<usize>,
    pub scope_max_bytes: Option<u64>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            threads: default_threads(),
            max_chunk_size: MAX_CHUNK_SIZE,
            window_cap: 128,
            strict_length: true,
            scope_max_buffers: None,
            scope_max_bytes: None,
        }
    }
}

impl StreamOptions {
    pub fn validate(&self) -> StreamResult<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(StreamError::InvalidArgument(format!(
                "chunk_size {} outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}",
                self.chunk_size
            )));
        }
        if self.threads == 0 {
            return Err(StreamError::InvalidArgument("threads must be at least 1".into()));
        }
        if !(1..=MAX_CHUNK_SIZE).contains(&self.max_chunk_size) {
            return Err(StreamError::InvalidArgument(format!(
                "max_chunk_size {} outside 1..={MAX_CHUNK_SIZE}",
                self.max_chunk_size
            )));
        }
        if self.window_cap < MIN_WINDOW {
            return Err(StreamError::InvalidArgument(format!(
                "window_cap must be at least {MIN_WINDOW}"
            )));
        }
        if self.scope_max_buffers == Some(0) || self.scope_max_bytes == Some(0) {
            return Err(StreamError::InvalidArgument(
                "buffer scope limits must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Map the `[crypto]` config section onto engine options.
    pub fn from_config(config: &CryptoConfig) -> StreamResult<Self> {
        let options = Self {
            chunk_size: config.chunk_size,
            threads: match config.threads {
                0 => default_threads(),
                n => n,
            },
            max_chunk_size: config.max_chunk_size,
            window_cap: config.window_cap,
            strict_length: config.strict_length,
            scope_max_buffers: config.scope_max_buffers,
            scope_max_bytes: config.scope_max_bytes,
        };
        options.validate()?;
        Ok(options)
    }

    fn scope_limits(&self, buffer_len: usize) -> ScopeLimits {
        let computed = ScopeLimits::for_run(self.threads, self.window_cap, buffer_len);
        ScopeLimits {
            max_count: self.scope_max_buffers.unwrap_or(computed.max_count),
            max_bytes: self.scope_max_bytes.unwrap_or(computed.max_bytes),
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Summary of an encrypted stream, produced without decrypting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLayout {
    pub header: FileHeader,
    pub chunks: u64,
    pub plaintext_bytes: u64,
    pub largest_chunk: u64,
    /// Total encoded size, headers included.
    pub encoded_bytes: u64,
}

/// Chunked AEAD stream encryptor/decryptor bound to one master key.
#[derive(Clone)]
pub struct StreamCipher {
    master: MasterKey,
    key_id: i32,
    aead: Arc<dyn AeadFactory>,
    options: StreamOptions,
    allocator: Arc<dyn BufferAllocator>,
}

impl StreamCipher {
    pub fn new(master: MasterKey, key_id: i32) -> StreamResult<Self> {
        if key_id <= 0 {
            return Err(StreamError::InvalidArgument(format!(
                "key id must be positive, got {key_id}"
            )));
        }
        Ok(Self {
            master,
            key_id,
            aead: Arc::new(CipherSuite::default()),
            options: StreamOptions::default(),
            allocator: Arc::new(HeapAllocator),
        })
    }

    /// Build from the `[crypto]` config section.
    pub fn from_config(master: MasterKey, config: &CryptoConfig) -> StreamResult<Self> {
        let suite = CipherSuite::from_str(&config.cipher)?;
        Self::new(master, config.key_id)?
            .with_suite(suite)
            .with_options(StreamOptions::from_config(config)?)
    }

    pub fn with_options(mut self, options: StreamOptions) -> StreamResult<Self> {
        options.validate()?;
        self.options = options;
        Ok(self)
    }

    pub fn with_suite(self, suite: CipherSuite) -> Self {
        self.with_aead(Arc::new(suite))
    }

    pub fn with_aead(mut self, aead: Arc<dyn AeadFactory>) -> Self {
        self.aead = aead;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn key_id(&self) -> i32 {
        self.key_id
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Encrypt `input` into `output`.
    ///
    /// `plaintext_len` is recorded in the file header when known (0 is
    /// written otherwise); under `strict_length` the bytes actually read must
    /// match it.
    pub async fn encrypt<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        plaintext_len: Option<u64>,
        cancel: &CancellationToken,
    ) -> StreamResult<PipelineStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let total = match plaintext_len {
            Some(n) => i64::try_from(n).map_err(|_| {
                StreamError::InvalidArgument(format!("plaintext length {n} too large"))
            })?,
            None => 0,
        };

        let file_key = generate_file_key();
        let wrapped = wrap_file_key(self.aead.as_ref(), &self.master, self.key_id, &file_key)?;
        let nonce_prefix = rand::thread_rng().next_u32();
        let header = FileHeader {
            total_plaintext_length: total,
            key_id: self.key_id,
            nonce_prefix,
            file_key_nonce: wrapped.nonce,
            file_key_tag: wrapped.tag,
            encrypted_file_key: wrapped.ciphertext,
        };
        output.write_all(&build_file_header(&header)).await?;

        let params = RunParams {
            key_id: self.key_id,
            nonce_prefix,
            threads: self.options.threads,
            window_cap: self.options.window_cap,
            chunk_limit: self.options.chunk_size,
            expected_total: plaintext_len,
            strict_length: self.options.strict_length,
            input_len: None,
        };
        let scope = self.scope(self.options.chunk_size)?;
        let result = encrypt::run(input, output, &file_key, &self.aead, &scope, &params, cancel).await;
        scope.dispose();
        result
    }

    /// Decrypt `input` into `output`.
    ///
    /// `input_len`, when known, is the total encoded length and enables
    /// truncation checks before each chunk is read.
    pub async fn decrypt<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        input_len: Option<u64>,
        cancel: &CancellationToken,
    ) -> StreamResult<PipelineStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let header = read_file_header(input).await?;
        if header.key_id != self.key_id {
            return Err(StreamError::KeyIdMismatch {
                expected: self.key_id,
                actual: header.key_id,
            });
        }
        let wrapped = WrappedFileKey {
            nonce: header.file_key_nonce,
            tag: header.file_key_tag,
            ciphertext: header.encrypted_file_key,
        };
        let file_key = unwrap_file_key(self.aead.as_ref(), &self.master, self.key_id, &wrapped)?;
        let expected_total = u64::try_from(header.total_plaintext_length)
            .ok()
            .filter(|&n| n > 0);
        debug!(
            key_id = header.key_id,
            total = header.total_plaintext_length,
            "file header accepted"
        );

        let params = RunParams {
            key_id: self.key_id,
            nonce_prefix: header.nonce_prefix,
            threads: self.options.threads,
            window_cap: self.options.window_cap,
            chunk_limit: self.options.max_chunk_size,
            expected_total,
            strict_length: self.options.strict_length,
            input_len: input_len.map(|n| n.saturating_sub(FILE_HEADER_LEN as u64)),
        };
        let scope = self.scope(self.options.max_chunk_size)?;
        let result = decrypt::run(input, output, &file_key, &self.aead, &scope, &params, cancel).await;
        scope.dispose();
        result
    }

    /// Encrypt on a background task and read the ciphertext back as a stream.
    pub fn encrypt_reader<R>(
        &self,
        mut input: R,
        plaintext_len: Option<u64>,
        cancel: &CancellationToken,
    ) -> PipelineReader
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let cipher = self.clone();
        PipelineReader::spawn(cancel, move |mut pipe, token| async move {
            cipher.encrypt(&mut input, &mut pipe, plaintext_len, &token).await
        })
    }

    /// Decrypt on a background task and read the plaintext back as a stream.
    pub fn decrypt_reader<R>(
        &self,
        mut input: R,
        input_len: Option<u64>,
        cancel: &CancellationToken,
    ) -> PipelineReader
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let cipher = self.clone();
        PipelineReader::spawn(cancel, move |mut pipe, token| async move {
            cipher.decrypt(&mut input, &mut pipe, input_len, &token).await
        })
    }

    /// Walk the stream's headers using this cipher's chunk limit.
    pub async fn inspect<R>(&self, input: &mut R) -> StreamResult<StreamLayout>
    where
        R: AsyncRead + Unpin,
    {
        inspect(input, self.options.max_chunk_size).await
    }

    fn scope(&self, buffer_len: usize) -> StreamResult<Arc<BufferScope>> {
        let limits = self.options.scope_limits(buffer_len);
        Ok(Arc::new(BufferScope::new(Arc::clone(&self.allocator), limits)?))
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCipher")
            .field("key_id", &self.key_id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Parse the file header and every chunk header, verifying positions and
/// lengths, without any key material. Chunk bodies are skipped.
pub async fn inspect<R>(input: &mut R, max_chunk_size: usize) -> StreamResult<StreamLayout>
where
    R: AsyncRead + Unpin,
{
    let header = read_file_header(input).await?;
    let mut layout = StreamLayout {
        header,
        chunks: 0,
        plaintext_bytes: 0,
        largest_chunk: 0,
        encoded_bytes: FILE_HEADER_LEN as u64,
    };

    while let Some(chunk) =
        read_chunk_header(input, layout.header.nonce_prefix, layout.chunks).await?
    {
        let index = layout.chunks;
        if chunk.key_id != layout.header.key_id {
            return Err(StreamError::KeyIdMismatch {
                expected: layout.header.key_id,
                actual: chunk.key_id,
            });
        }
        if chunk.plaintext_length <= 0 || chunk.plaintext_length as u64 > max_chunk_size as u64 {
            return Err(StreamError::InvalidChunkLength {
                index,
                length: chunk.plaintext_length,
                max: max_chunk_size,
            });
        }
        let len = chunk.plaintext_length as u64;
        let skipped = tokio::io::copy(&mut (&mut *input).take(len), &mut tokio::io::sink()).await?;
        if skipped < len {
            return Err(StreamError::Truncated { what: "chunk body" });
        }

        layout.chunks += 1;
        layout.plaintext_bytes += len;
        layout.largest_chunk = layout.largest_chunk.max(len);
        layout.encoded_bytes += CHUNK_HEADER_LEN as u64 + len;
    }
    Ok(layout)
}
