//! Error taxonomy for the streaming engine.

use thiserror::Error;

pub type StreamResult<T> = Result<T, StreamError>;

/// Coarse classification of a [`StreamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The container is malformed, reordered, or hostile.
    Format,
    /// AEAD verification failed: wrong key or tampered bytes.
    Authentication,
    /// The stream ended early, or the total length disagrees with the header.
    Truncation,
    /// A buffer scope limit was hit or the scope was already torn down.
    Resource,
    /// The run was cancelled through its token.
    Cancelled,
    /// The underlying reader or writer failed.
    Io,
    /// The caller passed invalid arguments or options.
    Usage,
    /// A pipeline stage died unexpectedly.
    Internal,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{what}: magic header not found")]
    BadMagic { what: &'static str },

    #[error("{what}: unexpected header length {actual} (expected {expected})")]
    HeaderLength {
        what: &'static str,
        expected: i32,
        actual: i32,
    },

    #[error("chunk {index}: invalid length {length} (allowed 1..={max})")]
    InvalidChunkLength { index: u64, length: i64, max: usize },

    #[error("key id mismatch: expected {expected}, found {actual}")]
    KeyIdMismatch { expected: i32, actual: i32 },

    #[error("chunk {index}: nonce does not match its position in the stream")]
    NonceMismatch { index: u64 },

    #[error("duplicate chunk index {index} (next expected {next})")]
    DuplicateChunk { index: u64, next: u64 },

    #[error("reorder slot {slot} for chunk {index} already holds chunk {occupant}")]
    SlotCollision {
        slot: usize,
        index: u64,
        occupant: u64,
    },

    #[error("chunk {index} arrived {distance} chunks ahead of the write cursor (window cap {cap})")]
    WindowExceeded { index: u64, distance: u64, cap: usize },

    #[error("output missing chunks: {buffered} chunk(s) buffered beyond index {next}")]
    MissingChunks { next: u64, buffered: usize },

    #[error("chunk counter exhausted: a stream holds at most 2^64-1 chunks")]
    ChunkCounterExhausted,

    #[error("authentication tag mismatch {}", auth_scope(.chunk))]
    AuthenticationFailed { chunk: Option<u64> },

    #[error("unexpected end of stream while reading {what}")]
    Truncated { what: &'static str },

    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error(
        "buffer scope limit exceeded: {count} buffers / {bytes} bytes \
         (max {max_count} / {max_bytes})"
    )]
    ResourceLimit {
        count: usize,
        bytes: u64,
        max_count: usize,
        max_bytes: u64,
    },

    #[error("buffer scope already disposed")]
    ScopeDisposed,

    #[error("buffer length must be positive")]
    InvalidBufferLength,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline failure: {0}")]
    Internal(String),
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadMagic { .. }
            | Self::HeaderLength { .. }
            | Self::InvalidChunkLength { .. }
            | Self::KeyIdMismatch { .. }
            | Self::NonceMismatch { .. }
            | Self::DuplicateChunk { .. }
            | Self::SlotCollision { .. }
            | Self::WindowExceeded { .. }
            | Self::MissingChunks { .. }
            | Self::ChunkCounterExhausted => ErrorKind::Format,
            Self::AuthenticationFailed { .. } => ErrorKind::Authentication,
            Self::Truncated { .. } | Self::LengthMismatch { .. } => ErrorKind::Truncation,
            Self::ResourceLimit { .. } | Self::ScopeDisposed | Self::InvalidBufferLength => {
                ErrorKind::Resource
            }
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::InvalidArgument(_) => ErrorKind::Usage,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Recover a `StreamError` that was carried through an `io::Error`.
    pub fn from_io(err: std::io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<StreamError>()) {
            return Self::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<StreamError>()) {
            Some(Ok(stream)) => *stream,
            Some(Err(other)) => Self::Internal(other.to_string()),
            None => Self::Internal("empty io error".into()),
        }
    }
}

fn auth_scope(chunk: &Option<u64>) -> String {
    match chunk {
        Some(index) => format!("in chunk {index}"),
        None => "on file key".to_string(),
    }
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            ErrorKind::Format | ErrorKind::Authentication => Io::InvalidData,
            ErrorKind::Truncation => Io::UnexpectedEof,
            ErrorKind::Cancelled => Io::Interrupted,
            ErrorKind::Resource => Io::OutOfMemory,
            ErrorKind::Usage => Io::InvalidInput,
            ErrorKind::Io | ErrorKind::Internal => Io::Other,
        };
        match err {
            StreamError::Io(inner) => inner,
            other => std::io::Error::new(kind, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            StreamError::NonceMismatch { index: 3 }.kind(),
            ErrorKind::Format
        );
        assert_eq!(
            StreamError::AuthenticationFailed { chunk: Some(1) }.kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            StreamError::Truncated { what: "chunk header" }.kind(),
            ErrorKind::Truncation
        );
        assert_eq!(StreamError::ScopeDisposed.kind(), ErrorKind::Resource);
        assert_eq!(StreamError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_io_roundtrip_preserves_variant() {
        let io: std::io::Error = StreamError::AuthenticationFailed { chunk: Some(4) }.into();
        assert_eq!(io.kind(), std::io::ErrorKind::InvalidData);

        let back = StreamError::from_io(io);
        assert!(matches!(
            back,
            StreamError::AuthenticationFailed { chunk: Some(4) }
        ));
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = StreamError::from_io(io);
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_auth_message_names_chunk() {
        let msg = StreamError::AuthenticationFailed { chunk: Some(2) }.to_string();
        assert!(msg.contains("chunk 2"), "{msg}");
        let msg = StreamError::AuthenticationFailed { chunk: None }.to_string();
        assert!(msg.contains("file key"), "{msg}");
    }
}
