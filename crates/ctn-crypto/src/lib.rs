//! ctn-crypto: chunked, parallel, authenticated stream encryption
//!
//! Architecture: Chunk-then-Seal, one AEAD context per worker
//!
//! Pipeline: input → producer (fixed-size chunks) → N workers (AEAD) → reorder window → output
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, raw or HKDF-derived from a secret)
//!   └── File Key (per-file, 256-bit random, sealed by the master key into the file header)
//!       └── Chunk AEAD: AES-256-GCM | ChaCha20-Poly1305
//!           nonce = nonce_prefix(u32) || chunk_index(u64)
//!           AAD   = magic || version || key_id || chunk_index || plaintext_len || 0
//! ```
//!
//! Every buffer a run touches is rented from a [`BufferScope`] that caps the
//! run's outstanding count and bytes and returns each buffer to the
//! underlying [`BufferAllocator`] exactly once.

pub mod aead;
pub mod allocator;
pub mod cipher;
pub mod error;
pub mod format;
pub mod keys;
pub mod pipeline;
pub mod reader;
pub mod reorder;
pub mod scope;
pub mod tag;

pub use aead::{AeadFactory, ChunkAead, CipherSuite};
pub use allocator::{BufferAllocator, HeapAllocator, SharedBufferPool};
pub use cipher::{StreamCipher, StreamLayout, StreamOptions};
pub use error::{ErrorKind, StreamError, StreamResult};
pub use format::{build_aad, compose_nonce, ChunkHeader, FileHeader};
pub use keys::{derive_subkey, generate_file_key, FileKey, MasterKey};
pub use pipeline::PipelineStats;
pub use reader::PipelineReader;
pub use scope::{BufferScope, PooledBuffer, ScopeLimits};
pub use tag::Tag128;

/// Size of a master or file key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a chunk nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of an AEAD authentication tag
pub const TAG_SIZE: usize = 16;

/// Smallest chunk size accepted when encrypting
pub const MIN_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk size accepted in either direction
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Default chunk size when encrypting
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
