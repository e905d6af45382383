//! AEAD primitives behind the chunk pipeline.
//!
//! Workers never share a cipher instance: an [`AeadFactory`] builds one
//! [`ChunkAead`] context per worker from the file key. Both built-in suites
//! use a 96-bit nonce, a 128-bit tag and a 256-bit key, and both transform
//! the chunk buffer in place with a detached tag, so ciphertext length always
//! equals plaintext length.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::consts::{U12, U16};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::StreamError;
use crate::tag::Tag128;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Opaque AEAD failure. On `open` this means the tag did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AeadFailure;

impl fmt::Display for AeadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("aead operation failed")
    }
}

impl std::error::Error for AeadFailure {}

/// One keyed AEAD context, owned by a single worker.
pub trait ChunkAead: Send {
    /// Encrypt `buf` in place and return the detached tag.
    fn seal(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], buf: &mut [u8]) -> Result<Tag128, AeadFailure>;

    /// Verify `tag` and decrypt `buf` in place. On failure `buf` holds no
    /// usable plaintext.
    fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buf: &mut [u8],
        tag: &Tag128,
    ) -> Result<(), AeadFailure>;
}

/// Builds per-worker AEAD contexts from raw key bytes.
pub trait AeadFactory: Send + Sync {
    fn context(&self, key: &[u8; KEY_SIZE]) -> Box<dyn ChunkAead>;
}

/// Built-in cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CipherSuite {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherSuite {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherSuite {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" => Ok(Self::Aes256Gcm),
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Self::ChaCha20Poly1305),
            other => Err(StreamError::InvalidArgument(format!(
                "unknown cipher suite: {other}"
            ))),
        }
    }
}

impl AeadFactory for CipherSuite {
    fn context(&self, key: &[u8; KEY_SIZE]) -> Box<dyn ChunkAead> {
        let key = GenericArray::from_slice(key);
        match self {
            Self::Aes256Gcm => Box::new(InPlace(Aes256Gcm::new(key))),
            Self::ChaCha20Poly1305 => Box::new(InPlace(ChaCha20Poly1305::new(key))),
        }
    }
}

/// Adapter from a RustCrypto in-place AEAD to [`ChunkAead`].
struct InPlace<C>(C);

impl<C> ChunkAead for InPlace<C>
where
    C: AeadInPlace<NonceSize = U12, TagSize = U16> + Send,
{
    fn seal(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], buf: &mut [u8]) -> Result<Tag128, AeadFailure> {
        let tag = self
            .0
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf)
            .map_err(|_| AeadFailure)?;
        let mut bytes = [0u8; TAG_SIZE];
        bytes.copy_from_slice(&tag);
        Ok(Tag128::from_bytes(&bytes))
    }

    fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buf: &mut [u8],
        tag: &Tag128,
    ) -> Result<(), AeadFailure> {
        let tag = tag.to_bytes();
        self.0
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                aad,
                buf,
                GenericArray::from_slice(&tag),
            )
            .map_err(|_| AeadFailure)
    }
}
