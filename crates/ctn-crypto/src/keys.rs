//! Key hierarchy: master key → per-file key, file key wrapping, subkey derivation

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::aead::AeadFactory;
use crate::error::{StreamError, StreamResult};
use crate::format::{build_aad, compose_nonce};
use crate::tag::Tag128;
use crate::{KEY_SIZE, NONCE_SIZE};

/// Chunk index reserved for the file key's AAD. The chunk counter stops
/// one short of it, so no chunk can ever share the wrap nonce's AAD.
pub const FILE_KEY_INDEX: u64 = u64::MAX;

/// A 256-bit master key. Zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build from a slice, which must be exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> StreamResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            StreamError::InvalidArgument(format!(
                "master key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Fresh random master key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A per-file 256-bit encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit file encryption key.
pub fn generate_file_key() -> FileKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    FileKey::from_bytes(bytes)
}

/// A file key sealed under the master key, as carried in the file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedFileKey {
    pub nonce: [u8; NONCE_SIZE],
    pub tag: Tag128,
    pub ciphertext: [u8; KEY_SIZE],
}

/// Seal `file_key` under `master`.
///
/// The nonce is composed from a random prefix and a random counter, and the
/// AAD binds the wrap to `key_id` at the reserved [`FILE_KEY_INDEX`].
pub fn wrap_file_key(
    aead: &dyn AeadFactory,
    master: &MasterKey,
    key_id: i32,
    file_key: &FileKey,
) -> StreamResult<WrappedFileKey> {
    let mut rng = rand::thread_rng();
    let nonce = compose_nonce(rng.next_u32(), rng.next_u64());
    let aad = build_aad(key_id, FILE_KEY_INDEX, KEY_SIZE as u64);

    let mut ciphertext = *file_key.as_bytes();
    let tag = aead
        .context(master.as_bytes())
        .seal(&nonce, &aad, &mut ciphertext)
        .map_err(|e| {
            ciphertext.zeroize();
            StreamError::Internal(format!("file key wrapping failed: {e}"))
        })?;

    Ok(WrappedFileKey {
        nonce,
        tag,
        ciphertext,
    })
}

/// Open a wrapped file key. A wrong master key, wrong key id, or tampered
/// header all surface as [`StreamError::AuthenticationFailed`] with no chunk.
pub fn unwrap_file_key(
    aead: &dyn AeadFactory,
    master: &MasterKey,
    key_id: i32,
    wrapped: &WrappedFileKey,
) -> StreamResult<FileKey> {
    let aad = build_aad(key_id, FILE_KEY_INDEX, KEY_SIZE as u64);
    let mut bytes = wrapped.ciphertext;
    if aead
        .context(master.as_bytes())
        .open(&wrapped.nonce, &aad, &mut bytes, &wrapped.tag)
        .is_err()
    {
        bytes.zeroize();
        return Err(StreamError::AuthenticationFailed { chunk: None });
    }
    Ok(FileKey::from_bytes(bytes))
}

/// Derive a purpose-bound 256-bit key from a high-entropy secret via
/// HKDF-SHA256. Not a password hash: low-entropy input stays low-entropy.
pub fn derive_subkey(secret: &[u8], purpose: &str) -> StreamResult<MasterKey> {
    if secret.is_empty() {
        return Err(StreamError::InvalidArgument(
            "cannot derive a key from an empty secret".into(),
        ));
    }
    let info = format!("ctn/{purpose}");
    let hkdf = Hkdf::<Sha256>::new(None, secret);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info.as_bytes(), &mut okm)
        .map_err(|e| StreamError::Internal(format!("HKDF expand failed: {e}")))?;
    Ok(MasterKey::from_bytes(okm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::CipherSuite;

    fn test_master_key() -> MasterKey {
        MasterKey::from_bytes([42u8; KEY_SIZE])
    }

    #[test]
    fn test_file_key_generation() {
        let k1 = generate_file_key();
        let k2 = generate_file_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_key_wrap_unwrap_roundtrip() {
        for suite in [CipherSuite::Aes256Gcm, CipherSuite::ChaCha20Poly1305] {
            let master = test_master_key();
            let file_key = generate_file_key();

            let wrapped = wrap_file_key(&suite, &master, 7, &file_key).unwrap();
            assert_ne!(&wrapped.ciphertext, file_key.as_bytes());

            let unwrapped = unwrap_file_key(&suite, &master, 7, &wrapped).unwrap();
            assert_eq!(file_key.as_bytes(), unwrapped.as_bytes());
        }
    }

    #[test]
    fn test_key_unwrap_wrong_master() {
        let suite = CipherSuite::default();
        let master1 = MasterKey::from_bytes([1u8; KEY_SIZE]);
        let master2 = MasterKey::from_bytes([2u8; KEY_SIZE]);

        let wrapped = wrap_file_key(&suite, &master1, 1, &generate_file_key()).unwrap();
        let err = unwrap_file_key(&suite, &master2, 1, &wrapped).unwrap_err();
        assert!(matches!(
            err,
            StreamError::AuthenticationFailed { chunk: None }
        ));
    }

    #[test]
    fn test_key_unwrap_wrong_key_id() {
        let suite = CipherSuite::default();
        let master = test_master_key();
        let wrapped = wrap_file_key(&suite, &master, 1, &generate_file_key()).unwrap();
        assert!(unwrap_file_key(&suite, &master, 2, &wrapped).is_err());
    }

    #[test]
    fn test_wrap_nonces_differ() {
        let suite = CipherSuite::default();
        let master = test_master_key();
        let file_key = generate_file_key();
        let a = wrap_file_key(&suite, &master, 1, &file_key).unwrap();
        let b = wrap_file_key(&suite, &master, 1, &file_key).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_master_key_from_slice() {
        assert!(MasterKey::from_slice(&[0u8; 31]).is_err());
        assert!(MasterKey::from_slice(&[0u8; 33]).is_err());
        let key = MasterKey::from_slice(&[5u8; KEY_SIZE]).unwrap();
        assert_eq!(key.as_bytes(), &[5u8; KEY_SIZE]);
    }

    #[test]
    fn test_derive_subkey_domains() {
        let a = derive_subkey(b"correct horse battery staple", "master").unwrap();
        let b = derive_subkey(b"correct horse battery staple", "master").unwrap();
        let c = derive_subkey(b"correct horse battery staple", "other").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes(), "derivation is deterministic");
        assert_ne!(a.as_bytes(), c.as_bytes(), "purposes are domain-separated");
        assert!(derive_subkey(b"", "master").is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let dbg = format!("{:?} {:?}", test_master_key(), generate_file_key());
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("42"));
    }
}
