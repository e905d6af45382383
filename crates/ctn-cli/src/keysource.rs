//! Master key resolution: key file, base64 environment value, or an
//! HKDF-derived key from a secret string.

use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ctn_core::CtnError;
use ctn_crypto::{derive_subkey, MasterKey, KEY_SIZE};
use zeroize::Zeroizing;

/// HKDF purpose label for keys derived from `--secret`.
const SECRET_PURPOSE: &str = "master-key";

/// Where the master key came from, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    File,
    Environment,
    Secret,
}

/// Pick the master key from the first source present: key file, encoded
/// key, then secret.
pub fn resolve(
    key_file: Option<&Path>,
    encoded: Option<&str>,
    secret: Option<&str>,
) -> Result<(MasterKey, KeyOrigin)> {
    if let Some(path) = key_file {
        let raw = Zeroizing::new(
            std::fs::read(path).with_context(|| format!("reading key file {}", path.display()))?,
        );
        let key = parse_key_material(&raw)
            .with_context(|| format!("parsing key file {}", path.display()))?;
        return Ok((key, KeyOrigin::File));
    }
    if let Some(encoded) = encoded {
        let key = decode_key(encoded).context("decoding CTN_MASTER_KEY")?;
        return Ok((key, KeyOrigin::Environment));
    }
    if let Some(secret) = secret {
        let key = derive_subkey(secret.as_bytes(), SECRET_PURPOSE)?;
        return Ok((key, KeyOrigin::Secret));
    }
    Err(CtnError::Key(
        "no master key: pass --key-file, set CTN_MASTER_KEY, or pass --secret".into(),
    )
    .into())
}

/// A key file holds either the raw key bytes or their base64 text.
pub fn parse_key_material(raw: &[u8]) -> Result<MasterKey> {
    if raw.len() == KEY_SIZE {
        return Ok(MasterKey::from_slice(raw)?);
    }
    let text = std::str::from_utf8(raw).context("key file is neither raw bytes nor base64 text")?;
    decode_key(text)
}

pub fn decode_key(text: &str) -> Result<MasterKey> {
    let bytes = Zeroizing::new(
        STANDARD
            .decode(text.trim())
            .map_err(|e| CtnError::Key(format!("invalid base64: {e}")))?,
    );
    MasterKey::from_slice(&bytes).map_err(|e| CtnError::Key(e.to_string()).into())
}

pub fn encode_key(key: &MasterKey) -> Zeroizing<String> {
    Zeroizing::new(STANDARD.encode(key.as_bytes()))
}
