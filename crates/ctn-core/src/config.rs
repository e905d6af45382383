use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CtnError, CtnResult};

/// Top-level configuration (loaded from ctn.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CtnConfig {
    pub log: LogConfig,
    pub crypto: CryptoConfig,
}

impl CtnConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> CtnResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| CtnError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> CtnResult<Self> {
        toml::from_str(content).map_err(|e| CtnError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Streaming AEAD engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Key id recorded in every file and chunk header (must be > 0)
    pub key_id: i32,
    /// AEAD cipher: "aes-256-gcm" or "chacha20-poly1305"
    pub cipher: String,
    /// Worker count per pipeline run (0 = available parallelism)
    pub threads: usize,
    /// Plaintext bytes per chunk when encrypting (default: 1 MiB)
    pub chunk_size: usize,
    /// Largest chunk accepted when decrypting (default: 16 MiB)
    pub max_chunk_size: usize,
    /// Upper bound on the reorder window, in chunks
    pub window_cap: usize,
    /// Fail when the bytes produced differ from the length in the file header
    pub strict_length: bool,
    /// Override for the per-run buffer count limit
    pub scope_max_buffers: Option<usize>,
    /// Override for the per-run buffer byte limit
    pub scope_max_bytes: Option<u64>,
    /// Path to the base64-encoded 32-byte master key
    pub master_key_file: Option<PathBuf>,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_id: 1,
            cipher: "aes-256-gcm".into(),
            threads: 0,
            chunk_size: 1024 * 1024,
            max_chunk_size: 16 * 1024 * 1024,
            window_cap: 128,
            strict_length: true,
            scope_max_buffers: None,
            scope_max_bytes: None,
            master_key_file: None,
        }
    }
}
