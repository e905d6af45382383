//! ctn: chunked authenticated stream encryption CLI
//!
//! Commands:
//!   encrypt <in> <out>   - encrypt a file into the CTN1 stream format
//!   decrypt <in> <out>   - decrypt and verify a CTN1 stream
//!   inspect <in>         - walk the headers of a CTN1 stream (no key needed)
//!   keygen <out>         - write a fresh random master key (base64)
//!   config show          - display the active configuration

mod keysource;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ctn_core::{CryptoConfig, CtnConfig};
use ctn_crypto::{PipelineStats, StreamCipher, StreamResult, MAX_CHUNK_SIZE};
use tokio::fs::{File, OpenOptions};
use tokio::io::{BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// I/O buffer between the pipelines and the filesystem.
const IO_BUFFER: usize = 1024 * 1024;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "ctn",
    version,
    about = "Chunked authenticated stream encryption",
    long_about = "ctn: encrypt and decrypt files with parallel, chunked AEAD (CTN1 format)"
)]
struct Cli {
    /// Path to ctn.toml configuration file
    #[arg(long, short = 'c', env = "CTN_CONFIG", default_value = "/etc/ctn/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "CTN_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "CTN_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file
    Encrypt {
        input: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
        #[command(flatten)]
        tuning: TuningArgs,
        /// Overwrite the output if it exists
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Decrypt and verify a file
    Decrypt {
        input: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
        #[command(flatten)]
        tuning: TuningArgs,
        /// Overwrite the output if it exists
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Show the header and chunk layout of an encrypted file
    Inspect { input: PathBuf },

    /// Generate a random master key
    Keygen {
        /// Where to write the base64-encoded key
        output: PathBuf,
        /// Overwrite the output if it exists
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Args, Debug)]
struct KeyArgs {
    /// File holding the master key (raw 32 bytes or base64)
    #[arg(long, env = "CTN_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Base64 master key
    #[arg(long, env = "CTN_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// Secret string the master key is derived from (HKDF-SHA256)
    #[arg(long, env = "CTN_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

#[derive(Args, Debug)]
struct TuningArgs {
    /// Key id recorded in the headers
    #[arg(long)]
    key_id: Option<i32>,

    /// AEAD cipher (aes-256-gcm, chacha20-poly1305)
    #[arg(long)]
    cipher: Option<String>,

    /// Worker tasks (0 = available parallelism)
    #[arg(long, short = 'j')]
    threads: Option<usize>,

    /// Plaintext bytes per chunk when encrypting
    #[arg(long)]
    chunk_size: Option<usize>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // No subscriber exists yet, so the missing-file fallback is logged below.
    let (config, defaulted) = load_config(&cli.config)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = match &cli.log_format {
        Some(format) => format.clone(),
        None => LogFormat::from_str(&config.log.format, true)
            .map_err(|e| anyhow::anyhow!("config log.format: {e}"))?,
    };
    init_logging(&level, &format);
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "ctn starting"
    );
    if defaulted {
        warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    match cli.command {
        Commands::Encrypt {
            input,
            output,
            key,
            tuning,
            force,
        } => {
            let cipher = build_cipher(&config, &key, &tuning)?;
            cmd_encrypt(&cipher, &input, &output, force).await
        }
        Commands::Decrypt {
            input,
            output,
            key,
            tuning,
            force,
        } => {
            let cipher = build_cipher(&config, &key, &tuning)?;
            cmd_decrypt(&cipher, &input, &output, force).await
        }
        Commands::Inspect { input } => cmd_inspect(&config.crypto, &input).await,
        Commands::Keygen { output, force } => cmd_keygen(&output, force),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

/// Load the config file; the flag reports whether defaults were used
/// because the file does not exist.
fn load_config(path: &Path) -> Result<(CtnConfig, bool)> {
    let defaulted = !path.exists();
    let config =
        CtnConfig::load(path).with_context(|| format!("loading config {}", path.display()))?;
    Ok((config, defaulted))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output; logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn build_cipher(config: &CtnConfig, key: &KeyArgs, tuning: &TuningArgs) -> Result<StreamCipher> {
    let crypto = apply_tuning(&config.crypto, tuning);
    // the configured key file is only a fallback for explicit key arguments
    let explicit = key.master_key.is_some() || key.secret.is_some();
    let key_file = key
        .key_file
        .as_deref()
        .or_else(|| crypto.master_key_file.as_deref().filter(|_| !explicit));
    let (master, origin) =
        keysource::resolve(key_file, key.master_key.as_deref(), key.secret.as_deref())?;
    debug!(?origin, key_id = crypto.key_id, cipher = %crypto.cipher, "master key loaded");

    StreamCipher::from_config(master, &crypto).context("invalid crypto settings")
}

fn apply_tuning(base: &CryptoConfig, tuning: &TuningArgs) -> CryptoConfig {
    let mut crypto = base.clone();
    if let Some(key_id) = tuning.key_id {
        crypto.key_id = key_id;
    }
    if let Some(cipher) = &tuning.cipher {
        crypto.cipher = cipher.clone();
    }
    if let Some(threads) = tuning.threads {
        crypto.threads = threads;
    }
    if let Some(chunk_size) = tuning.chunk_size {
        crypto.chunk_size = chunk_size;
    }
    crypto
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            token.cancel();
        }
    });
}

async fn create_output(path: &Path, force: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    options
        .open(path)
        .await
        .with_context(|| format!("creating {}", path.display()))
}

/// Remove a partially written output after a failed run.
async fn discard_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial output"),
    }
}

async fn finish_run(
    result: StreamResult<PipelineStats>,
    output: BufWriter<File>,
    path: &Path,
    verb: &str,
) -> Result<PipelineStats> {
    match result {
        Ok(stats) => {
            let file = output.into_inner();
            file.sync_all()
                .await
                .with_context(|| format!("syncing {}", path.display()))?;
            Ok(stats)
        }
        Err(e) => {
            drop(output);
            discard_output(path).await;
            Err(anyhow::Error::new(e).context(format!("{verb} failed ({})", path.display())))
        }
    }
}

// ── `ctn encrypt` ─────────────────────────────────────────────────────────────

async fn cmd_encrypt(cipher: &StreamCipher, input: &Path, output: &Path, force: bool) -> Result<()> {
    let len = tokio::fs::metadata(input)
        .await
        .with_context(|| format!("stat {}", input.display()))?
        .len();
    let src = File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;
    let mut src = BufReader::with_capacity(IO_BUFFER, src);
    let mut dst = BufWriter::with_capacity(IO_BUFFER, create_output(output, force).await?);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let started = Instant::now();
    let result = cipher.encrypt(&mut src, &mut dst, Some(len), &cancel).await;
    let stats = finish_run(result, dst, output, "encryption").await?;

    info!(
        input = %input.display(),
        output = %output.display(),
        chunks = stats.chunks,
        bytes = stats.bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "encrypted"
    );
    println!(
        "Encrypted {} → {} ({}, {} chunks)",
        input.display(),
        output.display(),
        fmt_bytes(stats.bytes),
        stats.chunks
    );
    Ok(())
}

// ── `ctn decrypt` ─────────────────────────────────────────────────────────────

async fn cmd_decrypt(cipher: &StreamCipher, input: &Path, output: &Path, force: bool) -> Result<()> {
    let len = tokio::fs::metadata(input)
        .await
        .with_context(|| format!("stat {}", input.display()))?
        .len();
    let src = File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;
    let mut src = BufReader::with_capacity(IO_BUFFER, src);
    let mut dst = BufWriter::with_capacity(IO_BUFFER, create_output(output, force).await?);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let started = Instant::now();
    let result = cipher.decrypt(&mut src, &mut dst, Some(len), &cancel).await;
    let stats = finish_run(result, dst, output, "decryption").await?;

    info!(
        input = %input.display(),
        output = %output.display(),
        chunks = stats.chunks,
        bytes = stats.bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "decrypted"
    );
    println!(
        "Decrypted {} → {} ({}, {} chunks)",
        input.display(),
        output.display(),
        fmt_bytes(stats.bytes),
        stats.chunks
    );
    Ok(())
}

// ── `ctn inspect` ─────────────────────────────────────────────────────────────

async fn cmd_inspect(crypto: &CryptoConfig, input: &Path) -> Result<()> {
    let src = File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;
    let mut src = BufReader::with_capacity(IO_BUFFER, src);
    let max_chunk = crypto.max_chunk_size.clamp(1, MAX_CHUNK_SIZE);
    let layout = ctn_crypto::cipher::inspect(&mut src, max_chunk)
        .await
        .with_context(|| format!("inspecting {}", input.display()))?;

    let header = &layout.header;
    println!("File: {}", input.display());
    println!("  key id:        {}", header.key_id);
    println!("  nonce prefix:  {:08x}", header.nonce_prefix);
    match header.total_plaintext_length {
        n if n > 0 => println!("  declared size: {}", fmt_bytes(n as u64)),
        _ => println!("  declared size: unknown"),
    }
    println!("  chunks:        {}", layout.chunks);
    println!("  plaintext:     {}", fmt_bytes(layout.plaintext_bytes));
    println!("  largest chunk: {}", fmt_bytes(layout.largest_chunk));
    println!("  encoded size:  {}", fmt_bytes(layout.encoded_bytes));
    if header.total_plaintext_length > 0
        && header.total_plaintext_length as u64 != layout.plaintext_bytes
    {
        println!("  WARNING: chunk lengths do not add up to the declared size");
    }
    Ok(())
}

// ── `ctn keygen` ──────────────────────────────────────────────────────────────

fn cmd_keygen(output: &Path, force: bool) -> Result<()> {
    use std::io::Write;

    let key = ctn_crypto::MasterKey::generate();
    let encoded = keysource::encode_key(&key);

    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(output)
        .with_context(|| format!("creating {}", output.display()))?;
    file.write_all(encoded.as_bytes())
        .and_then(|()| file.write_all(b"\n"))
        .and_then(|()| file.sync_all())
        .with_context(|| format!("writing {}", output.display()))?;

    println!("Wrote master key to {}", output.display());
    Ok(())
}

// ── `ctn config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &CtnConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
