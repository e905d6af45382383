//! Binary layout of the encrypted stream.
//!
//! File header (once, at offset 0):
//! ```text
//! magic "CTN1" (4) | header_len i32 | total_plaintext_len i64 | key_id i32 |
//! nonce_prefix u32 | file_key_nonce (12) | file_key_tag (16) | encrypted_file_key (32)
//! ```
//!
//! Chunk header (repeated, followed by `plaintext_len` bytes of ciphertext):
//! ```text
//! magic "CTN1" (4) | header_len i32 | plaintext_len i64 | key_id i32 |
//! nonce (12) | tag (16)
//! ```
//!
//! The stream has no footer; it ends where no further chunk header can be
//! read. All integers are little-endian.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{StreamError, StreamResult};
use crate::tag::Tag128;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Format identifier shared by file and chunk headers.
pub const MAGIC: [u8; 4] = *b"CTN1";

/// AAD layout version.
pub const AAD_VERSION: i32 = 1;

/// Size of the associated data bound into every chunk tag.
pub const AAD_SIZE: usize = 32;

pub const FILE_HEADER_LEN: usize = compute_file_header_length(NONCE_SIZE, TAG_SIZE, KEY_SIZE);
pub const CHUNK_HEADER_LEN: usize = compute_chunk_header_length(NONCE_SIZE, TAG_SIZE);

/// magic + header_len
const PREFIX_LEN: usize = 8;

pub const fn compute_file_header_length(nonce_size: usize, tag_size: usize, key_size: usize) -> usize {
    4 + 4 + 8 + 4 + 4 + nonce_size + tag_size + key_size
}

pub const fn compute_chunk_header_length(nonce_size: usize, tag_size: usize) -> usize {
    4 + 4 + 8 + 4 + nonce_size + tag_size
}

/// Per-file header. `total_plaintext_length` is 0 when the writer did not
/// know the length up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub total_plaintext_length: i64,
    pub key_id: i32,
    pub nonce_prefix: u32,
    pub file_key_nonce: [u8; NONCE_SIZE],
    pub file_key_tag: Tag128,
    pub encrypted_file_key: [u8; KEY_SIZE],
}

/// Per-chunk header as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub plaintext_length: i64,
    pub key_id: i32,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: Tag128,
}

/// Nonce for chunk `chunk_index` of a file: `prefix (u32 LE) || index (u64 LE)`.
pub fn compose_nonce(nonce_prefix: u32, chunk_index: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&nonce_prefix.to_le_bytes());
    nonce[4..].copy_from_slice(&chunk_index.to_le_bytes());
    nonce
}

/// AAD binding a chunk to its key, position, and declared length:
/// `magic | version | key_id | chunk_index | plaintext_len | reserved(0)`.
pub fn build_aad(key_id: i32, chunk_index: u64, plaintext_length: u64) -> [u8; AAD_SIZE] {
    let mut aad = [0u8; AAD_SIZE];
    let mut w = FieldWriter::new(&mut aad);
    w.put(&MAGIC);
    w.put(&AAD_VERSION.to_le_bytes());
    w.put(&key_id.to_le_bytes());
    w.put(&chunk_index.to_le_bytes());
    w.put(&plaintext_length.to_le_bytes());
    w.put(&0i32.to_le_bytes());
    aad
}

pub fn build_file_header(header: &FileHeader) -> [u8; FILE_HEADER_LEN] {
    let mut out = [0u8; FILE_HEADER_LEN];
    let mut w = FieldWriter::new(&mut out);
    w.put(&MAGIC);
    w.put(&(FILE_HEADER_LEN as i32).to_le_bytes());
    w.put(&header.total_plaintext_length.to_le_bytes());
    w.put(&header.key_id.to_le_bytes());
    w.put(&header.nonce_prefix.to_le_bytes());
    w.put(&header.file_key_nonce);
    w.put(&header.file_key_tag.to_bytes());
    w.put(&header.encrypted_file_key);
    out
}

/// Encode the header for chunk `chunk_index`. The nonce is derived here, not
/// taken from the caller, so a writer cannot emit a header whose nonce
/// disagrees with its position.
pub fn build_chunk_header(
    key_id: i32,
    nonce_prefix: u32,
    chunk_index: u64,
    tag: &Tag128,
    plaintext_length: usize,
) -> [u8; CHUNK_HEADER_LEN] {
    let mut out = [0u8; CHUNK_HEADER_LEN];
    let mut w = FieldWriter::new(&mut out);
    w.put(&MAGIC);
    w.put(&(CHUNK_HEADER_LEN as i32).to_le_bytes());
    w.put(&(plaintext_length as i64).to_le_bytes());
    w.put(&key_id.to_le_bytes());
    w.put(&compose_nonce(nonce_prefix, chunk_index));
    w.put(&tag.to_bytes());
    out
}

/// Read and validate the file header. Magic and header length are checked
/// before any other field is trusted.
pub async fn read_file_header<R>(input: &mut R) -> StreamResult<FileHeader>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; FILE_HEADER_LEN];
    read_exactly(input, &mut buf[..PREFIX_LEN], "file header").await?;
    check_prefix(&buf, FILE_HEADER_LEN, "file header")?;
    read_exactly(input, &mut buf[PREFIX_LEN..], "file header").await?;

    let mut r = FieldReader::new(&buf[PREFIX_LEN..]);
    Ok(FileHeader {
        total_plaintext_length: i64::from_le_bytes(r.take()),
        key_id: i32::from_le_bytes(r.take()),
        nonce_prefix: u32::from_le_bytes(r.take()),
        file_key_nonce: r.take(),
        file_key_tag: Tag128::from_bytes(&r.take()),
        encrypted_file_key: r.take(),
    })
}

/// Read the next chunk header, expecting it to be chunk `expected_index`.
///
/// Returns `Ok(None)` on a clean end of stream at a chunk boundary. A partial
/// header is a truncation error. The transmitted nonce is compared against
/// the one derived from `(nonce_prefix, expected_index)` so reordered or
/// spliced chunks fail here, before any AEAD work.
pub async fn read_chunk_header<R>(
    input: &mut R,
    nonce_prefix: u32,
    expected_index: u64,
) -> StreamResult<Option<ChunkHeader>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; CHUNK_HEADER_LEN];
    let filled = read_fill(input, &mut buf).await?;
    if filled == 0 {
        return Ok(None);
    }
    if filled < CHUNK_HEADER_LEN {
        return Err(StreamError::Truncated {
            what: "chunk header",
        });
    }
    check_prefix(&buf, CHUNK_HEADER_LEN, "chunk header")?;

    let mut r = FieldReader::new(&buf[PREFIX_LEN..]);
    let header = ChunkHeader {
        plaintext_length: i64::from_le_bytes(r.take()),
        key_id: i32::from_le_bytes(r.take()),
        nonce: r.take(),
        tag: Tag128::from_bytes(&r.take()),
    };

    if header.nonce != compose_nonce(nonce_prefix, expected_index) {
        return Err(StreamError::NonceMismatch {
            index: expected_index,
        });
    }
    Ok(Some(header))
}

/// Fill `buf` completely or fail with a truncation error naming `what`.
pub async fn read_exactly<R>(input: &mut R, buf: &mut [u8], what: &'static str) -> StreamResult<()>
where
    R: AsyncRead + Unpin,
{
    let filled = read_fill(input, buf).await?;
    if filled < buf.len() {
        return Err(StreamError::Truncated { what });
    }
    Ok(())
}

/// Read until `buf` is full or the stream ends; returns the bytes read.
pub async fn read_fill<R>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn check_prefix(buf: &[u8], expected_len: usize, what: &'static str) -> StreamResult<()> {
    let mut r = FieldReader::new(buf);
    let magic: [u8; 4] = r.take();
    if magic != MAGIC {
        return Err(StreamError::BadMagic { what });
    }
    let header_len = i32::from_le_bytes(r.take());
    if header_len != expected_len as i32 {
        return Err(StreamError::HeaderLength {
            what,
            expected: expected_len as i32,
            actual: header_len,
        });
    }
    Ok(())
}

/// Sequential fixed-width field encoder over a pre-sized buffer.
struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

/// Sequential fixed-width field decoder; layouts are constant so the
/// offsets always fit.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }
}
