//! Hostile and damaged inputs: every failure must be classified, never
//! silently produce wrong plaintext.

use std::sync::Arc;
use std::time::Duration;

use ctn_crypto::aead::{AeadFailure, AeadFactory, ChunkAead};
use ctn_crypto::{
    CipherSuite, ErrorKind, MasterKey, StreamCipher, StreamError, StreamOptions, Tag128, KEY_SIZE,
    MIN_CHUNK_SIZE, NONCE_SIZE,
};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

const CHUNK: usize = MIN_CHUNK_SIZE;
const FILE_HEADER: usize = 84;
const CHUNK_HEADER: usize = 48;
/// Three chunks: two full, one of 10 bytes.
const PLAINTEXT_LEN: usize = 2 * CHUNK + 10;

fn cipher() -> StreamCipher {
    cipher_with(StreamOptions {
        chunk_size: CHUNK,
        threads: 3,
        ..StreamOptions::default()
    })
}

fn cipher_with(options: StreamOptions) -> StreamCipher {
    StreamCipher::new(MasterKey::from_bytes([42u8; KEY_SIZE]), 7)
        .unwrap()
        .with_options(options)
        .unwrap()
}

fn plaintext() -> Vec<u8> {
    (0..PLAINTEXT_LEN).map(|i| (i % 251) as u8).collect()
}

/// Offset of chunk `index` in a stream of full-size chunks.
fn chunk_offset(index: usize) -> usize {
    FILE_HEADER + index * (CHUNK_HEADER + CHUNK)
}

async fn encoded() -> Vec<u8> {
    let plain = plaintext();
    let mut out = Vec::new();
    cipher()
        .encrypt(
            &mut &plain[..],
            &mut out,
            Some(plain.len() as u64),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    out
}

async fn try_decrypt(cipher: &StreamCipher, encoded: &[u8]) -> Result<Vec<u8>, StreamError> {
    let mut out = Vec::new();
    cipher
        .decrypt(&mut &encoded[..], &mut out, None, &CancellationToken::new())
        .await
        .map(|_| out)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flipped_ciphertext_bit_is_authentication_failure() {
    let original = encoded().await;
    for (chunk, offset) in [
        (0u64, chunk_offset(0) + CHUNK_HEADER),
        (1, chunk_offset(1) + CHUNK_HEADER + 1234),
        (2, chunk_offset(2) + CHUNK_HEADER + 9),
    ] {
        let mut data = original.clone();
        data[offset] ^= 0x04;
        let err = try_decrypt(&cipher(), &data).await.unwrap_err();
        assert!(
            matches!(err, StreamError::AuthenticationFailed { chunk: Some(c) } if c == chunk),
            "chunk {chunk}: {err}"
        );
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flipped_tag_bit_is_authentication_failure() {
    let mut data = encoded().await;
    // tag starts after magic, length, plaintext length, key id and nonce
    data[chunk_offset(1) + 32 + 15] ^= 0x80;
    let err = try_decrypt(&cipher(), &data).await.unwrap_err();
    assert!(
        matches!(err, StreamError::AuthenticationFailed { chunk: Some(1) }),
        "{err}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flipped_length_bit_is_authentication_failure() {
    let original = encoded().await;
    for bit in [0u8, 3, 9] {
        let mut data = original.clone();
        data[chunk_offset(0) + 8 + (bit / 8) as usize] ^= 1 << (bit % 8);
        let err = try_decrypt(&cipher(), &data).await.unwrap_err();
        assert!(
            matches!(err, StreamError::AuthenticationFailed { chunk: Some(0) }),
            "bit {bit}: {err}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_and_zero_lengths_rejected_before_allocation() {
    let original = encoded().await;

    let mut data = original.clone();
    data[chunk_offset(1) + 8..chunk_offset(1) + 16].copy_from_slice(&i64::MAX.to_le_bytes());
    let err = try_decrypt(&cipher(), &data).await.unwrap_err();
    assert!(
        matches!(err, StreamError::InvalidChunkLength { index: 1, .. }),
        "{err}"
    );

    let mut data = original.clone();
    data[chunk_offset(0) + 8..chunk_offset(0) + 16].copy_from_slice(&0i64.to_le_bytes());
    let err = try_decrypt(&cipher(), &data).await.unwrap_err();
    assert!(
        matches!(err, StreamError::InvalidChunkLength { index: 0, length: 0, .. }),
        "{err}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn swapped_chunks_are_nonce_mismatch() {
    let original = encoded().await;
    let first = original[chunk_offset(0)..chunk_offset(1)].to_vec();
    let second = original[chunk_offset(1)..chunk_offset(2)].to_vec();

    let mut data = original[..chunk_offset(0)].to_vec();
    data.extend_from_slice(&second);
    data.extend_from_slice(&first);
    data.extend_from_slice(&original[chunk_offset(2)..]);

    let err = try_decrypt(&cipher(), &data).await.unwrap_err();
    assert!(
        matches!(err, StreamError::NonceMismatch { index: 0 }),
        "{err}"
    );
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replayed_chunk_is_rejected() {
    let original = encoded().await;
    let first = &original[chunk_offset(0)..chunk_offset(1)];

    let mut data = original[..chunk_offset(1)].to_vec();
    data.extend_from_slice(first);
    data.extend_from_slice(&original[chunk_offset(1)..]);

    let err = try_decrypt(&cipher(), &data).await.unwrap_err();
    assert!(
        matches!(err, StreamError::NonceMismatch { index: 1 }),
        "{err}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunk_from_another_file_is_rejected() {
    let a = encoded().await;
    let b = encoded().await;

    let mut data = a[..chunk_offset(1)].to_vec();
    data.extend_from_slice(&b[chunk_offset(1)..]);

    let err = try_decrypt(&cipher(), &data).await.unwrap_err();
    assert!(
        matches!(err, StreamError::NonceMismatch { index: 1 }),
        "{err}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn truncation_is_reported_distinctly() {
    let original = encoded().await;
    for cut in [
        40,
        FILE_HEADER + 20,
        chunk_offset(1) + CHUNK_HEADER + 100,
        original.len() - 1,
    ] {
        let err = try_decrypt(&cipher(), &original[..cut]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Truncation, "cut at {cut}: {err}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn truncation_detected_up_front_with_input_length() {
    let original = encoded().await;
    let cut = &original[..chunk_offset(2) + 10];
    let mut out = Vec::new();
    let err = cipher()
        .decrypt(
            &mut &cut[..],
            &mut out,
            Some(cut.len() as u64),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Truncated { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_final_chunk_depends_on_strict_length() {
    let original = encoded().await;
    let short = &original[..chunk_offset(2)];

    let err = try_decrypt(&cipher(), short).await.unwrap_err();
    assert!(
        matches!(
            err,
            StreamError::LengthMismatch { expected, actual }
                if expected == PLAINTEXT_LEN as u64 && actual == 2 * CHUNK as u64
        ),
        "{err}"
    );

    let lenient = cipher_with(StreamOptions {
        chunk_size: CHUNK,
        threads: 3,
        strict_length: false,
        ..StreamOptions::default()
    });
    let out = try_decrypt(&lenient, short).await.unwrap();
    assert_eq!(out, plaintext()[..2 * CHUNK]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn encrypt_strict_length_checks_hint() {
    let plain = plaintext();
    let mut out = Vec::new();
    let err = cipher()
        .encrypt(
            &mut &plain[..],
            &mut out,
            Some(plain.len() as u64 + 1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::LengthMismatch { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_key_id_and_wrong_master_key() {
    let data = encoded().await;

    let other_id = StreamCipher::new(MasterKey::from_bytes([42u8; KEY_SIZE]), 8).unwrap();
    let err = try_decrypt(&other_id, &data).await.unwrap_err();
    assert!(
        matches!(err, StreamError::KeyIdMismatch { expected: 8, actual: 7 }),
        "{err}"
    );

    let other_master = StreamCipher::new(MasterKey::from_bytes([43u8; KEY_SIZE]), 7).unwrap();
    let err = try_decrypt(&other_master, &data).await.unwrap_err();
    assert!(
        matches!(err, StreamError::AuthenticationFailed { chunk: None }),
        "{err}"
    );

    let other_suite = cipher().with_suite(CipherSuite::ChaCha20Poly1305);
    let err = try_decrypt(&other_suite, &data).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunk_key_id_mismatch_is_format_error() {
    let mut data = encoded().await;
    data[chunk_offset(1) + 16..chunk_offset(1) + 20].copy_from_slice(&99i32.to_le_bytes());
    let err = try_decrypt(&cipher(), &data).await.unwrap_err();
    assert!(
        matches!(err, StreamError::KeyIdMismatch { expected: 7, actual: 99 }),
        "{err}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_file_header_is_format_error() {
    let original = encoded().await;

    let mut data = original.clone();
    data[..4].copy_from_slice(b"NOPE");
    let err = try_decrypt(&cipher(), &data).await.unwrap_err();
    assert!(matches!(err, StreamError::BadMagic { .. }), "{err}");

    let mut data = original.clone();
    data[4..8].copy_from_slice(&96i32.to_le_bytes());
    let err = try_decrypt(&cipher(), &data).await.unwrap_err();
    assert!(matches!(err, StreamError::HeaderLength { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scope_limits_fail_instead_of_blocking() {
    let data = encoded().await;

    // Decrypting needs a ciphertext and a plaintext buffer at once.
    let one_buffer = cipher_with(StreamOptions {
        chunk_size: CHUNK,
        threads: 2,
        scope_max_buffers: Some(1),
        ..StreamOptions::default()
    });
    let err = try_decrypt(&one_buffer, &data).await.unwrap_err();
    assert!(matches!(err, StreamError::ResourceLimit { .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::Resource);

    let tiny_budget = cipher_with(StreamOptions {
        chunk_size: CHUNK,
        threads: 2,
        scope_max_bytes: Some(1000),
        ..StreamOptions::default()
    });
    let plain = plaintext();
    let mut out = Vec::new();
    let err = tiny_budget
        .encrypt(&mut &plain[..], &mut out, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::ResourceLimit { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pre_cancelled_run_does_nothing() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let plain = plaintext();
    let mut out = Vec::new();
    let err = cipher()
        .encrypt(&mut &plain[..], &mut out, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Cancelled));
    assert!(out.is_empty());
}

struct Sluggish;

struct SluggishCtx(Box<dyn ChunkAead>);

impl AeadFactory for Sluggish {
    fn context(&self, key: &[u8; KEY_SIZE]) -> Box<dyn ChunkAead> {
        Box::new(SluggishCtx(CipherSuite::Aes256Gcm.context(key)))
    }
}

impl ChunkAead for SluggishCtx {
    fn seal(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], buf: &mut [u8]) -> Result<Tag128, AeadFailure> {
        std::thread::sleep(Duration::from_millis(20));
        self.0.seal(nonce, aad, buf)
    }

    fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buf: &mut [u8],
        tag: &Tag128,
    ) -> Result<(), AeadFailure> {
        std::thread::sleep(Duration::from_millis(20));
        self.0.open(nonce, aad, buf, tag)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_mid_run_is_not_a_data_error() {
    let cipher = cipher_with(StreamOptions {
        chunk_size: CHUNK,
        threads: 2,
        ..StreamOptions::default()
    })
    .with_aead(Arc::new(Sluggish));
    let plain = vec![7u8; 64 * CHUNK];
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    let mut out = Vec::new();
    let err = cipher
        .encrypt(&mut &plain[..], &mut out, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Cancelled), "{err}");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn decryption_cancelled_mid_run() {
    let options = StreamOptions {
        chunk_size: CHUNK,
        threads: 2,
        ..StreamOptions::default()
    };
    let plain = vec![9u8; 64 * CHUNK];
    let mut data = Vec::new();
    cipher_with(options.clone())
        .encrypt(&mut &plain[..], &mut data, None, &CancellationToken::new())
        .await
        .unwrap();

    let slow = cipher_with(options).with_aead(Arc::new(Sluggish));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    let mut out = Vec::new();
    let err = slow
        .decrypt(&mut &data[..], &mut out, Some(data.len() as u64), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Cancelled), "{err}");
    assert!(out.len() < plain.len(), "run stopped early");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tampered_stream_through_pipe_reader() {
    let mut data = encoded().await;
    data[chunk_offset(2) + CHUNK_HEADER] ^= 1;

    let mut reader = cipher().decrypt_reader(std::io::Cursor::new(data), None, &CancellationToken::new());
    let mut out = Vec::new();
    let err = reader.read_to_end(&mut out).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    assert!(matches!(
        StreamError::from_io(err),
        StreamError::AuthenticationFailed { chunk: Some(2) }
    ));
    assert_eq!(out, plaintext()[..2 * CHUNK], "verified prefix only");
}
