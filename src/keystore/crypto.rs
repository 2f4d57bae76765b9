//! Cryptographic primitives for the trusted key store.
//!
//! # Algorithms
//!
//! - **Key Derivation**: scrypt with a per-record work factor
//! - **Encryption**: XChaCha20-Poly1305 (authenticated, 24-byte random nonces)
//! - **Legacy Key**: first half of SHA-512(password), no salt
//! - **Legacy Encryption**: XSalsa20-Poly1305 secretbox (tag first, as NaCl writes it)
//!
//! # Work Factor
//!
//! `N` is chosen per machine: one derivation at a fixed benchmark cost is
//! timed and the result extrapolated to the target duration, rounded down to
//! a power of two and clamped to `[MIN_LOG_N, MAX_LOG_N]`.

use std::time::{Duration, Instant};

use chacha20poly1305::{aead::Aead, Key, KeyInit, XChaCha20Poly1305, XNonce};
use crypto_secretbox::XSalsa20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use scrypt::Params;
use sha2::{Digest, Sha512};
use tracing::debug;
use zeroize::Zeroizing;

use crate::types::{RelayError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Derived key length (32 bytes)
pub const KEY_LEN: usize = 32;

/// Nonce length for XChaCha20-Poly1305 (24 bytes)
pub const NONCE_LEN: usize = 24;

/// Salt length for key derivation (32 bytes)
pub const SALT_LEN: usize = 32;

/// Poly1305 tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

/// scrypt block size
pub const SCRYPT_R: u32 = 8;

/// scrypt parallelisation
pub const SCRYPT_P: u32 = 1;

/// Cost used for the timing run (N = 1024)
pub const BENCHMARK_LOG_N: u8 = 10;

/// Hard floor, never written below this (N = 16384)
pub const MIN_LOG_N: u8 = 14;

/// Ceiling, keeps memory use at or below 1 GiB with r = 8
pub const MAX_LOG_N: u8 = 20;

/// Default wall-clock target for one derivation
pub const DEFAULT_TARGET: Duration = Duration::from_millis(500);

// =============================================================================
// Work Factor
// =============================================================================

/// scrypt cost parameters as stored in a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkFactor {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl WorkFactor {
    pub fn new(log_n: u8) -> Self {
        Self {
            log_n,
            r: SCRYPT_R,
            p: SCRYPT_P,
        }
    }

    /// The `N` value as persisted (a power of two)
    pub fn n(&self) -> u64 {
        1u64 << self.log_n
    }

    /// Convert a persisted `N` back into its exponent.
    ///
    /// Returns `None` unless `n` is a power of two greater than one.
    pub fn log_n_of(n: u64) -> Option<u8> {
        if n < 2 || !n.is_power_of_two() {
            return None;
        }
        Some(n.trailing_zeros() as u8)
    }

    fn params(&self) -> Result<Params> {
        Params::new(self.log_n, self.r, self.p, KEY_LEN)
            .map_err(|e| RelayError::Crypto(format!("Invalid scrypt params: {e}")))
    }
}

/// Extrapolate the work factor from one timed benchmark run.
///
/// Fails when the measurement yields a non-finite or non-positive target,
/// in which case nothing must be written.
pub fn extrapolate_log_n(elapsed: Duration, benchmark_log_n: u8, target: Duration) -> Result<u8> {
    let per_unit = elapsed.as_secs_f64() / (1u64 << benchmark_log_n) as f64;
    let target_n = target.as_secs_f64() / per_unit;

    if !target_n.is_finite() || target_n <= 0.0 {
        return Err(RelayError::Crypto(format!(
            "Cannot extrapolate scrypt cost (benchmark took {:?})",
            elapsed
        )));
    }

    let log_n = target_n.log2().floor();
    let log_n = log_n.clamp(MIN_LOG_N as f64, MAX_LOG_N as f64) as u8;
    Ok(log_n)
}

/// Time one derivation at the benchmark cost and extrapolate to `target`.
pub async fn benchmark_work_factor(target: Duration) -> Result<WorkFactor> {
    let log_n = tokio::task::spawn_blocking(move || -> Result<u8> {
        let password = generate_random_bytes::<16>();
        let salt = generate_random_bytes::<SALT_LEN>();
        let bench = WorkFactor::new(BENCHMARK_LOG_N);

        let started = Instant::now();
        derive_key_blocking(&password, &salt, &bench)?;
        let elapsed = started.elapsed();

        let log_n = extrapolate_log_n(elapsed, BENCHMARK_LOG_N, target)?;
        debug!(?elapsed, log_n, "scrypt benchmark finished");
        Ok(log_n)
    })
    .await??;

    Ok(WorkFactor::new(log_n))
}

// =============================================================================
// Key Derivation
// =============================================================================

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn derive_key_blocking(
    password: &[u8],
    salt: &[u8],
    work: &WorkFactor,
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let params = work.params()?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    scrypt::scrypt(password, salt, &params, &mut key[..])
        .map_err(|e| RelayError::Crypto(format!("Key derivation failed: {e}")))?;
    Ok(key)
}

/// Derive the record key from a password.
///
/// scrypt is CPU and memory bound, so it runs on the blocking pool.
pub async fn derive_key(
    password: &str,
    salt: &[u8],
    work: WorkFactor,
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let password = Zeroizing::new(password.as_bytes().to_vec());
    let salt = salt.to_vec();
    tokio::task::spawn_blocking(move || derive_key_blocking(&password, &salt, &work)).await?
}

/// Key for the deprecated unsalted format.
///
/// The old writer hashed one byte per UTF-16 code unit, keeping only the low
/// eight bits, so non-ASCII passwords must be narrowed the same way.
pub fn legacy_key(password: &str) -> Zeroizing<[u8; KEY_LEN]> {
    let narrowed: Zeroizing<Vec<u8>> =
        Zeroizing::new(password.encode_utf16().map(|unit| unit as u8).collect());
    let digest = Sha512::digest(&narrowed[..]);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

// =============================================================================
// Encryption / Decryption
// =============================================================================

/// Encrypt `plaintext`, returning ciphertext with the tag appended.
pub fn seal(plaintext: &[u8], key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|e| RelayError::Crypto(format!("Encryption failed: {e}")))
}

/// Decrypt and authenticate. Any failure yields `None`, never partial output.
pub fn open(ciphertext: &[u8], key: &[u8; KEY_LEN], nonce: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_LEN || ciphertext.len() < AUTH_TAG_LEN {
        return None;
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .ok()
        .map(Zeroizing::new)
}

/// Seal in the deprecated secretbox layout (`tag || ciphertext`).
pub fn legacy_seal(
    plaintext: &[u8],
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new(crypto_secretbox::Key::from_slice(key));
    cipher
        .encrypt(crypto_secretbox::Nonce::from_slice(nonce), plaintext)
        .map_err(|e| RelayError::Crypto(format!("Legacy encryption failed: {e}")))
}

/// Open a deprecated secretbox. Same contract as [`open`].
pub fn legacy_open(
    ciphertext: &[u8],
    key: &[u8; KEY_LEN],
    nonce: &[u8],
) -> Option<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_LEN || ciphertext.len() < AUTH_TAG_LEN {
        return None;
    }
    let cipher = XSalsa20Poly1305::new(crypto_secretbox::Key::from_slice(key));
    cipher
        .decrypt(crypto_secretbox::Nonce::from_slice(nonce), ciphertext)
        .ok()
        .map(Zeroizing::new)
}
