//! Persisted record formats
//!
//! Current format (JSON under the `trusted` key):
//!
//! ```text
//! { "nonce": hex, "salt": hex, "N": number, "r": number, "p": number, "encrypted": hex }
//! ```
//!
//! Deprecated format: `"<hex nonce>:<hex ciphertext>"`, keyed by an unsalted
//! SHA-512 of the password. Only ever read, and rewritten on first success.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::crypto::{WorkFactor, AUTH_TAG_LEN, MIN_LOG_N, NONCE_LEN, SALT_LEN};

/// The self-describing encrypted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyRecord {
    pub nonce: String,
    pub salt: String,
    #[serde(rename = "N")]
    pub n: u64,
    pub r: u32,
    pub p: u32,
    pub encrypted: String,
}

/// Byte form of a record, ready for derivation and decryption
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub nonce: Vec<u8>,
    pub salt: Vec<u8>,
    pub work: WorkFactor,
    pub encrypted: Vec<u8>,
}

impl EncryptedKeyRecord {
    pub fn new(nonce: &[u8], salt: &[u8], work: WorkFactor, encrypted: &[u8]) -> Self {
        Self {
            nonce: hex::encode(nonce),
            salt: hex::encode(salt),
            n: work.n(),
            r: work.r,
            p: work.p,
            encrypted: hex::encode(encrypted),
        }
    }
}

/// Raw stored string classified by format
#[derive(Debug, PartialEq, Eq)]
pub enum StoredFormat<'a> {
    Current(&'a str),
    Legacy { nonce: &'a str, ciphertext: &'a str },
}

/// Tell the two formats apart. The legacy form is exactly two hex runs joined by `:`.
pub fn classify(raw: &str) -> StoredFormat<'_> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        if let Some((nonce, ciphertext)) = trimmed.split_once(':') {
            let is_hex = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());
            if is_hex(nonce) && is_hex(ciphertext) {
                return StoredFormat::Legacy { nonce, ciphertext };
            }
        }
    }
    StoredFormat::Current(trimmed)
}

fn hex_field(value: &Value, field: &str, problems: &mut Vec<String>) -> Option<Vec<u8>> {
    match value.get(field) {
        Some(Value::String(s)) => match hex::decode(s) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                problems.push(format!("{field}: not valid hex ({e})"));
                None
            }
        },
        Some(other) => {
            problems.push(format!("{field}: expected hex string, found {other}"));
            None
        }
        None => {
            problems.push(format!("{field}: missing"));
            None
        }
    }
}

fn int_field(value: &Value, field: &str, problems: &mut Vec<String>) -> Option<u64> {
    match value.get(field) {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) => Some(v),
            None => {
                problems.push(format!("{field}: not a non-negative integer ({n})"));
                // Accept integral floats written by lenient encoders
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                    .map(|f| f as u64)
            }
        },
        Some(other) => {
            problems.push(format!("{field}: expected number, found {other}"));
            None
        }
        None => {
            problems.push(format!("{field}: missing"));
            None
        }
    }
}

/// Parse and validate a current-format record.
///
/// Validation is lenient: every problem is logged, and decoding carries on
/// with whatever is usable. `None` only when a field needed for decryption
/// cannot be recovered at all.
pub fn decode_current(raw: &str) -> Option<DecodedRecord> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Trusted key record is not valid JSON");
            return None;
        }
    };

    let mut problems = Vec::new();

    let nonce = hex_field(&value, "nonce", &mut problems);
    if let Some(nonce) = &nonce {
        if nonce.len() != NONCE_LEN {
            problems.push(format!("nonce: expected {NONCE_LEN} bytes, found {}", nonce.len()));
        }
    }

    let salt = hex_field(&value, "salt", &mut problems);
    if let Some(salt) = &salt {
        if salt.len() < SALT_LEN {
            problems.push(format!("salt: expected at least {SALT_LEN} bytes, found {}", salt.len()));
        }
    }

    let n = int_field(&value, "N", &mut problems);
    let log_n = n.and_then(|n| {
        let log_n = WorkFactor::log_n_of(n);
        match log_n {
            None => problems.push(format!("N: {n} is not a power of two")),
            Some(l) if l < MIN_LOG_N => problems.push(format!("N: {n} is below the minimum")),
            Some(_) => {}
        }
        log_n
    });

    let r = int_field(&value, "r", &mut problems);
    if r == Some(0) {
        problems.push("r: must be at least 1".into());
    }
    let p = int_field(&value, "p", &mut problems);
    if p == Some(0) {
        problems.push("p: must be at least 1".into());
    }

    let encrypted = hex_field(&value, "encrypted", &mut problems);
    if let Some(encrypted) = &encrypted {
        if encrypted.len() <= AUTH_TAG_LEN {
            problems.push("encrypted: ciphertext is empty".into());
        }
    }

    for problem in &problems {
        warn!(%problem, "Trusted key record failed validation");
    }

    let r = r.and_then(|r| u32::try_from(r).ok())?;
    let p = p.and_then(|p| u32::try_from(p).ok())?;

    Some(DecodedRecord {
        nonce: nonce?,
        salt: salt?,
        work: WorkFactor { log_n: log_n?, r, p },
        encrypted: encrypted?,
    })
}
