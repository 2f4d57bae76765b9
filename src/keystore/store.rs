//! Trusted key store
//!
//! Persists the browser's long-term secret key, the paired device's public
//! key and an optional push token, encrypted under a user password.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::storage::{KeyValueStore, StorageHandle};
use crate::types::{RelayError, Result};

use super::crypto::{
    self, benchmark_work_factor, derive_key, generate_random_bytes, legacy_key, NONCE_LEN,
    SALT_LEN,
};
use super::push_token::PushToken;
use super::record::{classify, decode_current, EncryptedKeyRecord, StoredFormat};

/// Storage key of the encrypted record
pub const STORAGE_KEY: &str = "trusted";

/// Storage key of the auto-session flag
pub const AUTO_SESSION_KEY: &str = "autoSession";

/// Value of the auto-session flag when set
pub const AUTO_SESSION_VALUE: &str = "auto";

const PUBLIC_KEY_LEN: usize = 32;
const SECRET_KEY_LEN: usize = 32;

/// Shortest stored string that can possibly hold a record
const MIN_RECORD_CHARS: usize = 96;

/// Key derivation tuning
#[derive(Debug, Clone)]
pub struct KdfSettings {
    /// Wall-clock target for one derivation on this machine
    pub target: Duration,
}

impl Default for KdfSettings {
    fn default() -> Self {
        Self {
            target: crypto::DEFAULT_TARGET,
        }
    }
}

/// Decrypted record contents
#[derive(Clone)]
pub struct TrustedKeyData {
    pub own_secret_key: Zeroizing<[u8; SECRET_KEY_LEN]>,
    pub peer_public_key: [u8; PUBLIC_KEY_LEN],
    pub push_token: Option<PushToken>,
}

impl std::fmt::Debug for TrustedKeyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustedKeyData")
            .field("own_secret_key", &"<redacted>")
            .field("peer_public_key", &hex::encode(self.peer_public_key))
            .field("push_token", &self.push_token.as_ref().map(|t| t.kind))
            .finish()
    }
}

/// Password cached for the lifetime of the process, wiped on drop
#[derive(Default)]
struct SessionPassword(Option<String>);

impl Drop for SessionPassword {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Encrypted credential persistence
pub struct TrustedKeyStore {
    storage: Arc<dyn KeyValueStore>,
    blocked: bool,
    kdf: KdfSettings,
    session_password: Mutex<SessionPassword>,
}

impl TrustedKeyStore {
    pub fn new(storage: StorageHandle, kdf: KdfSettings) -> Self {
        Self {
            storage: storage.store,
            blocked: storage.blocked,
            kdf,
            session_password: Mutex::new(SessionPassword::default()),
        }
    }

    /// True when running memory-only because persistent storage was refused
    pub fn storage_blocked(&self) -> bool {
        self.blocked
    }

    /// Encrypt and persist key material, replacing any previous record.
    pub async fn store_trusted_key(
        &self,
        own_secret_key: &[u8; SECRET_KEY_LEN],
        peer_public_key: &[u8; PUBLIC_KEY_LEN],
        push_token: Option<&PushToken>,
        password: &str,
        auto_session: bool,
    ) -> Result<()> {
        let salt = generate_random_bytes::<SALT_LEN>();
        let work = benchmark_work_factor(self.kdf.target).await?;
        let key = derive_key(password, &salt, work).await?;
        let nonce = generate_random_bytes::<NONCE_LEN>();

        let encoded_token = push_token.map(PushToken::encode).unwrap_or_default();
        let mut plaintext =
            Zeroizing::new(Vec::with_capacity(SECRET_KEY_LEN + PUBLIC_KEY_LEN + encoded_token.len()));
        plaintext.extend_from_slice(own_secret_key);
        plaintext.extend_from_slice(peer_public_key);
        plaintext.extend_from_slice(encoded_token.as_bytes());

        let encrypted = crypto::seal(&plaintext, &key, &nonce)?;
        let record = EncryptedKeyRecord::new(&nonce, &salt, work, &encrypted);

        self.storage
            .set(STORAGE_KEY, &serde_json::to_string(&record)?)?;
        if auto_session {
            self.storage.set(AUTO_SESSION_KEY, AUTO_SESSION_VALUE)?;
        } else {
            self.storage.remove(AUTO_SESSION_KEY)?;
        }

        info!(n = record.n, r = record.r, p = record.p, "Stored trusted key");
        Ok(())
    }

    /// Whether a plausible record is stored
    pub fn has_trusted_key(&self) -> bool {
        match self.storage.get(STORAGE_KEY) {
            // Both formats carry a ':' (JSON separators, or the legacy nonce:cipher join)
            Ok(Some(raw)) => raw.len() > MIN_RECORD_CHARS && raw.contains(':'),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Could not read trusted key record");
                false
            }
        }
    }

    /// Whether the stored session was established without user interaction
    pub fn is_auto_session(&self) -> bool {
        matches!(
            self.storage.get(AUTO_SESSION_KEY),
            Ok(Some(ref flag)) if flag == AUTO_SESSION_VALUE
        )
    }

    /// Decrypt the stored record.
    ///
    /// - `Ok(None)`: nothing stored
    /// - `Err(RelayError::DecryptionFailed)`: wrong password or unusable record
    ///
    /// A deprecated-format record is migrated to the current format on the
    /// first successful read.
    pub async fn retrieve_trusted_key(&self, password: &str) -> Result<Option<TrustedKeyData>> {
        let raw = match self.storage.get(STORAGE_KEY)? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        match classify(&raw) {
            StoredFormat::Legacy { nonce, ciphertext } => {
                let data = decrypt_legacy(nonce, ciphertext, password)?;
                info!("Migrating trusted key record to the current format");
                self.store_trusted_key(
                    &data.own_secret_key,
                    &data.peer_public_key,
                    data.push_token.as_ref(),
                    password,
                    self.is_auto_session(),
                )
                .await?;
                self.retrieve_current(password).await.map(Some)
            }
            StoredFormat::Current(_) => self.retrieve_current(password).await.map(Some),
        }
    }

    async fn retrieve_current(&self, password: &str) -> Result<TrustedKeyData> {
        let raw = self
            .storage
            .get(STORAGE_KEY)?
            .ok_or(RelayError::DecryptionFailed)?;
        let record = decode_current(&raw).ok_or(RelayError::DecryptionFailed)?;

        let key = derive_key(password, &record.salt, record.work)
            .await
            .map_err(|e| {
                warn!(error = %e, "Key derivation for stored record failed");
                RelayError::DecryptionFailed
            })?;

        let plaintext = crypto::open(&record.encrypted, &key, &record.nonce).ok_or_else(|| {
            debug!("Trusted key record did not authenticate");
            RelayError::DecryptionFailed
        })?;

        split_plaintext(&plaintext, 0)
    }

    /// Remove the record, the auto-session flag and any cached password.
    pub fn clear(&self) {
        if let Err(e) = self.storage.remove(STORAGE_KEY) {
            error!(error = %e, "Failed to remove trusted key record");
        }
        if let Err(e) = self.storage.remove(AUTO_SESSION_KEY) {
            error!(error = %e, "Failed to remove auto-session flag");
        }
        self.clear_session_password();
        info!("Cleared trusted key");
    }

    /// Cache a password for unattended unlock during this process lifetime
    pub fn set_session_password(&self, password: &str) {
        if let Ok(mut cached) = self.session_password.lock() {
            cached.0.zeroize();
            cached.0 = Some(password.to_string());
        }
    }

    pub fn session_password(&self) -> Option<Zeroizing<String>> {
        self.session_password
            .lock()
            .ok()
            .and_then(|cached| cached.0.clone().map(Zeroizing::new))
    }

    pub fn clear_session_password(&self) {
        if let Ok(mut cached) = self.session_password.lock() {
            cached.0.zeroize();
            cached.0 = None;
        }
    }
}

/// Split `[skip] ‖ secret ‖ peer public ‖ token` plaintext
fn split_plaintext(plaintext: &[u8], skip: usize) -> Result<TrustedKeyData> {
    let body = plaintext.get(skip..).ok_or(RelayError::DecryptionFailed)?;
    if body.len() < SECRET_KEY_LEN + PUBLIC_KEY_LEN {
        warn!(len = plaintext.len(), "Decrypted trusted key record is too short");
        return Err(RelayError::DecryptionFailed);
    }

    let mut own_secret_key = Zeroizing::new([0u8; SECRET_KEY_LEN]);
    own_secret_key.copy_from_slice(&body[..SECRET_KEY_LEN]);
    let mut peer_public_key = [0u8; PUBLIC_KEY_LEN];
    peer_public_key.copy_from_slice(&body[SECRET_KEY_LEN..SECRET_KEY_LEN + PUBLIC_KEY_LEN]);

    let token_bytes = &body[SECRET_KEY_LEN + PUBLIC_KEY_LEN..];
    let push_token = match std::str::from_utf8(token_bytes) {
        Ok(s) => PushToken::decode(s),
        Err(_) => {
            warn!("Push token in trusted key record is not UTF-8, ignoring it");
            None
        }
    };

    Ok(TrustedKeyData {
        own_secret_key,
        peer_public_key,
        push_token,
    })
}

/// Decrypt a deprecated `nonce:ciphertext` record.
///
/// Its plaintext starts with the own public key, which is derivable and
/// therefore dropped.
fn decrypt_legacy(nonce: &str, ciphertext: &str, password: &str) -> Result<TrustedKeyData> {
    let nonce = hex::decode(nonce).map_err(|_| RelayError::DecryptionFailed)?;
    let ciphertext = hex::decode(ciphertext).map_err(|_| RelayError::DecryptionFailed)?;
    let key = legacy_key(password);
    let plaintext =
        crypto::legacy_open(&ciphertext, &key, &nonce).ok_or(RelayError::DecryptionFailed)?;
    split_plaintext(&plaintext, PUBLIC_KEY_LEN)
}

/// Produce a deprecated-format record, for exercising the migration path
#[cfg(test)]
pub(crate) fn encode_legacy(
    own_public_key: &[u8; 32],
    own_secret_key: &[u8; 32],
    peer_public_key: &[u8; 32],
    untagged_token: &str,
    password: &str,
) -> String {
    let mut plaintext = Vec::new();
    plaintext.extend_from_slice(own_public_key);
    plaintext.extend_from_slice(own_secret_key);
    plaintext.extend_from_slice(peer_public_key);
    plaintext.extend_from_slice(untagged_token.as_bytes());

    let nonce = generate_random_bytes::<NONCE_LEN>();
    let key: Zeroizing<[u8; crypto::KEY_LEN]> = legacy_key(password);
    let sealed = crypto::legacy_seal(&plaintext, &key, &nonce).unwrap();
    format!("{}:{}", hex::encode(nonce), hex::encode(sealed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::push_token::PushTokenType;
    use crate::storage::MemoryStore;

    fn fast_store() -> (TrustedKeyStore, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new());
        let store = TrustedKeyStore::new(
            StorageHandle::new(memory.clone()),
            KdfSettings {
                target: Duration::from_millis(1),
            },
        );
        (store, memory)
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let (store, _) = fast_store();
        let token = PushToken::new(PushTokenType::Apns, "device-token");

        store
            .store_trusted_key(&[1u8; 32], &[2u8; 32], Some(&token), "correct horse", false)
            .await
            .unwrap();
        assert!(store.has_trusted_key());
        assert!(!store.is_auto_session());

        let data = store.retrieve_trusted_key("correct horse").await.unwrap().unwrap();
        assert_eq!(*data.own_secret_key, [1u8; 32]);
        assert_eq!(data.peer_public_key, [2u8; 32]);
        assert_eq!(data.push_token, Some(token));
    }

    #[tokio::test]
    async fn test_wrong_password_is_decryption_failure() {
        let (store, _) = fast_store();
        store
            .store_trusted_key(&[1u8; 32], &[2u8; 32], None, "right", true)
            .await
            .unwrap();
        assert!(store.is_auto_session());

        let result = store.retrieve_trusted_key("wrong").await;
        assert!(matches!(result, Err(RelayError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn test_absent_record_is_none() {
        let (store, _) = fast_store();
        assert!(!store.has_trusted_key());
        assert!(store.retrieve_trusted_key("any").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_record_migrates_on_read() {
        let (store, memory) = fast_store();
        let legacy = encode_legacy(&[9u8; 32], &[1u8; 32], &[2u8; 32], "gcm-token", "pw");
        memory.set(STORAGE_KEY, &legacy).unwrap();
        memory.set(AUTO_SESSION_KEY, AUTO_SESSION_VALUE).unwrap();
        assert!(store.has_trusted_key());

        let first = store.retrieve_trusted_key("pw").await.unwrap().unwrap();
        let migrated = memory.get(STORAGE_KEY).unwrap().unwrap();
        assert!(migrated.starts_with('{'));
        assert!(store.is_auto_session());

        let second = store.retrieve_trusted_key("pw").await.unwrap().unwrap();
        assert_eq!(*first.own_secret_key, [1u8; 32]);
        assert_eq!(*first.own_secret_key, *second.own_secret_key);
        assert_eq!(first.peer_public_key, second.peer_public_key);
        assert_eq!(
            second.push_token,
            Some(PushToken::new(PushTokenType::Gcm, "gcm-token"))
        );
    }

    #[tokio::test]
    async fn test_legacy_wrong_password_leaves_record_untouched() {
        let (store, memory) = fast_store();
        let legacy = encode_legacy(&[9u8; 32], &[1u8; 32], &[2u8; 32], "", "pw");
        memory.set(STORAGE_KEY, &legacy).unwrap();

        let result = store.retrieve_trusted_key("nope").await;
        assert!(matches!(result, Err(RelayError::DecryptionFailed)));
        assert_eq!(memory.get(STORAGE_KEY).unwrap(), Some(legacy));
    }

    #[tokio::test]
    async fn test_clear_wipes_everything() {
        let (store, memory) = fast_store();
        store
            .store_trusted_key(&[1u8; 32], &[2u8; 32], None, "pw", true)
            .await
            .unwrap();
        store.set_session_password("pw");
        assert_eq!(store.session_password().as_deref().map(String::as_str), Some("pw"));

        store.clear();
        assert!(!store.has_trusted_key());
        assert!(!store.is_auto_session());
        assert!(store.session_password().is_none());
        assert_eq!(memory.get(STORAGE_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_tampered_record_fails() {
        let (store, memory) = fast_store();
        store
            .store_trusted_key(&[1u8; 32], &[2u8; 32], None, "pw", false)
            .await
            .unwrap();

        let raw = memory.get(STORAGE_KEY).unwrap().unwrap();
        let mut record: EncryptedKeyRecord = serde_json::from_str(&raw).unwrap();
        let mut bytes = hex::decode(&record.encrypted).unwrap();
        bytes[3] ^= 0xff;
        record.encrypted = hex::encode(bytes);
        memory
            .set(STORAGE_KEY, &serde_json::to_string(&record).unwrap())
            .unwrap();

        let result = store.retrieve_trusted_key("pw").await;
        assert!(matches!(result, Err(RelayError::DecryptionFailed)));
    }
}
