//! Trusted key persistence
//!
//! Long-term key material is encrypted with a password-derived key and kept
//! in a [`KeyValueStore`](crate::storage::KeyValueStore). The scrypt work
//! factor is chosen per machine and stored with each record, so records
//! stay readable when the defaults move.

pub mod crypto;
pub mod push_token;
pub mod record;
pub mod store;

pub use crypto::WorkFactor;
pub use push_token::{PushToken, PushTokenType};
pub use record::EncryptedKeyRecord;
pub use store::{KdfSettings, TrustedKeyData, TrustedKeyStore};
