//! Long-term identity keys

use std::fmt;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Browser identity keypair (X25519)
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild from a stored secret key
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public.as_bytes() == other.public.as_bytes()
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_round_trip_restores_public_key() {
        let original = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(*original.secret_key_bytes());
        assert_eq!(original, restored);
        assert_ne!(original, KeyPair::generate());
    }

    #[test]
    fn test_debug_hides_secret() {
        let key_pair = KeyPair::from_secret_bytes([7u8; 32]);
        let rendered = format!("{:?}", key_pair);
        assert!(rendered.contains(&key_pair.public_key_hex()));
        assert!(!rendered.contains(&hex::encode([7u8; 32])));
    }
}
