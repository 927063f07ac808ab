//! Key material shared by attestation and session setup
//!
//! - **PublicKey**: an X25519 public key, either attested in a report or sent by a client
//! - **FreshnessNonce**: 32 random bytes binding a report or a session to one attempt
//! - **EphemeralKeyPair**: a local X25519 secret plus the nonce it contributes to the transcript

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use x25519_dalek::StaticSecret;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 32;

/// X25519 public key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "crate::encoding::hex_array")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; PUBLIC_KEY_SIZE]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub(crate) fn to_dalek(self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Random nonce proving an attestation report or session was produced for this attempt
#[derive(Clone, Copy, Eq, Serialize, Deserialize)]
pub struct FreshnessNonce(#[serde(with = "crate::encoding::hex_array")] [u8; NONCE_SIZE]);

impl FreshnessNonce {
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl PartialEq for FreshnessNonce {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl std::fmt::Debug for FreshnessNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FreshnessNonce({}..)", hex::encode(&self.0[..4]))
    }
}

/// A local X25519 key pair and the nonce this party contributes to the session transcript.
///
/// The secret is zeroized when the pair is dropped.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
    nonce: FreshnessNonce,
}

impl EphemeralKeyPair {
    /// Fresh key pair with a fresh nonce (the host or remote client side)
    pub fn generate() -> Self {
        Self::for_challenge(FreshnessNonce::random())
    }

    /// Fresh key pair bound to a verifier's challenge nonce (the enclave side)
    pub fn for_challenge(nonce: FreshnessNonce) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self {
            secret,
            public,
            nonce,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn nonce(&self) -> &FreshnessNonce {
        &self.nonce
    }

    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> x25519_dalek::SharedSecret {
        self.secret.diffie_hellman(&peer.to_dalek())
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public)
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypairs_are_distinct() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        assert_ne!(a.public_key(), b.public_key());
        assert_ne!(a.nonce(), b.nonce());
    }

    #[test]
    fn test_challenge_nonce_is_kept() {
        let nonce = FreshnessNonce::random();
        let pair = EphemeralKeyPair::for_challenge(nonce);
        assert_eq!(pair.nonce(), &nonce);
    }

    #[test]
    fn test_public_key_json_is_hex() {
        let key = PublicKey::from_bytes([0xab; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let pair = EphemeralKeyPair::generate();
        let rendered = format!("{:?}", pair);
        assert!(rendered.contains("PublicKey"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_from_slice_length() {
        assert!(PublicKey::from_slice(&[1u8; 31]).is_none());
        assert!(PublicKey::from_slice(&[1u8; 32]).is_some());
    }
}
