//! Per-peer key agreement and authenticated encryption.
//!
//! The shared secret is the raw X25519 output and is used directly as the
//! ChaCha20-Poly1305 key. There is no ratchet: the key lives until the
//! engine is soft-reset, which every create/join/leave and every peer
//! rejoin does.

use crate::crypto::identity::{IdentityKeyPair, KEY_LENGTH};
use crate::utils::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use x25519_dalek::PublicKey;

/// Nonce size for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size
pub const MAC_SIZE: usize = 16;

/// Encrypted payload exactly as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Base64 ciphertext without the tag
    pub ciphertext: String,
    /// Base64 12-byte nonce
    pub nonce: String,
    /// Base64 16-byte authentication tag
    pub mac: String,
}

/// Key agreement state for one remote participant
#[derive(Default)]
pub struct CryptoEngine {
    keypair: Option<Arc<IdentityKeyPair>>,
    shared_key: Option<[u8; KEY_LENGTH]>,
    peer_public_key: Option<[u8; KEY_LENGTH]>,
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("has_keypair", &self.keypair.is_some())
            .field("shared_key", &self.shared_key.map(|_| "[REDACTED]"))
            .field("peer_public_key", &self.peer_public_key.map(hex::encode))
            .finish()
    }
}

impl CryptoEngine {
    /// Create an engine with no keypair installed
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine bound to the device keypair
    pub fn with_key_pair(keypair: Arc<IdentityKeyPair>) -> Self {
        Self {
            keypair: Some(keypair),
            ..Self::default()
        }
    }

    /// Install the device keypair
    pub fn set_key_pair(&mut self, keypair: Arc<IdentityKeyPair>) {
        self.keypair = Some(keypair);
    }

    /// Run key agreement against a peer public key
    ///
    /// # Errors
    ///
    /// `KeyPairMissing` before `set_key_pair`, `InvalidKey` for a key that is
    /// not 32 bytes, `WeakKeyAgreement` for low-order points.
    pub fn init_session(&mut self, peer_public_key: &[u8]) -> Result<()> {
        let keypair = self.keypair.as_ref().ok_or(CryptoError::KeyPairMissing)?;
        let peer: [u8; KEY_LENGTH] =
            peer_public_key
                .try_into()
                .map_err(|_| CryptoError::InvalidKey {
                    reason: format!(
                        "peer public key must be {} bytes, got {}",
                        KEY_LENGTH,
                        peer_public_key.len()
                    ),
                })?;

        let shared = keypair.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakKeyAgreement.into());
        }

        self.shared_key = Some(shared.to_bytes());
        self.peer_public_key = Some(peer);
        Ok(())
    }

    /// Run key agreement against a base64-encoded peer public key
    pub fn init_session_base64(&mut self, peer_public_key: &str) -> Result<()> {
        let bytes = STANDARD
            .decode(peer_public_key.trim())
            .map_err(|e| CryptoError::InvalidKey {
                reason: e.to_string(),
            })?;
        self.init_session(&bytes)
    }

    /// True iff a shared secret exists
    pub fn is_ready(&self) -> bool {
        self.shared_key.is_some()
    }

    /// Peer public key the current secret was agreed with
    pub fn peer_public_key(&self) -> Option<&[u8; KEY_LENGTH]> {
        self.peer_public_key.as_ref()
    }

    /// Short digest of the shared secret, for out-of-band comparison
    pub fn fingerprint(&self) -> Option<String> {
        self.shared_key.map(|key| {
            let digest = Sha256::digest(key);
            hex::encode_upper(&digest[..8])
        })
    }

    /// Encrypt with a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let key = self.shared_key.as_ref().ok_or(CryptoError::SessionNotReady)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let mut sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encryption {
                reason: "Failed to encrypt message".to_string(),
            })?;
        let mac = sealed.split_off(sealed.len() - MAC_SIZE);

        Ok(EncryptedPayload {
            ciphertext: STANDARD.encode(&sealed),
            nonce: STANDARD.encode(nonce),
            mac: STANDARD.encode(mac),
        })
    }

    /// Decrypt and authenticate a payload.
    ///
    /// Any malformed field or tag mismatch is `AuthenticationFailed`; callers
    /// drop the frame and carry on.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>> {
        let key = self.shared_key.as_ref().ok_or(CryptoError::SessionNotReady)?;

        let decode = |field: &str| {
            STANDARD
                .decode(field)
                .map_err(|_| CryptoError::AuthenticationFailed)
        };
        let mut sealed = decode(&payload.ciphertext)?;
        let nonce = decode(&payload.nonce)?;
        let mac = decode(&payload.mac)?;
        if nonce.len() != NONCE_SIZE || mac.len() != MAC_SIZE {
            return Err(CryptoError::AuthenticationFailed.into());
        }
        sealed.extend_from_slice(&mac);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| CryptoError::AuthenticationFailed.into())
    }

    /// Soft reset: forget the shared secret and peer key, keep the keypair
    pub fn reset_session(&mut self) {
        self.shared_key = None;
        self.peer_public_key = None;
    }

    /// Full reset: also drop the keypair
    pub fn full_reset(&mut self) {
        self.reset_session();
        self.keypair = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_engines() -> (CryptoEngine, CryptoEngine) {
        let alice_keys = Arc::new(IdentityKeyPair::generate());
        let bob_keys = Arc::new(IdentityKeyPair::generate());

        let mut alice = CryptoEngine::with_key_pair(alice_keys.clone());
        let mut bob = CryptoEngine::with_key_pair(bob_keys.clone());
        alice.init_session(&bob_keys.public_key_bytes()).unwrap();
        bob.init_session_base64(&alice_keys.public_key_base64()).unwrap();
        (alice, bob)
    }

    fn flip_bit(field: &str, byte: usize) -> String {
        let mut raw = STANDARD.decode(field).unwrap();
        raw[byte] ^= 0x01;
        STANDARD.encode(raw)
    }

    #[test]
    fn test_round_trip() {
        let (alice, bob) = paired_engines();
        let long = vec![0xffu8; 4096];
        for plaintext in [&b""[..], &b"hello"[..], long.as_slice()] {
            let sealed = alice.encrypt(plaintext).unwrap();
            assert_eq!(bob.decrypt(&sealed).unwrap(), plaintext);
        }
        assert_eq!(alice.fingerprint(), bob.fingerprint());
    }

    #[test]
    fn test_payload_shape() {
        let (alice, _) = paired_engines();
        let sealed = alice.encrypt(b"hello").unwrap();
        assert_eq!(STANDARD.decode(&sealed.nonce).unwrap().len(), NONCE_SIZE);
        assert_eq!(STANDARD.decode(&sealed.mac).unwrap().len(), MAC_SIZE);
        assert_eq!(STANDARD.decode(&sealed.ciphertext).unwrap().len(), 5);
    }

    #[test]
    fn test_tamper_detection() {
        let (alice, bob) = paired_engines();
        let sealed = alice.encrypt(b"attack at dawn").unwrap();

        let mut tampered = sealed.clone();
        tampered.ciphertext = flip_bit(&sealed.ciphertext, 3);
        assert!(bob.decrypt(&tampered).is_err());

        let mut tampered = sealed.clone();
        tampered.nonce = flip_bit(&sealed.nonce, 0);
        assert!(bob.decrypt(&tampered).is_err());

        let mut tampered = sealed.clone();
        tampered.mac = flip_bit(&sealed.mac, 15);
        let err = bob.decrypt(&tampered).unwrap_err();
        assert!(matches!(
            err,
            crate::MessengerError::Crypto(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_malformed_payload_is_authentication_failure() {
        let (alice, bob) = paired_engines();
        let mut sealed = alice.encrypt(b"x").unwrap();
        sealed.nonce = STANDARD.encode([0u8; 8]);
        assert!(matches!(
            bob.decrypt(&sealed).unwrap_err(),
            crate::MessengerError::Crypto(CryptoError::AuthenticationFailed)
        ));

        sealed.nonce = "***".to_string();
        assert!(bob.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_preconditions() {
        let mut engine = CryptoEngine::new();
        assert!(matches!(
            engine.init_session(&[9u8; 32]).unwrap_err(),
            crate::MessengerError::Crypto(CryptoError::KeyPairMissing)
        ));
        assert!(matches!(
            engine.encrypt(b"x").unwrap_err(),
            crate::MessengerError::Crypto(CryptoError::SessionNotReady)
        ));

        engine.set_key_pair(Arc::new(IdentityKeyPair::generate()));
        assert!(engine.init_session(&[9u8; 31]).is_err());
        assert!(matches!(
            engine.init_session(&[0u8; 32]).unwrap_err(),
            crate::MessengerError::Crypto(CryptoError::WeakKeyAgreement)
        ));
        assert!(!engine.is_ready());
    }

    #[test]
    fn test_soft_and_full_reset() {
        let (mut alice, _) = paired_engines();
        assert!(alice.is_ready());

        alice.reset_session();
        assert!(!alice.is_ready());
        assert!(alice.peer_public_key().is_none());
        // keypair survives a soft reset
        assert!(alice.init_session(&IdentityKeyPair::generate().public_key_bytes()).is_ok());

        alice.full_reset();
        assert!(!alice.is_ready());
        assert!(alice.init_session(&[9u8; 32]).is_err());
    }
}
