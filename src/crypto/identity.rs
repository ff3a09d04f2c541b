//! Device identity: a long-lived X25519 keypair and an anonymous handle.
//!
//! The keypair is created once per device and only replaced by an explicit
//! reset. The handle is what the relay registers and what friends use to
//! ping this device; it carries no link to the keypair.

use crate::crypto::codec;
use crate::utils::{CryptoError, KeyValueStore, Result, StorageError};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

/// Length of X25519 public and secret keys
pub const KEY_LENGTH: usize = 32;

/// Store key holding the identity record
pub const IDENTITY_RECORD: &str = "identity.json";

/// Store key holding persisted session records
pub const SESSIONS_RECORD: &str = "sessions.json";

/// X25519 key pair used for key agreement
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a key pair from its 32-byte secret
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the slice has the wrong length
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LENGTH] =
            secret_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey {
                    reason: format!(
                        "Invalid secret key length: expected {}, got {}",
                        KEY_LENGTH,
                        secret_bytes.len()
                    ),
                })?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Public key bytes
    pub fn public_key_bytes(&self) -> [u8; KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// Public key, base64 encoded for the wire
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    /// Secret key bytes, for persistence only
    pub fn secret_key_bytes(&self) -> [u8; KEY_LENGTH] {
        self.secret.to_bytes()
    }

    /// X25519 agreement with a peer public key
    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(peer)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Device identity: anonymous handle plus keypair
#[derive(Debug, Clone)]
pub struct Identity {
    /// Anonymous handle, also the friend code
    pub handle: String,
    /// Long-lived keypair, shared read-only by every crypto engine
    pub keypair: Arc<IdentityKeyPair>,
}

impl Identity {
    /// Create a fresh identity
    pub fn generate() -> Self {
        Self {
            handle: codec::generate_handle(),
            keypair: Arc::new(IdentityKeyPair::generate()),
        }
    }

    /// Handle rendered as a friend code
    pub fn friend_code(&self) -> String {
        codec::format_friend_code(&self.handle)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.friend_code())
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    handle: String,
    secret_key: String,
}

/// Loads, creates and destroys the device identity
pub struct IdentityStore {
    store: Arc<dyn KeyValueStore>,
}

impl IdentityStore {
    /// Wrap a key-value store
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load the persisted identity, `None` if this device has none yet
    pub fn load_key_pair(&self) -> Result<Option<Identity>> {
        let Some(bytes) = self.store.get(IDENTITY_RECORD)? else {
            return Ok(None);
        };

        let corrupt = |reason: String| StorageError::Corrupt {
            key: IDENTITY_RECORD.to_string(),
            reason,
        };
        let record: IdentityRecord =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        let secret = STANDARD
            .decode(record.secret_key.as_bytes())
            .map_err(|e| corrupt(e.to_string()))?;
        let keypair = IdentityKeyPair::from_secret_bytes(&secret)?;

        Ok(Some(Identity {
            handle: record.handle,
            keypair: Arc::new(keypair),
        }))
    }

    /// Generate and persist a new identity, replacing any existing one
    pub fn create_key_pair(&self) -> Result<Identity> {
        let identity = Identity::generate();
        let record = IdentityRecord {
            handle: identity.handle.clone(),
            secret_key: STANDARD.encode(identity.keypair.secret_key_bytes()),
        };
        self.store
            .put(IDENTITY_RECORD, &serde_json::to_vec(&record)?)?;
        log::info!("Created new device identity {}", identity.friend_code());
        Ok(identity)
    }

    /// Load the identity, creating one on first run
    pub fn load_or_create(&self) -> Result<Identity> {
        match self.load_key_pair()? {
            Some(identity) => Ok(identity),
            None => self.create_key_pair(),
        }
    }

    /// Anonymous handle of the stored identity, if any
    pub fn handle(&self) -> Result<Option<String>> {
        Ok(self.load_key_pair()?.map(|identity| identity.handle))
    }

    /// Destroy the identity and everything derived from it
    pub fn reset(&self) -> Result<()> {
        self.store.remove(IDENTITY_RECORD)?;
        self.store.remove(SESSIONS_RECORD)?;
        log::warn!("Device identity and stored sessions removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{FileStore, MemoryStore};
    use tempfile::TempDir;

    #[test]
    fn test_keypair_from_secret() {
        let original = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret_bytes(&original.secret_key_bytes()).unwrap();
        assert_eq!(original.public_key_bytes(), restored.public_key_bytes());

        assert!(IdentityKeyPair::from_secret_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let keypair = IdentityKeyPair::generate();
        let rendered = format!("{keypair:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains(&hex::encode(keypair.secret_key_bytes())));
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let store = IdentityStore::new(Arc::new(MemoryStore::new()));
        assert!(store.load_key_pair().unwrap().is_none());
        assert!(store.handle().unwrap().is_none());

        let first = store.load_or_create().unwrap();
        let second = store.load_or_create().unwrap();
        assert_eq!(first.handle, second.handle);
        assert_eq!(store.handle().unwrap(), Some(first.handle.clone()));
        assert_eq!(first.keypair.public_key_bytes(), second.keypair.public_key_bytes());
    }

    #[test]
    fn test_identity_survives_restart() {
        let dir = TempDir::new().unwrap();
        let created = IdentityStore::new(Arc::new(FileStore::open(dir.path()).unwrap()))
            .create_key_pair()
            .unwrap();

        let reopened = IdentityStore::new(Arc::new(FileStore::open(dir.path()).unwrap()));
        let loaded = reopened.load_key_pair().unwrap().unwrap();
        assert_eq!(loaded.handle, created.handle);
        assert_eq!(loaded.keypair.public_key_bytes(), created.keypair.public_key_bytes());
    }

    #[test]
    fn test_reset_discards_identity_and_sessions() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let store = IdentityStore::new(kv.clone());
        let before = store.create_key_pair().unwrap();
        kv.put(SESSIONS_RECORD, b"[]").unwrap();

        store.reset().unwrap();
        assert!(store.load_key_pair().unwrap().is_none());
        assert!(kv.get(SESSIONS_RECORD).unwrap().is_none());

        let after = store.load_or_create().unwrap();
        assert_ne!(before.keypair.public_key_bytes(), after.keypair.public_key_bytes());
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        kv.put(IDENTITY_RECORD, b"not json").unwrap();
        let err = IdentityStore::new(kv).load_key_pair().unwrap_err();
        assert!(matches!(err, crate::MessengerError::Storage(StorageError::Corrupt { .. })));
    }
}
