//! Cryptographic primitives and identity management.
//!
//! This module provides the device identity, the per-peer key agreement and
//! AEAD engine, and the passcode/identifier codec.

pub mod codec;
pub mod engine;
pub mod identity;

pub use codec::{JoinCode, PasscodeHashes};
pub use engine::{CryptoEngine, EncryptedPayload};
pub use identity::{Identity, IdentityKeyPair, IdentityStore};
