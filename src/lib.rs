//! # Zero-Knowledge Relay Messenger
//!
//! Client engine for anonymous two-party chat sessions over an untrusted
//! WebSocket relay. The relay routes opaque frames between session tokens;
//! it never sees plaintext, key material beyond public keys, or passcodes.
//!
//! ## Features
//!
//! - **End-to-End Encryption**: X25519 key agreement and ChaCha20-Poly1305
//! - **Anonymous Sessions**: six-character session ids guarded by a passcode
//!   that only ever leaves the device as a hash
//! - **Resilient Transport**: liveness probing and capped exponential backoff
//! - **Invitations**: friends can ping each other by an anonymous friend code
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use zk_relay_messenger::{App, AppCommand, MessengerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MessengerConfig::default();
//!     let (app, handle, _events) = App::open(config)?;
//!     handle.send(AppCommand::CreateSession)?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: identity, key agreement, AEAD and the identifier codec
//! - [`network`]: client-side rate limiting
//! - [`session`]: the sans-IO session and participant protocol
//! - [`transport`]: wire schema, connection state machine and relay task
//! - [`utils`]: configuration, errors and storage
//! - [`app`]: the actor that wires everything together

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod network;
pub mod session;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::{App, AppCommand, AppEvent, AppHandle};
pub use crypto::{CryptoEngine, Identity, IdentityKeyPair, IdentityStore};
pub use session::{SessionEvent, SessionProtocol};
pub use transport::{ClientFrame, ConnectionState, ServerFrame};
pub use utils::{MessengerConfig, MessengerError, Result};

/// Version information for the relay protocol
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// Maximum chat message size in bytes (64KB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default configuration values
pub mod defaults {
    /// Relay used when no configuration says otherwise
    pub const DEFAULT_RELAY_URL: &str = "wss://relay.zkchat.example/ws";

    /// Hours a session survives without any exchanged message
    pub const SESSION_EXPIRY_HOURS: i64 = 72;
}
