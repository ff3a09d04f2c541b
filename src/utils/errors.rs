//! Error types and handling for the relay messenger.
//!
//! Errors are grouped by how the caller is expected to react: crypto errors
//! are non-fatal and usually end with a dropped frame, session errors cancel
//! the pending operation and reach the user, network errors feed the
//! reconnection state machine, and validation errors are raised before any
//! frame leaves the device.

use thiserror::Error;

/// Result type alias for the messenger library
pub type Result<T> = std::result::Result<T, MessengerError>;

/// Comprehensive error type for all messenger operations
#[derive(Error, Debug, Clone)]
pub enum MessengerError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Relay connection errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Session protocol errors reported by the relay
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire schema errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// User input rejected before reaching the network
    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),

    /// Key-value store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Base64 encoding/decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key agreement attempted before a local keypair was installed
    #[error("No local keypair installed")]
    KeyPairMissing,

    /// Encryption attempted before a shared secret exists
    #[error("Crypto session not ready")]
    SessionNotReady,

    /// Tag mismatch or malformed ciphertext envelope
    #[error("Message authentication failed")]
    AuthenticationFailed,

    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Key agreement produced a non-contributory secret
    #[error("Peer public key produced a weak shared secret")]
    WeakKeyAgreement,

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },
}

/// Relay connection errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection establishment failure
    #[error("Connection to {url} failed: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },

    /// Socket-level error after the connection was established
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Reconnection budget spent; a manual reconnect is required
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// The relay task is no longer running
    #[error("Relay channel closed")]
    ChannelClosed,
}

/// Session protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The relay does not know the session
    #[error("Session not found: {session_id}")]
    NotFound { session_id: String },

    /// The relay rejected the passcode hash
    #[error("Wrong passcode for session {session_id}")]
    InvalidPasscode { session_id: String },

    /// Join could not be completed
    #[error("Could not join {session_id}: {reason}")]
    JoinFailed { session_id: String, reason: String },

    /// Session lifetime elapsed
    #[error("Session expired: {session_id}")]
    Expired { session_id: String },

    /// Session id is not tracked locally
    #[error("Unknown local session: {session_id}")]
    UnknownSession { session_id: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Wire schema errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Frame carried a `type` this client does not understand
    #[error("Unknown message type: {message_type}")]
    UnknownType { message_type: String },

    /// Missing required message field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Frame too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Input validation errors, each with a hint describing the expected format
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Join code could not be parsed
    #[error("Malformed join code: {hint}")]
    MalformedJoinCode { hint: String },

    /// Friend code could not be parsed
    #[error("Malformed friend code: {hint}")]
    MalformedFriendCode { hint: String },

    /// Session id has the wrong length or alphabet
    #[error("Malformed session id: {hint}")]
    MalformedSessionId { hint: String },

    /// Passcode has the wrong length or alphabet
    #[error("Malformed passcode: {hint}")]
    MalformedPasscode { hint: String },

    /// Message body is empty after trimming
    #[error("Message is empty")]
    EmptyMessage,

    /// Message body exceeds the allowed size
    #[error("Message too long: {len} bytes (max: {max})")]
    MessageTooLong { len: usize, max: usize },
}

/// Key-value store errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Stored value could not be decoded
    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Key is not a valid record name
    #[error("Invalid storage key: {key}")]
    InvalidKey { key: String },
}

impl MessengerError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if the reconnection machinery should retry after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(
                NetworkError::Timeout { .. }
                    | NetworkError::ConnectionFailed { .. }
                    | NetworkError::Transport { .. }
            )
        )
    }

    /// Returns true if the error should be shown to the user verbatim
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Session(_)
                | Self::Validation(_)
                | Self::Network(NetworkError::ReconnectExhausted { .. })
        )
    }
}

impl From<std::io::Error> for MessengerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MessengerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Network(NetworkError::Transport {
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MessengerError::Validation(ValidationError::MalformedJoinCode {
            hint: "expected ABC123-WXYZ".to_string(),
        });
        assert!(error.to_string().contains("ABC123-WXYZ"));
    }

    #[test]
    fn test_error_recovery() {
        let timeout_error = MessengerError::Network(NetworkError::Timeout {
            operation: "liveness".to_string(),
        });
        assert!(timeout_error.is_recoverable());

        let exhausted = MessengerError::Network(NetworkError::ReconnectExhausted { attempts: 10 });
        assert!(!exhausted.is_recoverable());
        assert!(exhausted.is_user_facing());

        let crypto_error = MessengerError::Crypto(CryptoError::AuthenticationFailed);
        assert!(!crypto_error.is_recoverable());
        assert!(!crypto_error.is_user_facing());
    }

    #[test]
    fn test_protocol_errors_are_user_facing() {
        let err: MessengerError = SessionError::InvalidPasscode {
            session_id: "ABC123".to_string(),
        }
        .into();
        assert!(err.is_user_facing());
        assert!(!err.is_recoverable());
    }
}
