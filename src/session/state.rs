//! Local records for sessions and the participants seen in them.

use crate::crypto::PasscodeHashes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// How this client proves knowledge of a session's passcode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SessionCredentials {
    /// Plaintext passcode, typed or generated locally
    Passcode(String),
    /// Hashes received in an invitation
    Hashed(PasscodeHashes),
    /// Nothing known; only a token-based rejoin is possible
    None,
}

impl SessionCredentials {
    /// Hashes to put on the wire, if any
    pub fn hashes(&self) -> Option<PasscodeHashes> {
        match self {
            Self::Passcode(passcode) => Some(PasscodeHashes::from_passcode(passcode)),
            Self::Hashed(hashes) => Some(hashes.clone()),
            Self::None => None,
        }
    }

    /// Plaintext passcode, when known
    pub fn passcode(&self) -> Option<&str> {
        match self {
            Self::Passcode(passcode) => Some(passcode),
            _ => None,
        }
    }
}

/// A session this client created or joined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSession {
    /// Six-character session id
    pub session_id: String,
    /// Passcode proof material
    pub credentials: SessionCredentials,
    /// When the session was created locally
    pub created_at: DateTime<Utc>,
    /// Expiry, pushed forward by every exchanged message
    pub expires_at: DateTime<Utc>,
    /// Whether this client created the session
    pub is_creator: bool,
    /// Token of the peer messages are addressed to
    #[serde(default)]
    pub recipient_token: Option<String>,
    /// Whether the user wants to be seated; cleared by leaving
    #[serde(default = "active_by_default")]
    pub active: bool,
    /// Whether the relay currently has us seated
    #[serde(skip)]
    pub joined: bool,
}

impl LocalSession {
    /// New record expiring `lifetime` from `now`
    pub fn new(
        session_id: String,
        credentials: SessionCredentials,
        is_creator: bool,
        now: DateTime<Utc>,
        lifetime: chrono::Duration,
    ) -> Self {
        Self {
            session_id,
            credentials,
            created_at: now,
            expires_at: now + lifetime,
            is_creator,
            recipient_token: None,
            active: true,
            joined: false,
        }
    }

    /// Push expiry forward after activity
    pub fn touch(&mut self, now: DateTime<Utc>, lifetime: chrono::Duration) {
        self.expires_at = now + lifetime;
    }

    /// Whether the session has outlived its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// `SESSIONID-PASSCODE` when the passcode is known
    pub fn join_code(&self) -> Option<String> {
        self.credentials
            .passcode()
            .map(|passcode| format!("{}-{passcode}", self.session_id))
    }
}

fn active_by_default() -> bool {
    true
}

/// Another occupant of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    /// Relay token of the participant
    pub token: String,
    /// Name received over the encrypted channel
    pub display_name: Option<String>,
    /// Base64 public key announced by the relay
    pub peer_public_key: Option<String>,
    /// Typing indicator deadline
    pub typing_until: Option<Instant>,
}

impl ParticipantInfo {
    /// Participant with no name or key yet
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            display_name: None,
            peer_public_key: None,
            typing_until: None,
        }
    }

    /// Name to show, falling back to a token prefix
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("peer-{}", short_token(&self.token)),
        }
    }

    /// Whether the typing indicator is lit
    pub fn is_typing(&self) -> bool {
        self.typing_until.is_some()
    }
}

/// First characters of a token, for logs and labels
pub fn short_token(token: &str) -> &str {
    token.get(..6).unwrap_or(token)
}

/// Where a session stands from this client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No token issued for this session id
    NoToken,
    /// Token issued, not seated on the relay
    TokenIssued,
    /// Seated, alone
    AwaitingPeer,
    /// Seated with at least one peer
    PeerPresent {
        /// Whether the shared key has been derived
        crypto_ready: bool,
    },
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoToken => write!(f, "no token"),
            Self::TokenIssued => write!(f, "not joined"),
            Self::AwaitingPeer => write!(f, "waiting for peer"),
            Self::PeerPresent { crypto_ready: true } => write!(f, "secure"),
            Self::PeerPresent { crypto_ready: false } => write!(f, "key exchange pending"),
        }
    }
}

/// Persistent part of the session table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSessions {
    /// Session records
    pub sessions: Vec<LocalSession>,
    /// Session id to our token
    pub tokens: HashMap<String, String>,
}
