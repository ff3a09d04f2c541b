//! Relay wire schema.
//!
//! Every frame is a JSON object with a `type` discriminator. Two protocol
//! generations are in the field, so the key-bearing fields are written
//! under both names (`keyExchangeBlob`, current; `publicKey`, legacy) and
//! read from whichever is present. Passcode proofs likewise always carry
//! both hash generations.

use crate::crypto::{EncryptedPayload, PasscodeHashes};
use crate::utils::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Largest frame accepted from the relay
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Frame types this client understands from the relay
const SERVER_FRAME_TYPES: &[&str] = &[
    "pong",
    "session_created",
    "session_joined",
    "session_not_found",
    "session_invalid_passcode",
    "participant_joined",
    "participant_rejoined",
    "participant_left",
    "session_message",
    "session_expired",
    "ping_notification",
    "session_invite",
    "ping_rate_limited",
    "error",
];

/// Frames sent from this client to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Create a session and occupy its first slot
    #[serde(rename_all = "camelCase")]
    CreateSession {
        session_id: String,
        passcode_hash: String,
        passcode_hash_legacy: String,
        token: String,
        public_key: String,
        key_exchange_blob: String,
    },
    /// Join (or silently rejoin) an existing session
    #[serde(rename_all = "camelCase")]
    JoinSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passcode_hash: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passcode_hash_legacy: Option<String>,
        token: String,
        public_key: String,
        key_exchange_blob: String,
    },
    /// Leave a session; the token stays valid for rejoin
    #[serde(rename_all = "camelCase")]
    LeaveSession { session_id: String, token: String },
    /// Encrypted application payload
    #[serde(rename_all = "camelCase")]
    SessionMessage {
        session_id: String,
        token: String,
        payload: EncryptedPayload,
    },
    /// Invite a friend into a session by handle
    #[serde(rename_all = "camelCase")]
    PingUser {
        session_id: String,
        recipient_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passcode_hash: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passcode_hash_legacy: Option<String>,
    },
    /// Liveness probe
    Ping,
    /// Register the anonymous handle for invitations
    Register {
        #[serde(rename = "oderId")]
        handle: String,
    },
}

impl ClientFrame {
    /// `create_session` with both hash generations and both key field names
    pub fn create_session(
        session_id: &str,
        hashes: &PasscodeHashes,
        token: &str,
        public_key: &str,
    ) -> Self {
        Self::CreateSession {
            session_id: session_id.to_string(),
            passcode_hash: hashes.current.clone(),
            passcode_hash_legacy: hashes.legacy.clone().unwrap_or_default(),
            token: token.to_string(),
            public_key: public_key.to_string(),
            key_exchange_blob: public_key.to_string(),
        }
    }

    /// `join_session`; hashes are omitted for a token-based silent rejoin
    pub fn join_session(
        session_id: &str,
        hashes: Option<&PasscodeHashes>,
        token: &str,
        public_key: &str,
    ) -> Self {
        let non_empty = |s: &String| (!s.is_empty()).then(|| s.clone());
        Self::JoinSession {
            session_id: session_id.to_string(),
            passcode_hash: hashes.and_then(|h| non_empty(&h.current)),
            passcode_hash_legacy: hashes.and_then(|h| h.legacy.as_ref().and_then(non_empty)),
            token: token.to_string(),
            public_key: public_key.to_string(),
            key_exchange_blob: public_key.to_string(),
        }
    }

    /// `ping_user` carrying only hashed passcode material
    pub fn ping_user(session_id: &str, recipient_id: &str, hashes: Option<&PasscodeHashes>) -> Self {
        Self::PingUser {
            session_id: session_id.to_string(),
            recipient_id: recipient_id.to_string(),
            passcode_hash: hashes.map(|h| h.current.clone()),
            passcode_hash_legacy: hashes.and_then(|h| h.legacy.clone()),
        }
    }

    /// Wire name of the frame, for logging
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::CreateSession { .. } => "create_session",
            Self::JoinSession { .. } => "join_session",
            Self::LeaveSession { .. } => "leave_session",
            Self::SessionMessage { .. } => "session_message",
            Self::PingUser { .. } => "ping_user",
            Self::Ping => "ping",
            Self::Register { .. } => "register",
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }
}

/// Key material for a participant, under either field name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireParticipant {
    /// Anonymous session token
    pub token: String,
    /// Legacy key field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Current key field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_exchange_blob: Option<String>,
}

/// Resolve the peer key from the two field generations
fn resolve_key<'a>(current: Option<&'a String>, legacy: Option<&'a String>) -> Option<&'a str> {
    current
        .filter(|k| !k.is_empty())
        .or(legacy.filter(|k| !k.is_empty()))
        .map(String::as_str)
}

impl WireParticipant {
    /// Peer public key, preferring the current field name
    pub fn peer_key(&self) -> Option<&str> {
        resolve_key(self.key_exchange_blob.as_ref(), self.public_key.as_ref())
    }
}

/// Response to a create/join request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAck {
    /// Session the response refers to
    pub session_id: String,
    /// Participants already present
    #[serde(default)]
    pub participants: Option<Vec<WireParticipant>>,
}

/// Participant presence change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantFrame {
    /// Session the participant belongs to
    pub session_id: String,
    /// Participant token
    pub token: String,
    /// Legacy key field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Current key field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_exchange_blob: Option<String>,
}

impl ParticipantFrame {
    /// Peer public key, preferring the current field name
    pub fn peer_key(&self) -> Option<&str> {
        resolve_key(self.key_exchange_blob.as_ref(), self.public_key.as_ref())
    }
}

/// Invitation into a session; carries no sender identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    /// Session to join
    pub session_id: String,
    /// Current-generation passcode hash
    #[serde(default)]
    pub passcode_hash: Option<String>,
    /// Legacy passcode hash
    #[serde(default)]
    pub passcode_hash_legacy: Option<String>,
}

/// Frames received from the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Liveness response
    Pong,
    /// Session created
    SessionCreated(SessionAck),
    /// Session joined
    SessionJoined(SessionAck),
    /// Join target does not exist
    SessionNotFound(SessionAck),
    /// Passcode hash rejected
    SessionInvalidPasscode(SessionAck),
    /// A new participant arrived
    ParticipantJoined(ParticipantFrame),
    /// A known token came back
    ParticipantRejoined(ParticipantFrame),
    /// A participant left
    ParticipantLeft(ParticipantFrame),
    /// Encrypted application payload
    #[serde(rename_all = "camelCase")]
    SessionMessage {
        session_id: String,
        from_token: String,
        payload: EncryptedPayload,
    },
    /// Session lifetime elapsed on the relay
    #[serde(rename_all = "camelCase")]
    SessionExpired { session_id: String },
    /// Invitation from a friend
    PingNotification(Invitation),
    /// Invitation, newer name
    SessionInvite(Invitation),
    /// Ping refused by the relay's own limiter
    #[serde(rename_all = "camelCase")]
    PingRateLimited {
        #[serde(default)]
        cooldown_remaining: Option<f64>,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Generic relay error
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

impl ServerFrame {
    /// Parse a text frame, distinguishing unknown types from malformed ones
    pub fn from_json(text: &str) -> Result<Self> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::InvalidMessage {
            reason: e.to_string(),
        })?;
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MissingField {
                field: "type".to_string(),
            })?;
        if !SERVER_FRAME_TYPES.contains(&frame_type) {
            return Err(ProtocolError::UnknownType {
                message_type: frame_type.to_string(),
            }
            .into());
        }

        serde_json::from_value(value).map_err(|e| {
            ProtocolError::InvalidMessage {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Session the frame refers to, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated(ack)
            | Self::SessionJoined(ack)
            | Self::SessionNotFound(ack)
            | Self::SessionInvalidPasscode(ack) => Some(&ack.session_id),
            Self::ParticipantJoined(p) | Self::ParticipantRejoined(p) | Self::ParticipantLeft(p) => {
                Some(&p.session_id)
            }
            Self::SessionMessage { session_id, .. } | Self::SessionExpired { session_id } => {
                Some(session_id)
            }
            Self::PingNotification(inv) | Self::SessionInvite(inv) => Some(&inv.session_id),
            Self::Pong | Self::PingRateLimited { .. } | Self::Error { .. } => None,
        }
    }

    /// Wire name of the frame, for logging
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::Pong => "pong",
            Self::SessionCreated(_) => "session_created",
            Self::SessionJoined(_) => "session_joined",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionInvalidPasscode(_) => "session_invalid_passcode",
            Self::ParticipantJoined(_) => "participant_joined",
            Self::ParticipantRejoined(_) => "participant_rejoined",
            Self::ParticipantLeft(_) => "participant_left",
            Self::SessionMessage { .. } => "session_message",
            Self::SessionExpired { .. } => "session_expired",
            Self::PingNotification(_) => "ping_notification",
            Self::SessionInvite(_) => "session_invite",
            Self::PingRateLimited { .. } => "ping_rate_limited",
            Self::Error { .. } => "error",
        }
    }
}

/// Convert a relay-supplied cooldown in seconds into a duration
pub fn cooldown_from_secs(secs: Option<f64>) -> Option<Duration> {
    secs.and_then(|s| Duration::try_from_secs_f64(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_session_carries_both_generations() {
        let hashes = PasscodeHashes::from_passcode("WXYZ");
        let frame = ClientFrame::create_session("ABC234", &hashes, "tok", "PUBKEY");
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "create_session");
        assert_eq!(value["sessionId"], "ABC234");
        assert_eq!(value["passcodeHash"], crate::crypto::codec::hash_passcode("WXYZ"));
        assert_eq!(value["passcodeHashLegacy"], crate::crypto::codec::hash_passcode_legacy("WXYZ"));
        assert_eq!(value["publicKey"], "PUBKEY");
        assert_eq!(value["keyExchangeBlob"], "PUBKEY");
    }

    #[test]
    fn test_rejoin_omits_hashes() {
        let frame = ClientFrame::join_session("ABC234", None, "tok", "PUBKEY");
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert!(value.get("passcodeHash").is_none());
        assert!(value.get("passcodeHashLegacy").is_none());
        assert_eq!(value["keyExchangeBlob"], "PUBKEY");
    }

    #[test]
    fn test_simple_frames() {
        assert_eq!(ClientFrame::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
        let register = ClientFrame::Register {
            handle: "ABCDEFGH".to_string(),
        };
        assert_eq!(register.to_json().unwrap(), r#"{"type":"register","oderId":"ABCDEFGH"}"#);
    }

    #[test]
    fn test_participant_key_from_either_field() {
        let legacy = json!({"type": "participant_joined", "sessionId": "ABC234", "token": "t1", "publicKey": "OLD"});
        let current = json!({"type": "participant_joined", "sessionId": "ABC234", "token": "t1", "keyExchangeBlob": "NEW", "publicKey": "OLD"});
        let neither = json!({"type": "participant_left", "sessionId": "ABC234", "token": "t1"});

        match ServerFrame::from_json(&legacy.to_string()).unwrap() {
            ServerFrame::ParticipantJoined(p) => assert_eq!(p.peer_key(), Some("OLD")),
            other => panic!("unexpected {other:?}"),
        }
        match ServerFrame::from_json(&current.to_string()).unwrap() {
            ServerFrame::ParticipantJoined(p) => assert_eq!(p.peer_key(), Some("NEW")),
            other => panic!("unexpected {other:?}"),
        }
        match ServerFrame::from_json(&neither.to_string()).unwrap() {
            ServerFrame::ParticipantLeft(p) => assert_eq!(p.peer_key(), None),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_session_joined_with_participants() {
        let text = json!({
            "type": "session_joined",
            "sessionId": "ABC234",
            "participants": [{"token": "t1", "keyExchangeBlob": "K"}]
        })
        .to_string();
        match ServerFrame::from_json(&text).unwrap() {
            ServerFrame::SessionJoined(ack) => {
                let participants = ack.participants.unwrap();
                assert_eq!(participants[0].peer_key(), Some("K"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let bare = ServerFrame::from_json(r#"{"type":"session_not_found","sessionId":"ABC234"}"#).unwrap();
        assert!(matches!(bare, ServerFrame::SessionNotFound(_)));
        assert_eq!(bare.session_id(), Some("ABC234"));
        assert_eq!(ServerFrame::Pong.session_id(), None);
    }

    #[test]
    fn test_unknown_and_malformed_frames() {
        let unknown = ServerFrame::from_json(r#"{"type":"telemetry"}"#).unwrap_err();
        assert!(matches!(
            unknown,
            crate::MessengerError::Protocol(ProtocolError::UnknownType { .. })
        ));

        let missing = ServerFrame::from_json(r#"{"sessionId":"ABC234"}"#).unwrap_err();
        assert!(matches!(
            missing,
            crate::MessengerError::Protocol(ProtocolError::MissingField { .. })
        ));

        let malformed = ServerFrame::from_json(r#"{"type":"session_message","sessionId":"ABC234"}"#);
        assert!(malformed.is_err());
        assert!(ServerFrame::from_json("not json").is_err());
    }

    #[test]
    fn test_ping_rate_limited() {
        let frame = ServerFrame::from_json(r#"{"type":"ping_rate_limited","cooldownRemaining":12.5}"#).unwrap();
        match frame {
            ServerFrame::PingRateLimited { cooldown_remaining, reason } => {
                assert_eq!(cooldown_from_secs(cooldown_remaining), Some(Duration::from_millis(12_500)));
                assert!(reason.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cooldown_from_secs(Some(-1.0)), None);
        assert_eq!(cooldown_from_secs(Some(f64::NAN)), None);
        assert_eq!(cooldown_from_secs(Some(1e300)), None);
    }
}
