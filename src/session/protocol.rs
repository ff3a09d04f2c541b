//! Session and participant protocol.
//!
//! `SessionProtocol` is a sans-IO state machine: callers feed it relay
//! frames and user intents, it queues outbound frames in an outbox and
//! reports what happened on an event channel. It never touches a socket,
//! which keeps every transition testable with fabricated frames.
//!
//! Each session gets its own `CryptoEngine` bound to the device keypair.
//! Any create, join or leave soft-resets that engine, as does a peer
//! rejoining, so a secret agreed with a previous occupant is never reused.

use crate::crypto::codec::{self, JoinCode, PasscodeHashes};
use crate::crypto::{CryptoEngine, EncryptedPayload, Identity};
use crate::network::{ActionPolicies, RateLimiter};
use crate::session::payload::{sanitize_display_name, ChatPayload};
use crate::session::state::{
    short_token, LocalSession, ParticipantInfo, PersistedSessions, SessionCredentials,
    SessionPhase,
};
use crate::transport::protocol::{cooldown_from_secs, ClientFrame, ServerFrame, SessionAck};
use crate::utils::{ConfigError, CryptoError, MessengerConfig, Result, SessionError, ValidationError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Tunables for the protocol engine
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    /// Name announced to peers after key agreement
    pub display_name: String,
    /// Inactivity lifetime of a session
    pub session_lifetime: chrono::Duration,
    /// How long a typing indicator stays lit without a refresh
    pub typing_decay: Duration,
    /// Largest chat message accepted for sending, in bytes
    pub max_message_bytes: usize,
    /// Rate limits for messages, pings and typing
    pub policies: ActionPolicies,
}

impl From<&MessengerConfig> for ProtocolSettings {
    fn from(config: &MessengerConfig) -> Self {
        Self {
            display_name: config.session.display_name.clone(),
            session_lifetime: config.session.expiry(),
            typing_decay: config.session.typing_decay(),
            max_message_bytes: config.session.max_message_bytes,
            policies: ActionPolicies::from(&config.rate_limit),
        }
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self::from(&MessengerConfig::default())
    }
}

/// Things the protocol engine reports to the application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Relay confirmed a session we created
    SessionCreated { session_id: String },
    /// Relay seated us in an existing session
    SessionJoined { session_id: String },
    /// Create or join was refused; the attempt is cancelled
    JoinFailed {
        session_id: String,
        error: SessionError,
    },
    /// We left a session; the token is kept for rejoining
    SessionLeft { session_id: String },
    /// A new participant arrived
    ParticipantJoined { session_id: String, token: String },
    /// A known participant came back and must renegotiate keys
    ParticipantRejoined { session_id: String, token: String },
    /// A participant left
    ParticipantLeft { session_id: String, token: String },
    /// Key agreement finished
    CryptoReady {
        session_id: String,
        token: String,
        fingerprint: String,
    },
    /// A peer told us its display name
    PeerNamed {
        session_id: String,
        token: String,
        display_name: String,
    },
    /// Decrypted chat text
    MessageReceived {
        session_id: String,
        from_token: String,
        sender: String,
        text: String,
    },
    /// Typing indicator switched on or off
    TypingChanged {
        session_id: String,
        token: String,
        typing: bool,
    },
    /// Session lifetime elapsed; all local state for it is gone
    SessionExpired { session_id: String },
    /// A friend invited us into a session
    InviteReceived {
        session_id: String,
        hashes: Option<PasscodeHashes>,
    },
    /// The relay refused a ping
    PingRateLimited {
        retry_after: Option<Duration>,
        reason: Option<String>,
    },
    /// Generic relay error
    RelayError { message: String },
}

/// Result of a rate-limited user action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame queued for the relay
    Sent,
    /// Refused locally; try again after the given delay
    RateLimited { retry_after: Duration },
}

/// Client-side session protocol engine
pub struct SessionProtocol {
    identity: Identity,
    settings: ProtocolSettings,
    limiter: RateLimiter,
    tokens: HashMap<String, String>,
    sessions: HashMap<String, LocalSession>,
    participants: HashMap<String, HashMap<String, ParticipantInfo>>,
    engines: HashMap<String, CryptoEngine>,
    pending_joins: HashSet<String>,
    outbox: Vec<ClientFrame>,
    expiry_dirty: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionProtocol {
    /// Create an engine for `identity`, reporting on `events`
    pub fn new(
        identity: Identity,
        settings: ProtocolSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            identity,
            settings,
            limiter: RateLimiter::new(),
            tokens: HashMap::new(),
            sessions: HashMap::new(),
            participants: HashMap::new(),
            engines: HashMap::new(),
            pending_joins: HashSet::new(),
            outbox: Vec::new(),
            expiry_dirty: false,
            events,
        }
    }

    /// Device identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// True once after a message refreshed some session's expiry
    pub fn take_expiry_refresh(&mut self) -> bool {
        std::mem::take(&mut self.expiry_dirty)
    }

    /// Change the name announced to peers from now on
    pub fn set_display_name(&mut self, name: &str) -> Result<()> {
        let name = sanitize_display_name(name);
        if name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "display_name".to_string(),
                value: "(empty)".to_string(),
            }
            .into());
        }
        self.settings.display_name = name;
        let ready: Vec<String> = self
            .engines
            .iter()
            .filter(|(_, engine)| engine.is_ready())
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in ready {
            self.announce_name(&session_id);
        }
        Ok(())
    }

    /// Take every frame queued since the last call
    pub fn drain_outbox(&mut self) -> Vec<ClientFrame> {
        std::mem::take(&mut self.outbox)
    }

    /// Frame announcing our handle so friends can invite us
    pub fn register_frame(&self) -> ClientFrame {
        ClientFrame::Register {
            handle: self.identity.handle.clone(),
        }
    }

    // ----- user intents -----

    /// Create a session with a fresh id and passcode
    pub fn create_new_session(&mut self) -> Result<JoinCode> {
        let code = JoinCode {
            session_id: codec::generate_session_id(),
            passcode: codec::generate_passcode(),
        };
        self.create_session(&code.session_id, &code.passcode)?;
        Ok(code)
    }

    /// Create `session_id` protected by `passcode`
    pub fn create_session(&mut self, session_id: &str, passcode: &str) -> Result<()> {
        let session_id = codec::parse_session_id(session_id)?;
        let passcode = codec::parse_passcode(passcode)?;
        let hashes = PasscodeHashes::from_passcode(&passcode);

        let token = self.issue_token(&session_id);
        self.soft_reset(&session_id);
        let session = LocalSession::new(
            session_id.clone(),
            SessionCredentials::Passcode(passcode),
            true,
            Utc::now(),
            self.settings.session_lifetime,
        );
        self.sessions.insert(session_id.clone(), session);
        self.pending_joins.insert(session_id.clone());

        log::info!("Creating session {session_id}");
        let public_key = self.identity.keypair.public_key_base64();
        self.outbox.push(ClientFrame::create_session(
            &session_id,
            &hashes,
            &token,
            &public_key,
        ));
        Ok(())
    }

    /// Join `session_id`. Without a passcode, any credentials already on
    /// record are reused, and failing that only the token is sent.
    pub fn join_session(&mut self, session_id: &str, passcode: Option<&str>) -> Result<()> {
        let session_id = codec::parse_session_id(session_id)?;
        let credentials = match passcode {
            Some(passcode) => SessionCredentials::Passcode(codec::parse_passcode(passcode)?),
            None => self
                .sessions
                .get(&session_id)
                .map_or(SessionCredentials::None, |s| s.credentials.clone()),
        };
        self.join_with_credentials(session_id, credentials);
        Ok(())
    }

    /// Join using a `SESSIONID-PASSCODE` code
    pub fn join_with_code(&mut self, code: &str) -> Result<()> {
        let code = codec::parse_join_code(code)?;
        self.join_session(&code.session_id, Some(&code.passcode))
    }

    /// Join with passcode hashes taken from an invitation
    pub fn join_session_with_hash(&mut self, session_id: &str, hashes: PasscodeHashes) -> Result<()> {
        let session_id = codec::parse_session_id(session_id)?;
        if hashes.current.is_empty() && hashes.legacy.as_deref().map_or(true, str::is_empty) {
            return Err(ValidationError::MalformedPasscode {
                hint: "invitation carried no passcode hash".to_string(),
            }
            .into());
        }
        self.join_with_credentials(session_id, SessionCredentials::Hashed(hashes));
        Ok(())
    }

    fn join_with_credentials(&mut self, session_id: String, credentials: SessionCredentials) {
        let token = self.issue_token(&session_id);
        self.soft_reset(&session_id);

        let lifetime = self.settings.session_lifetime;
        let session = self.sessions.entry(session_id.clone()).or_insert_with(|| {
            LocalSession::new(
                session_id.clone(),
                credentials.clone(),
                false,
                Utc::now(),
                lifetime,
            )
        });
        session.credentials = credentials;
        session.active = true;
        session.joined = false;
        let hashes = session.credentials.hashes();
        self.pending_joins.insert(session_id.clone());

        log::info!("Joining session {session_id}");
        let public_key = self.identity.keypair.public_key_base64();
        self.outbox.push(ClientFrame::join_session(
            &session_id,
            hashes.as_ref(),
            &token,
            &public_key,
        ));
    }

    /// Leave a session, keeping the token so a later join is a rejoin
    pub fn leave_session(&mut self, session_id: &str) -> Result<()> {
        let token = self
            .tokens
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession {
                session_id: session_id.to_string(),
            })?;

        self.outbox.push(ClientFrame::LeaveSession {
            session_id: session_id.to_string(),
            token,
        });
        self.soft_reset(session_id);
        self.pending_joins.remove(session_id);
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.active = false;
            session.joined = false;
            session.recipient_token = None;
        }

        log::info!("Left session {session_id}");
        self.emit(SessionEvent::SessionLeft {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Leave if seated, then discard every trace of the session
    pub fn forget_session(&mut self, session_id: &str) -> Result<()> {
        if !self.tokens.contains_key(session_id) && !self.sessions.contains_key(session_id) {
            return Err(SessionError::UnknownSession {
                session_id: session_id.to_string(),
            }
            .into());
        }
        if self.sessions.get(session_id).is_some_and(|s| s.active) {
            self.leave_session(session_id)?;
        }
        self.discard(session_id);
        log::info!("Forgot session {session_id}");
        Ok(())
    }

    /// Encrypt and send chat text
    ///
    /// # Errors
    ///
    /// Validation errors for empty or oversized text, `UnknownSession` when
    /// not seated, `SessionNotReady` before key agreement.
    pub fn send_message(&mut self, session_id: &str, text: &str, now: Instant) -> Result<SendOutcome> {
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        if text.len() > self.settings.max_message_bytes {
            return Err(ValidationError::MessageTooLong {
                len: text.len(),
                max: self.settings.max_message_bytes,
            }
            .into());
        }
        self.require_seated(session_id)?;
        if !self.is_crypto_ready(session_id) {
            return Err(CryptoError::SessionNotReady.into());
        }

        let key = format!("message:{session_id}");
        let policy = self.settings.policies.message;
        if !self.limiter.try_acquire(&key, policy, now) {
            let retry_after = self.limiter.retry_after(&key, policy, now);
            log::debug!("Message to {session_id} rate limited for {retry_after:?}");
            return Ok(SendOutcome::RateLimited { retry_after });
        }

        self.push_payload(session_id, &ChatPayload::Text(text.to_string()))?;
        let lifetime = self.settings.session_lifetime;
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.touch(Utc::now(), lifetime);
            self.expiry_dirty = true;
        }
        Ok(SendOutcome::Sent)
    }

    /// Tell peers we started or stopped typing. Silently skipped before
    /// key agreement or while the typing cooldown runs.
    pub fn set_typing(&mut self, session_id: &str, typing: bool, now: Instant) -> Result<()> {
        if !self.is_crypto_ready(session_id) {
            return Ok(());
        }
        let policy = self.settings.policies.typing;
        if typing && !self.limiter.try_acquire(&format!("typing:{session_id}"), policy, now) {
            return Ok(());
        }
        self.push_payload(session_id, &ChatPayload::Typing(typing))
    }

    /// Invite the owner of `friend_code` into `session_id`
    pub fn ping_user(&mut self, session_id: &str, friend_code: &str, now: Instant) -> Result<SendOutcome> {
        let recipient = codec::parse_friend_code(friend_code)?;
        if recipient == self.identity.handle {
            return Err(ValidationError::MalformedFriendCode {
                hint: "that is your own friend code".to_string(),
            }
            .into());
        }
        let hashes = self
            .sessions
            .get(session_id)
            .ok_or_else(|| SessionError::UnknownSession {
                session_id: session_id.to_string(),
            })?
            .credentials
            .hashes();

        let key = format!("ping:{recipient}");
        let policy = self.settings.policies.ping;
        if !self.limiter.try_acquire(&key, policy, now) {
            let retry_after = self.limiter.retry_after(&key, policy, now);
            return Ok(SendOutcome::RateLimited { retry_after });
        }

        log::info!("Inviting {} into {session_id}", codec::format_friend_code(&recipient));
        self.outbox
            .push(ClientFrame::ping_user(session_id, &recipient, hashes.as_ref()));
        Ok(SendOutcome::Sent)
    }

    /// Rejoin every session the user is in, after the relay link came back
    pub fn rejoin_all(&mut self) -> usize {
        let mut active: Vec<(String, SessionCredentials)> = self
            .sessions
            .values()
            .filter(|s| s.active)
            .map(|s| (s.session_id.clone(), s.credentials.clone()))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));

        let count = active.len();
        for (session_id, credentials) in active {
            self.join_with_credentials(session_id, credentials);
        }
        if count > 0 {
            log::info!("Rejoining {count} session(s)");
        }
        count
    }

    /// Mark every session unseated after the relay link dropped
    pub fn on_disconnected(&mut self) {
        for session in self.sessions.values_mut() {
            session.joined = false;
        }
    }

    // ----- relay frames -----

    /// Apply one frame from the relay
    pub fn handle_frame(&mut self, frame: ServerFrame, now: Instant) {
        match frame {
            ServerFrame::Pong => {}
            ServerFrame::SessionCreated(ack) => self.on_seated(ack, true),
            ServerFrame::SessionJoined(ack) => self.on_seated(ack, false),
            ServerFrame::SessionNotFound(ack) => {
                let error = SessionError::NotFound {
                    session_id: ack.session_id.clone(),
                };
                self.on_join_refused(&ack.session_id, error);
            }
            ServerFrame::SessionInvalidPasscode(ack) => {
                let error = SessionError::InvalidPasscode {
                    session_id: ack.session_id.clone(),
                };
                self.on_join_refused(&ack.session_id, error);
            }
            ServerFrame::ParticipantJoined(p) => {
                self.admit_participant(&p.session_id, &p.token, p.peer_key(), false);
            }
            ServerFrame::ParticipantRejoined(p) => {
                self.admit_participant(&p.session_id, &p.token, p.peer_key(), true);
            }
            ServerFrame::ParticipantLeft(p) => self.on_participant_left(&p.session_id, &p.token),
            ServerFrame::SessionMessage {
                session_id,
                from_token,
                payload,
            } => self.on_session_message(&session_id, &from_token, &payload, now),
            ServerFrame::SessionExpired { session_id } => {
                if self.sessions.contains_key(&session_id) || self.tokens.contains_key(&session_id) {
                    log::info!("Relay expired session {session_id}");
                    self.discard(&session_id);
                    self.emit(SessionEvent::SessionExpired { session_id });
                }
            }
            ServerFrame::PingNotification(invite) | ServerFrame::SessionInvite(invite) => {
                let hashes = invite
                    .passcode_hash
                    .filter(|h| !h.is_empty())
                    .map(|current| PasscodeHashes::prehashed(current, invite.passcode_hash_legacy));
                log::info!("Invitation to session {}", invite.session_id);
                self.emit(SessionEvent::InviteReceived {
                    session_id: invite.session_id,
                    hashes,
                });
            }
            ServerFrame::PingRateLimited {
                cooldown_remaining,
                reason,
            } => self.emit(SessionEvent::PingRateLimited {
                retry_after: cooldown_from_secs(cooldown_remaining),
                reason,
            }),
            ServerFrame::Error { message } => {
                let message = message.unwrap_or_else(|| "unspecified relay error".to_string());
                log::warn!("Relay error: {message}");
                self.emit(SessionEvent::RelayError { message });
            }
        }
    }

    fn on_seated(&mut self, ack: SessionAck, created: bool) {
        let session_id = ack.session_id;
        let Some(session) = self.sessions.get_mut(&session_id) else {
            log::warn!("Seated in unknown session {session_id}, ignoring");
            return;
        };
        session.joined = true;
        self.pending_joins.remove(&session_id);

        if created {
            log::info!("Session {session_id} created");
            self.emit(SessionEvent::SessionCreated {
                session_id: session_id.clone(),
            });
        } else {
            log::info!("Joined session {session_id}");
            self.emit(SessionEvent::SessionJoined {
                session_id: session_id.clone(),
            });
        }

        for participant in ack.participants.unwrap_or_default() {
            self.admit_participant(&session_id, &participant.token, participant.peer_key(), false);
        }
    }

    fn on_join_refused(&mut self, session_id: &str, error: SessionError) {
        if !self.pending_joins.remove(session_id) {
            log::debug!("Ignoring refusal for {session_id}: no join in flight");
            return;
        }
        log::warn!("Join cancelled: {error}");
        self.sessions.remove(session_id);
        self.participants.remove(session_id);
        self.engines.remove(session_id);
        self.emit(SessionEvent::JoinFailed {
            session_id: session_id.to_string(),
            error,
        });
    }

    fn admit_participant(&mut self, session_id: &str, token: &str, key: Option<&str>, rejoined: bool) {
        if self.is_own_token(session_id, token) {
            log::debug!("Ignoring own token in {session_id}");
            return;
        }
        let Some(session) = self.sessions.get_mut(session_id) else {
            log::warn!("Participant for unknown session {session_id}, ignoring");
            return;
        };
        session.recipient_token = Some(token.to_string());

        let roster = self.participants.entry(session_id.to_string()).or_default();
        // A rejoin replaces the entry outright; a repeated join announcement keeps it
        let mut info = ParticipantInfo::new(token);
        if let Some(previous) = roster.remove(token).filter(|_| !rejoined) {
            info.display_name = previous.display_name;
            info.peer_public_key = previous.peer_public_key;
        }
        roster.insert(token.to_string(), info);

        if rejoined {
            log::info!("Participant {} rejoined {session_id}", short_token(token));
            if let Some(engine) = self.engines.get_mut(session_id) {
                engine.reset_session();
            }
            self.emit(SessionEvent::ParticipantRejoined {
                session_id: session_id.to_string(),
                token: token.to_string(),
            });
        } else {
            log::info!("Participant {} joined {session_id}", short_token(token));
            self.emit(SessionEvent::ParticipantJoined {
                session_id: session_id.to_string(),
                token: token.to_string(),
            });
        }

        if let Some(key) = key {
            self.establish_key(session_id, token, key);
        }
    }

    fn establish_key(&mut self, session_id: &str, token: &str, key: &str) {
        let engine = self.engine_mut(session_id);
        if engine.is_ready() {
            let same = engine
                .peer_public_key()
                .is_some_and(|current| STANDARD.encode(current) == key.trim());
            if !same {
                log::warn!(
                    "Second peer key in {session_id} from {}; keeping the established one",
                    short_token(token)
                );
            }
            return;
        }

        if let Err(e) = engine.init_session_base64(key) {
            log::warn!("Key agreement with {} failed: {e}", short_token(token));
            return;
        }
        let fingerprint = engine.fingerprint().unwrap_or_default();

        if let Some(info) = self
            .participants
            .get_mut(session_id)
            .and_then(|roster| roster.get_mut(token))
        {
            info.peer_public_key = Some(key.to_string());
        }
        log::info!("Secure channel ready in {session_id} ({fingerprint})");
        self.emit(SessionEvent::CryptoReady {
            session_id: session_id.to_string(),
            token: token.to_string(),
            fingerprint,
        });
        self.announce_name(session_id);
    }

    fn on_participant_left(&mut self, session_id: &str, token: &str) {
        if self.is_own_token(session_id, token) {
            return;
        }
        let Some(roster) = self.participants.get_mut(session_id) else {
            return;
        };
        let Some(departed) = roster.remove(token) else {
            return;
        };
        let now_empty = roster.is_empty();

        if let Some(engine) = self.engines.get_mut(session_id) {
            let held_key = match (engine.peer_public_key(), departed.peer_public_key.as_deref()) {
                (Some(current), Some(theirs)) => STANDARD.encode(current) == theirs.trim(),
                _ => false,
            };
            if held_key || now_empty {
                engine.reset_session();
            }
        }
        if let Some(session) = self.sessions.get_mut(session_id) {
            if session.recipient_token.as_deref() == Some(token) {
                session.recipient_token = None;
            }
        }

        log::info!("Participant {} left {session_id}", short_token(token));
        self.emit(SessionEvent::ParticipantLeft {
            session_id: session_id.to_string(),
            token: token.to_string(),
        });
    }

    fn on_session_message(
        &mut self,
        session_id: &str,
        from_token: &str,
        payload: &EncryptedPayload,
        now: Instant,
    ) {
        if self.is_own_token(session_id, from_token) {
            return;
        }
        let Some(engine) = self.engines.get(session_id).filter(|e| e.is_ready()) else {
            log::debug!("Dropping message in {session_id}: no shared key yet");
            return;
        };
        let plaintext = match engine.decrypt(payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::warn!("Dropping message in {session_id} from {}: {e}", short_token(from_token));
                return;
            }
        };
        let Ok(body) = String::from_utf8(plaintext) else {
            log::warn!("Dropping non-UTF-8 message in {session_id}");
            return;
        };
        let Some(payload) = ChatPayload::decode(&body) else {
            log::debug!("Ignoring unknown control message in {session_id}");
            return;
        };

        match payload {
            ChatPayload::Text(text) => {
                let lifetime = self.settings.session_lifetime;
                if let Some(session) = self.sessions.get_mut(session_id) {
                    session.touch(Utc::now(), lifetime);
                    self.expiry_dirty = true;
                }
                self.set_peer_typing(session_id, from_token, None);
                let sender = self
                    .participant_mut(session_id, from_token)
                    .map_or_else(|| format!("peer-{}", short_token(from_token)), |p| p.label());
                self.emit(SessionEvent::MessageReceived {
                    session_id: session_id.to_string(),
                    from_token: from_token.to_string(),
                    sender,
                    text,
                });
            }
            ChatPayload::DisplayName(name) => {
                if name.is_empty() {
                    return;
                }
                if let Some(info) = self.participant_mut(session_id, from_token) {
                    info.display_name = Some(name.clone());
                }
                self.emit(SessionEvent::PeerNamed {
                    session_id: session_id.to_string(),
                    token: from_token.to_string(),
                    display_name: name,
                });
            }
            ChatPayload::Typing(typing) => {
                let until = typing.then(|| now + self.settings.typing_decay);
                self.set_peer_typing(session_id, from_token, until);
            }
        }
    }

    // ----- timers -----

    /// Clear typing indicators whose decay elapsed
    pub fn tick(&mut self, now: Instant) {
        let decayed: Vec<(String, String)> = self
            .participants
            .iter()
            .flat_map(|(session_id, roster)| {
                roster
                    .values()
                    .filter(|p| p.typing_until.is_some_and(|until| until <= now))
                    .map(move |p| (session_id.clone(), p.token.clone()))
            })
            .collect();
        for (session_id, token) in decayed {
            self.set_peer_typing(&session_id, &token, None);
        }
    }

    /// Drop sessions whose lifetime elapsed, returning their ids
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.session_id.clone())
            .collect();
        expired.sort();
        for session_id in &expired {
            log::info!("Session {session_id} expired locally");
            self.discard(session_id);
            self.emit(SessionEvent::SessionExpired {
                session_id: session_id.clone(),
            });
        }
        expired
    }

    // ----- persistence -----

    /// Persistent view of the session table
    pub fn snapshot(&self) -> PersistedSessions {
        let mut sessions: Vec<LocalSession> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        PersistedSessions {
            sessions,
            tokens: self.tokens.clone(),
        }
    }

    /// Load a persisted table, skipping sessions that expired meanwhile
    pub fn restore(&mut self, persisted: PersistedSessions, now: DateTime<Utc>) {
        self.tokens.extend(persisted.tokens);
        for mut session in persisted.sessions {
            session.joined = false;
            if session.is_expired(now) {
                log::debug!("Skipping expired session {}", session.session_id);
                self.tokens.remove(&session.session_id);
                continue;
            }
            self.sessions.insert(session.session_id.clone(), session);
        }
    }

    // ----- queries -----

    /// Our token for `session_id`
    pub fn token(&self, session_id: &str) -> Option<&str> {
        self.tokens.get(session_id).map(String::as_str)
    }

    /// Local record for `session_id`
    pub fn session(&self, session_id: &str) -> Option<&LocalSession> {
        self.sessions.get(session_id)
    }

    /// All local sessions, ordered by id
    pub fn sessions(&self) -> Vec<&LocalSession> {
        let mut sessions: Vec<&LocalSession> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Other occupants of `session_id`
    pub fn participants(&self, session_id: &str) -> Vec<&ParticipantInfo> {
        self.participants
            .get(session_id)
            .map(|roster| roster.values().collect())
            .unwrap_or_default()
    }

    /// Whether a shared key exists for `session_id`
    pub fn is_crypto_ready(&self, session_id: &str) -> bool {
        self.engines.get(session_id).is_some_and(CryptoEngine::is_ready)
    }

    /// Fingerprint of the shared key for `session_id`
    pub fn fingerprint(&self, session_id: &str) -> Option<String> {
        self.engines.get(session_id).and_then(CryptoEngine::fingerprint)
    }

    /// Where `session_id` stands
    pub fn session_phase(&self, session_id: &str) -> SessionPhase {
        if !self.tokens.contains_key(session_id) {
            return SessionPhase::NoToken;
        }
        if !self.sessions.get(session_id).is_some_and(|s| s.joined) {
            return SessionPhase::TokenIssued;
        }
        if self.participants.get(session_id).map_or(true, HashMap::is_empty) {
            return SessionPhase::AwaitingPeer;
        }
        SessionPhase::PeerPresent {
            crypto_ready: self.is_crypto_ready(session_id),
        }
    }

    // ----- helpers -----

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Session event receiver dropped");
        }
    }

    fn issue_token(&mut self, session_id: &str) -> String {
        self.tokens
            .entry(session_id.to_string())
            .or_insert_with(codec::generate_session_token)
            .clone()
    }

    fn is_own_token(&self, session_id: &str, token: &str) -> bool {
        self.tokens.get(session_id).is_some_and(|own| own == token)
    }

    fn engine_mut(&mut self, session_id: &str) -> &mut CryptoEngine {
        let keypair = Arc::clone(&self.identity.keypair);
        self.engines
            .entry(session_id.to_string())
            .or_insert_with(|| CryptoEngine::with_key_pair(keypair))
    }

    fn participant_mut(&mut self, session_id: &str, token: &str) -> Option<&mut ParticipantInfo> {
        self.participants.get_mut(session_id)?.get_mut(token)
    }

    fn soft_reset(&mut self, session_id: &str) {
        self.engine_mut(session_id).reset_session();
        self.participants.remove(session_id);
    }

    fn discard(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
        self.tokens.remove(session_id);
        self.engines.remove(session_id);
        self.participants.remove(session_id);
        self.pending_joins.remove(session_id);
        self.limiter.clear(&format!("message:{session_id}"));
        self.limiter.clear(&format!("typing:{session_id}"));
    }

    fn require_seated(&self, session_id: &str) -> Result<()> {
        match self.sessions.get(session_id) {
            Some(session) if session.joined => Ok(()),
            Some(_) => Err(SessionError::JoinFailed {
                session_id: session_id.to_string(),
                reason: "not seated on the relay".to_string(),
            }
            .into()),
            None => Err(SessionError::UnknownSession {
                session_id: session_id.to_string(),
            }
            .into()),
        }
    }

    fn push_payload(&mut self, session_id: &str, payload: &ChatPayload) -> Result<()> {
        let token = self
            .tokens
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        let engine = self
            .engines
            .get(session_id)
            .ok_or(CryptoError::SessionNotReady)?;
        let sealed = engine.encrypt(payload.encode().as_bytes())?;
        self.outbox.push(ClientFrame::SessionMessage {
            session_id: session_id.to_string(),
            token,
            payload: sealed,
        });
        Ok(())
    }

    fn announce_name(&mut self, session_id: &str) {
        let name = ChatPayload::DisplayName(self.settings.display_name.clone());
        if let Err(e) = self.push_payload(session_id, &name) {
            log::warn!("Could not announce display name in {session_id}: {e}");
        }
    }

    fn set_peer_typing(&mut self, session_id: &str, token: &str, until: Option<Instant>) {
        let Some(info) = self.participant_mut(session_id, token) else {
            return;
        };
        let was_typing = info.is_typing();
        info.typing_until = until;
        if was_typing != info.is_typing() {
            self.emit(SessionEvent::TypingChanged {
                session_id: session_id.to_string(),
                token: token.to_string(),
                typing: until.is_some(),
            });
        }
    }
}

impl std::fmt::Debug for SessionProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProtocol")
            .field("handle", &self.identity.handle)
            .field("sessions", &self.sessions.len())
            .field("pending_joins", &self.pending_joins)
            .field("outbox", &self.outbox.len())
            .finish()
    }
}
