//! Application actor.
//!
//! `App` owns the session protocol and is the only task that mutates it.
//! User commands, relay events and housekeeping ticks are serialized through
//! one `tokio::select!` loop, and every frame the protocol queues is handed
//! to the relay task after each step.

use crate::{
    crypto::{identity::SESSIONS_RECORD, Identity, IdentityStore, JoinCode, PasscodeHashes},
    session::{
        PersistedSessions, ProtocolSettings, SendOutcome, SessionEvent, SessionPhase,
        SessionProtocol,
    },
    transport::{ConnectionState, RelayClient, RelayEvent, RelayHandle},
    utils::{FileStore, KeyValueStore, MessengerConfig, MessengerError, NetworkError, Result},
};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How often typing indicators and session expiry are checked
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Requests from the user interface
#[derive(Debug, Clone)]
pub enum AppCommand {
    /// Create a session with a generated code
    CreateSession,
    /// Join with a `SESSIONID-PASSCODE` code
    Join { code: String },
    /// Accept an invitation
    AcceptInvite {
        session_id: String,
        hashes: PasscodeHashes,
    },
    /// Leave a session, keeping its token
    Leave { session_id: String },
    /// Leave and discard a session
    Forget { session_id: String },
    /// Send chat text
    Send { session_id: String, text: String },
    /// Typing indicator
    Typing { session_id: String, typing: bool },
    /// Invite a friend by friend code
    Invite {
        session_id: String,
        friend_code: String,
    },
    /// Change the announced display name
    SetDisplayName { name: String },
    /// Report every local session
    ListSessions,
    /// Manual reconnect after the attempt budget ran out
    Reconnect,
    /// Persist state and stop
    Shutdown,
}

/// Summary of one local session for display
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    /// Session id
    pub session_id: String,
    /// Current phase
    pub phase: SessionPhase,
    /// Join code, when the passcode is known
    pub join_code: Option<String>,
    /// Labels of the other occupants
    pub participants: Vec<String>,
    /// Shared key fingerprint
    pub fingerprint: Option<String>,
}

/// Notifications for the user interface
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Relay link state changed
    Connection(ConnectionState),
    /// A new session code to share
    SessionCodeIssued { code: JoinCode },
    /// Something happened in a session
    Session(SessionEvent),
    /// An action was refused by the local rate limiter
    RateLimited {
        action: &'static str,
        retry_after: Duration,
    },
    /// Answer to `ListSessions`
    Sessions(Vec<SessionSummary>),
    /// A command failed
    Error { error: MessengerError },
    /// The actor stopped
    Stopped,
}

/// Cloneable command sender for the actor
#[derive(Debug, Clone)]
pub struct AppHandle {
    commands: mpsc::UnboundedSender<AppCommand>,
}

impl AppHandle {
    /// Queue a command
    pub fn send(&self, command: AppCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| NetworkError::ChannelClosed.into())
    }

    /// Ask the actor to stop
    pub fn shutdown(&self) {
        let _ = self.commands.send(AppCommand::Shutdown);
    }
}

/// Main application structure
pub struct App {
    config: MessengerConfig,
    store: Arc<dyn KeyValueStore>,
    protocol: SessionProtocol,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::UnboundedReceiver<AppCommand>,
    events: mpsc::UnboundedSender<AppEvent>,
}

impl App {
    /// Create the actor on top of the on-disk store in `config.storage`
    pub fn open(config: MessengerConfig) -> Result<(Self, AppHandle, mpsc::UnboundedReceiver<AppEvent>)> {
        config.ensure_directories()?;
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&config.storage.data_dir)?);
        Self::new(config, store)
    }

    /// Create the actor on top of `store`, loading or creating the identity
    /// and restoring persisted sessions
    pub fn new(
        config: MessengerConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<(Self, AppHandle, mpsc::UnboundedReceiver<AppEvent>)> {
        let identity = IdentityStore::new(Arc::clone(&store)).load_or_create()?;
        log::info!("Identity loaded, friend code {}", identity.friend_code());

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let mut protocol = SessionProtocol::new(identity, ProtocolSettings::from(&config), session_tx);
        if let Some(persisted) = load_sessions(store.as_ref())? {
            protocol.restore(persisted, Utc::now());
            log::info!("Restored {} session(s)", protocol.sessions().len());
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let app = Self {
            config,
            store,
            protocol,
            session_events: session_rx,
            commands: command_rx,
            events: event_tx,
        };
        Ok((app, AppHandle { commands: command_tx }, event_rx))
    }

    /// Device identity
    pub fn identity(&self) -> &Identity {
        self.protocol.identity()
    }

    /// Run until `Shutdown` or until every handle is dropped
    pub async fn run(mut self) -> Result<()> {
        log::info!(
            "Starting relay messenger (protocol {}) as {}",
            crate::PROTOCOL_VERSION,
            self.identity()
        );
        let (relay, mut relay_events, relay_task) = RelayClient::spawn(&self.config.relay);
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(AppCommand::Shutdown) | None => break,
                    Some(AppCommand::Reconnect) => {
                        if let Err(e) = relay.reconnect() {
                            self.report(e);
                        }
                    }
                    Some(command) => self.handle_command(command),
                },
                event = relay_events.recv() => match event {
                    Some(event) => self.handle_relay_event(event, &relay),
                    None => {
                        log::error!("Relay task ended unexpectedly");
                        break;
                    }
                },
                Some(event) = self.session_events.recv() => self.handle_session_event(event),
                _ = housekeeping.tick() => {
                    self.protocol.tick(Instant::now());
                    let purged = !self.protocol.purge_expired(Utc::now()).is_empty();
                    if self.protocol.take_expiry_refresh() || purged {
                        self.persist();
                    }
                }
            }
            self.flush(&relay);
        }

        self.persist();
        relay.shutdown();
        if let Err(e) = relay_task.await {
            log::warn!("Relay task panicked: {e}");
        }
        self.emit(AppEvent::Stopped);
        log::info!("Application stopped");
        Ok(())
    }

    fn handle_command(&mut self, command: AppCommand) {
        let now = Instant::now();
        let result = match command {
            AppCommand::CreateSession => self.protocol.create_new_session().map(|code| {
                self.emit(AppEvent::SessionCodeIssued { code });
            }),
            AppCommand::Join { code } => self.protocol.join_with_code(&code),
            AppCommand::AcceptInvite { session_id, hashes } => {
                self.protocol.join_session_with_hash(&session_id, hashes)
            }
            AppCommand::Leave { session_id } => self.protocol.leave_session(&session_id),
            AppCommand::Forget { session_id } => self.protocol.forget_session(&session_id),
            AppCommand::Send { session_id, text } => self
                .protocol
                .send_message(&session_id, &text, now)
                .map(|outcome| self.note_outcome("message", outcome)),
            AppCommand::Typing { session_id, typing } => {
                self.protocol.set_typing(&session_id, typing, now)
            }
            AppCommand::Invite {
                session_id,
                friend_code,
            } => self
                .protocol
                .ping_user(&session_id, &friend_code, now)
                .map(|outcome| self.note_outcome("invite", outcome)),
            AppCommand::SetDisplayName { name } => self.protocol.set_display_name(&name),
            AppCommand::ListSessions => {
                let summaries = self.summaries();
                self.emit(AppEvent::Sessions(summaries));
                Ok(())
            }
            AppCommand::Reconnect | AppCommand::Shutdown => Ok(()),
        };
        if let Err(e) = result {
            self.report(e);
        }
    }

    fn handle_relay_event(&mut self, event: RelayEvent, relay: &RelayHandle) {
        match event {
            RelayEvent::Frame(frame) => self.protocol.handle_frame(frame, Instant::now()),
            RelayEvent::StateChanged(state) => {
                log::info!("Relay connection {state}");
                match state {
                    ConnectionState::Live => {
                        if let Err(e) = relay.send(self.protocol.register_frame()) {
                            self.report(e);
                        }
                        self.protocol.rejoin_all();
                    }
                    ConnectionState::Failed => {
                        self.protocol.on_disconnected();
                        self.report(
                            NetworkError::ReconnectExhausted {
                                attempts: self.config.relay.max_reconnect_attempts,
                            }
                            .into(),
                        );
                    }
                    ConnectionState::Disconnected => self.protocol.on_disconnected(),
                    ConnectionState::Connecting | ConnectionState::AwaitingLiveness => {}
                }
                self.emit(AppEvent::Connection(state));
            }
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        if matches!(
            event,
            SessionEvent::SessionCreated { .. }
                | SessionEvent::SessionJoined { .. }
                | SessionEvent::SessionLeft { .. }
                | SessionEvent::JoinFailed { .. }
                | SessionEvent::SessionExpired { .. }
        ) {
            self.persist();
        }
        self.emit(AppEvent::Session(event));
    }

    fn note_outcome(&self, action: &'static str, outcome: SendOutcome) {
        if let SendOutcome::RateLimited { retry_after } = outcome {
            self.emit(AppEvent::RateLimited {
                action,
                retry_after,
            });
        }
    }

    fn flush(&mut self, relay: &RelayHandle) {
        for frame in self.protocol.drain_outbox() {
            if let Err(e) = relay.send(frame) {
                log::error!("Relay task is gone: {e}");
                return;
            }
        }
    }

    fn summaries(&self) -> Vec<SessionSummary> {
        self.protocol
            .sessions()
            .into_iter()
            .map(|session| SessionSummary {
                session_id: session.session_id.clone(),
                phase: self.protocol.session_phase(&session.session_id),
                join_code: session.join_code(),
                participants: self
                    .protocol
                    .participants(&session.session_id)
                    .iter()
                    .map(|p| p.label())
                    .collect(),
                fingerprint: self.protocol.fingerprint(&session.session_id),
            })
            .collect()
    }

    fn persist(&self) {
        let result = serde_json::to_vec(&self.protocol.snapshot())
            .map_err(MessengerError::from)
            .and_then(|bytes| self.store.put(SESSIONS_RECORD, &bytes));
        if let Err(e) = result {
            log::error!("Failed to persist sessions: {e}");
        }
    }

    fn report(&self, error: MessengerError) {
        if error.is_user_facing() {
            log::info!("{error}");
        } else {
            log::warn!("{error}");
        }
        self.emit(AppEvent::Error { error });
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }
}

fn load_sessions(store: &dyn KeyValueStore) -> Result<Option<PersistedSessions>> {
    match store.get(SESSIONS_RECORD)? {
        Some(bytes) => match serde_json::from_slice(&bytes) {
            Ok(persisted) => Ok(Some(persisted)),
            Err(e) => {
                log::warn!("Ignoring unreadable session record: {e}");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ClientFrame;
    use crate::utils::MemoryStore;

    fn create_test_app(store: Arc<dyn KeyValueStore>) -> (App, AppHandle, mpsc::UnboundedReceiver<AppEvent>) {
        let mut config = MessengerConfig::default();
        config.relay.url = "ws://127.0.0.1:9".to_string();
        App::new(config, store).unwrap()
    }

    #[test]
    fn test_identity_is_stable_across_restarts() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let (first, _, _) = create_test_app(Arc::clone(&store));
        let (second, _, _) = create_test_app(store);
        assert_eq!(first.identity().handle, second.identity().handle);
        assert_eq!(
            first.identity().keypair.public_key_bytes(),
            second.identity().keypair.public_key_bytes()
        );
    }

    #[test]
    fn test_create_session_issues_code_and_persists() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let (mut app, _handle, mut events) = create_test_app(Arc::clone(&store));

        app.handle_command(AppCommand::CreateSession);
        let Ok(AppEvent::SessionCodeIssued { code }) = events.try_recv() else {
            panic!("expected a session code");
        };
        assert!(matches!(
            app.protocol.drain_outbox().as_slice(),
            [ClientFrame::CreateSession { .. }]
        ));
        app.persist();

        let (restored, _, _) = create_test_app(store);
        let session = restored.protocol.session(&code.session_id).unwrap();
        assert_eq!(session.join_code(), Some(code.to_code()));
    }

    #[test]
    fn test_command_errors_are_reported() {
        let (mut app, _handle, mut events) = create_test_app(Arc::new(MemoryStore::new()));
        app.handle_command(AppCommand::Join {
            code: "not a code".to_string(),
        });
        match events.try_recv() {
            Ok(AppEvent::Error { error }) => assert!(error.is_user_facing()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_list_sessions() {
        let (mut app, _handle, mut events) = create_test_app(Arc::new(MemoryStore::new()));
        app.handle_command(AppCommand::Join {
            code: "ABC234-WXYZ".to_string(),
        });
        app.handle_command(AppCommand::ListSessions);
        match events.try_recv() {
            Ok(AppEvent::Sessions(list)) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].session_id, "ABC234");
                assert_eq!(list[0].phase, SessionPhase::TokenIssued);
                assert_eq!(list[0].join_code.as_deref(), Some("ABC234-WXYZ"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_actor() {
        let (app, handle, mut events) = create_test_app(Arc::new(MemoryStore::new()));
        let task = tokio::spawn(app.run());
        handle.shutdown();
        task.await.unwrap().unwrap();

        let mut stopped = false;
        while let Ok(event) = events.try_recv() {
            stopped |= matches!(event, AppEvent::Stopped);
        }
        assert!(stopped);
    }
}
