//! Session protocol: tokens, participants and encrypted payloads.

pub mod payload;
pub mod protocol;
pub mod state;

pub use payload::ChatPayload;
pub use protocol::{ProtocolSettings, SendOutcome, SessionEvent, SessionProtocol};
pub use state::{LocalSession, ParticipantInfo, PersistedSessions, SessionCredentials, SessionPhase};
