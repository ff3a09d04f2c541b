//! Relay transport: wire frames, the connection state machine and the
//! WebSocket task that drives it.

pub mod connection;
pub mod protocol;
pub mod relay;

pub use connection::{ConnectionAction, ConnectionManager, ConnectionState, ConnectionTimings};
pub use protocol::{ClientFrame, ServerFrame};
pub use relay::{RelayClient, RelayEvent, RelayHandle};
