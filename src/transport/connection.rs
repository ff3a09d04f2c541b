//! Relay connection state machine.
//!
//! The manager owns no socket. The driver reports transport events and the
//! current instant; the manager answers with actions to perform and the
//! next deadline at which it wants to be polled. A bare connect is never
//! enough to go live: the first pong after opening the transport is.

use crate::utils::RelayConfig;
use std::time::{Duration, Instant};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; a reconnect may be scheduled
    Disconnected,
    /// Transport is being opened
    Connecting,
    /// Transport open, first probe sent, waiting for its pong
    AwaitingLiveness,
    /// Probe answered; frames may flow
    Live,
    /// Reconnect budget spent; only a manual reconnect leaves this state
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingLiveness => "awaiting liveness",
            Self::Live => "live",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Side effects requested from the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a new transport to the relay
    OpenTransport,
    /// Send a liveness probe
    SendProbe,
    /// Close the current transport
    CloseTransport,
}

/// Backoff and liveness timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimings {
    /// Time allowed for the first pong
    pub liveness_timeout: Duration,
    /// Probe cadence while live
    pub probe_interval: Duration,
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Reconnect delay ceiling
    pub backoff_max: Duration,
    /// Reconnect attempts before failing
    pub max_attempts: u32,
    /// Pause before a manual reconnect
    pub cooloff: Duration,
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for ConnectionTimings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            liveness_timeout: config.liveness_timeout(),
            probe_interval: config.probe_interval(),
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
            max_attempts: config.max_reconnect_attempts,
            cooloff: config.reconnect_cooloff(),
        }
    }
}

impl ConnectionTimings {
    /// Delay before reconnect attempt number `attempt` (zero-based):
    /// `min(max, base * 2^attempt)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }
}

/// Relay connection state machine
#[derive(Debug)]
pub struct ConnectionManager {
    timings: ConnectionTimings,
    state: ConnectionState,
    attempts: u32,
    reconnect_at: Option<Instant>,
    liveness_deadline: Option<Instant>,
    next_probe_at: Option<Instant>,
    stopped: bool,
}

impl ConnectionManager {
    /// Create a disconnected manager
    pub fn new(timings: ConnectionTimings) -> Self {
        Self {
            timings,
            state: ConnectionState::Disconnected,
            attempts: 0,
            reconnect_at: None,
            liveness_deadline: None,
            next_probe_at: None,
            stopped: false,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts since the last live connection
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True when frames may be sent
    pub fn is_live(&self) -> bool {
        self.state == ConnectionState::Live
    }

    /// Begin connecting from `Disconnected`
    pub fn connect(&mut self, _now: Instant) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Disconnected {
            return Vec::new();
        }
        self.stopped = false;
        self.enter_connecting()
    }

    /// Transport opened: send the first probe and start the liveness clock
    pub fn on_transport_open(&mut self, now: Instant) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.state = ConnectionState::AwaitingLiveness;
        self.liveness_deadline = Some(now + self.timings.liveness_timeout);
        vec![ConnectionAction::SendProbe]
    }

    /// A pong arrived
    pub fn on_pong(&mut self, now: Instant) -> Vec<ConnectionAction> {
        match self.state {
            ConnectionState::AwaitingLiveness => {
                log::info!("Relay connection live after {} attempt(s)", self.attempts);
                self.state = ConnectionState::Live;
                self.attempts = 0;
                self.liveness_deadline = None;
                self.next_probe_at = Some(now + self.timings.probe_interval);
            }
            ConnectionState::Live => {}
            _ => log::debug!("Ignoring pong in state {}", self.state),
        }
        Vec::new()
    }

    /// Transport failed to open, errored, or closed
    pub fn on_transport_closed(&mut self, now: Instant) -> Vec<ConnectionAction> {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::AwaitingLiveness
            | ConnectionState::Live => {
                self.state = ConnectionState::Disconnected;
                self.clear_timers();
                self.schedule_reconnect(now);
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }
        Vec::new()
    }

    /// Advance timers; call at or after `next_deadline`
    pub fn poll(&mut self, now: Instant) -> Vec<ConnectionAction> {
        match self.state {
            ConnectionState::AwaitingLiveness => match self.liveness_deadline {
                Some(deadline) if now >= deadline => {
                    log::warn!("No pong within {:?}, dropping transport", self.timings.liveness_timeout);
                    self.state = ConnectionState::Disconnected;
                    self.clear_timers();
                    self.schedule_reconnect(now);
                    vec![ConnectionAction::CloseTransport]
                }
                _ => Vec::new(),
            },
            ConnectionState::Live => match self.next_probe_at {
                Some(at) if now >= at => {
                    self.next_probe_at = Some(now + self.timings.probe_interval);
                    vec![ConnectionAction::SendProbe]
                }
                _ => Vec::new(),
            },
            ConnectionState::Disconnected => match self.reconnect_at {
                Some(at) if now >= at && !self.stopped => {
                    self.reconnect_at = None;
                    self.enter_connecting()
                }
                _ => Vec::new(),
            },
            ConnectionState::Connecting | ConnectionState::Failed => Vec::new(),
        }
    }

    /// Manual reconnect: reset the budget and start over after the cool-off
    pub fn reconnect(&mut self, now: Instant) -> Vec<ConnectionAction> {
        let had_transport = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::AwaitingLiveness | ConnectionState::Live
        );
        self.state = ConnectionState::Disconnected;
        self.attempts = 0;
        self.stopped = false;
        self.clear_timers();
        self.reconnect_at = Some(now + self.timings.cooloff);

        if had_transport {
            vec![ConnectionAction::CloseTransport]
        } else {
            Vec::new()
        }
    }

    /// Stop for good: close the transport and cancel every timer
    pub fn shutdown(&mut self) -> Vec<ConnectionAction> {
        let had_transport = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::AwaitingLiveness | ConnectionState::Live
        );
        self.stopped = true;
        self.state = ConnectionState::Disconnected;
        self.clear_timers();
        self.reconnect_at = None;

        if had_transport {
            vec![ConnectionAction::CloseTransport]
        } else {
            Vec::new()
        }
    }

    /// Earliest instant at which `poll` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::AwaitingLiveness => self.liveness_deadline,
            ConnectionState::Live => self.next_probe_at,
            ConnectionState::Disconnected if !self.stopped => self.reconnect_at,
            _ => None,
        }
    }

    fn enter_connecting(&mut self) -> Vec<ConnectionAction> {
        self.state = ConnectionState::Connecting;
        vec![ConnectionAction::OpenTransport]
    }

    fn clear_timers(&mut self) {
        self.liveness_deadline = None;
        self.next_probe_at = None;
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        if self.attempts >= self.timings.max_attempts {
            log::error!("Relay unreachable after {} attempts", self.attempts);
            self.state = ConnectionState::Failed;
            self.reconnect_at = None;
            return;
        }
        let delay = self.timings.backoff_delay(self.attempts);
        self.attempts += 1;
        log::info!("Reconnecting in {:?} (attempt {}/{})", delay, self.attempts, self.timings.max_attempts);
        self.reconnect_at = Some(now + delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_manager(now: Instant) -> ConnectionManager {
        let mut manager = ConnectionManager::new(ConnectionTimings::default());
        assert_eq!(manager.connect(now), vec![ConnectionAction::OpenTransport]);
        assert_eq!(manager.on_transport_open(now), vec![ConnectionAction::SendProbe]);
        manager.on_pong(now);
        manager
    }

    #[test]
    fn test_backoff_schedule() {
        let timings = ConnectionTimings::default();
        let delays: Vec<u64> = (0..7).map(|a| timings.backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(timings.backoff_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_live_requires_pong() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(ConnectionTimings::default());
        manager.connect(now);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.on_transport_open(now);
        assert_eq!(manager.state(), ConnectionState::AwaitingLiveness);
        assert!(!manager.is_live());

        manager.on_pong(now + Duration::from_millis(80));
        assert!(manager.is_live());
    }

    #[test]
    fn test_liveness_timeout_forces_disconnect() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(ConnectionTimings::default());
        manager.connect(now);
        manager.on_transport_open(now);

        assert!(manager.poll(now + Duration::from_secs(4)).is_empty());
        assert_eq!(
            manager.poll(now + Duration::from_secs(5)),
            vec![ConnectionAction::CloseTransport]
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.next_deadline(), Some(now + Duration::from_secs(7)));
    }

    #[test]
    fn test_probe_cadence_while_live() {
        let now = Instant::now();
        let mut manager = live_manager(now);
        assert_eq!(manager.next_deadline(), Some(now + Duration::from_secs(25)));
        assert!(manager.poll(now + Duration::from_secs(24)).is_empty());
        assert_eq!(
            manager.poll(now + Duration::from_secs(25)),
            vec![ConnectionAction::SendProbe]
        );
        assert_eq!(manager.next_deadline(), Some(now + Duration::from_secs(50)));
    }

    #[test]
    fn test_reconnect_budget_exhaustion() {
        let mut now = Instant::now();
        let mut manager = live_manager(now);
        manager.on_transport_closed(now);

        for attempt in 0..10 {
            assert_eq!(manager.state(), ConnectionState::Disconnected, "attempt {attempt}");
            now = manager.next_deadline().unwrap();
            assert_eq!(manager.poll(now), vec![ConnectionAction::OpenTransport]);
            manager.on_transport_closed(now);
        }

        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(manager.next_deadline().is_none());
        assert!(manager.poll(now + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_pong_resets_attempts() {
        let now = Instant::now();
        let mut manager = live_manager(now);
        manager.on_transport_closed(now);
        assert_eq!(manager.attempts(), 1);

        let at = manager.next_deadline().unwrap();
        manager.poll(at);
        manager.on_transport_open(at);
        manager.on_pong(at);
        assert_eq!(manager.attempts(), 0);
    }

    #[test]
    fn test_manual_reconnect_from_failed() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(ConnectionTimings {
            max_attempts: 1,
            ..ConnectionTimings::default()
        });
        manager.connect(now);
        manager.on_transport_closed(now);
        let at = manager.next_deadline().unwrap();
        manager.poll(at);
        manager.on_transport_closed(at);
        assert_eq!(manager.state(), ConnectionState::Failed);

        assert!(manager.reconnect(at).is_empty());
        assert_eq!(manager.attempts(), 0);
        let resume = at + Duration::from_secs(1);
        assert_eq!(manager.next_deadline(), Some(resume));
        assert_eq!(manager.poll(resume), vec![ConnectionAction::OpenTransport]);
    }

    #[test]
    fn test_manual_reconnect_closes_live_transport() {
        let now = Instant::now();
        let mut manager = live_manager(now);
        assert_eq!(manager.reconnect(now), vec![ConnectionAction::CloseTransport]);
        // the close notification from the driver must not consume budget
        manager.on_transport_closed(now);
        assert_eq!(manager.attempts(), 0);
    }

    #[test]
    fn test_shutdown_cancels_timers() {
        let now = Instant::now();
        let mut manager = live_manager(now);
        assert_eq!(manager.shutdown(), vec![ConnectionAction::CloseTransport]);
        manager.on_transport_closed(now);
        assert!(manager.next_deadline().is_none());
        assert!(manager.poll(now + Duration::from_secs(60)).is_empty());
    }
}
