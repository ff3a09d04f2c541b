//! Client-side admission control for user-triggered network actions.
//!
//! Two gates apply per action key: a cooldown since the last recorded
//! action, and a cap on actions within a window. Windows roll over lazily
//! when an action is evaluated after the previous one elapsed. This is an
//! advisory gate; the relay enforces its own limits.

use crate::utils::RateLimitConfig;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits applied to one class of action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionPolicy {
    /// Minimum time between two recorded actions
    pub cooldown: Duration,
    /// Maximum recorded actions per window
    pub max_per_window: u32,
    /// Window length
    pub window: Duration,
}

impl ActionPolicy {
    /// Build a policy
    pub const fn new(cooldown: Duration, max_per_window: u32, window: Duration) -> Self {
        Self {
            cooldown,
            max_per_window,
            window,
        }
    }
}

/// Policies for every rate-limited action the client performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionPolicies {
    /// Chat messages, keyed per session
    pub message: ActionPolicy,
    /// Friend pings, keyed per recipient
    pub ping: ActionPolicy,
    /// Typing indicators, keyed per session
    pub typing: ActionPolicy,
}

impl From<&RateLimitConfig> for ActionPolicies {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            message: ActionPolicy::new(
                Duration::from_millis(config.message_cooldown_ms),
                config.message_max_per_window,
                Duration::from_secs(config.message_window_secs),
            ),
            ping: ActionPolicy::new(
                Duration::from_secs(config.ping_cooldown_secs),
                config.ping_max_per_window,
                Duration::from_secs(config.ping_window_secs),
            ),
            // typing only has a cooldown
            typing: ActionPolicy::new(
                Duration::from_millis(config.typing_cooldown_ms),
                u32::MAX,
                Duration::from_secs(60),
            ),
        }
    }
}

impl Default for ActionPolicies {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

/// Per-key limiter state
#[derive(Debug, Clone, Copy)]
struct ActionState {
    last_action_at: Option<Instant>,
    window_start: Instant,
    count_in_window: u32,
}

/// Cooldown + window limiter keyed by action name
#[derive(Debug, Default)]
pub struct RateLimiter {
    states: HashMap<String, ActionState>,
}

impl RateLimiter {
    /// Create an empty limiter
    pub fn new() -> Self {
        Self::default()
    }

    /// Check both gates for `key` at the current instant
    pub fn can_perform_action(
        &mut self,
        key: &str,
        cooldown: Duration,
        max_per_window: u32,
        window: Duration,
    ) -> bool {
        self.can_perform_action_at(key, cooldown, max_per_window, window, Instant::now())
    }

    /// Check both gates for `key` at `now`.
    ///
    /// A `now` earlier than the recorded state is treated as ambiguous and
    /// denied.
    pub fn can_perform_action_at(
        &mut self,
        key: &str,
        cooldown: Duration,
        max_per_window: u32,
        window: Duration,
        now: Instant,
    ) -> bool {
        let Some(state) = self.states.get_mut(key) else {
            return max_per_window > 0;
        };

        let Some(window_elapsed) = now.checked_duration_since(state.window_start) else {
            return false;
        };
        if window_elapsed >= window {
            state.window_start = now;
            state.count_in_window = 0;
        }

        if let Some(last) = state.last_action_at {
            match now.checked_duration_since(last) {
                Some(since_last) if since_last >= cooldown => {}
                _ => return false,
            }
        }

        state.count_in_window < max_per_window
    }

    /// Record an action for `key` at the current instant
    pub fn record_action(&mut self, key: &str) {
        self.record_action_at(key, Instant::now());
    }

    /// Record an action for `key` at `now`
    pub fn record_action_at(&mut self, key: &str, now: Instant) {
        let state = self.states.entry(key.to_string()).or_insert(ActionState {
            last_action_at: None,
            window_start: now,
            count_in_window: 0,
        });
        state.last_action_at = Some(now);
        state.count_in_window = state.count_in_window.saturating_add(1);
    }

    /// Check and, if allowed, record in one step
    pub fn try_acquire(&mut self, key: &str, policy: ActionPolicy, now: Instant) -> bool {
        let allowed =
            self.can_perform_action_at(key, policy.cooldown, policy.max_per_window, policy.window, now);
        if allowed {
            self.record_action_at(key, now);
        }
        allowed
    }

    /// Time left before the cooldown for `key` expires
    pub fn remaining_cooldown(&self, key: &str, cooldown: Duration) -> Duration {
        self.remaining_cooldown_at(key, cooldown, Instant::now())
    }

    /// Time left before the cooldown for `key` expires, measured at `now`
    pub fn remaining_cooldown_at(&self, key: &str, cooldown: Duration, now: Instant) -> Duration {
        match self.states.get(key).and_then(|s| s.last_action_at) {
            Some(last) => match now.checked_duration_since(last) {
                Some(elapsed) => cooldown.saturating_sub(elapsed),
                None => cooldown,
            },
            None => Duration::ZERO,
        }
    }

    /// Time until `key` may act again under `policy`, whichever gate is later
    pub fn retry_after(&self, key: &str, policy: ActionPolicy, now: Instant) -> Duration {
        let cooldown = self.remaining_cooldown_at(key, policy.cooldown, now);
        let window = match self.states.get(key) {
            Some(state) if state.count_in_window >= policy.max_per_window => now
                .checked_duration_since(state.window_start)
                .map_or(policy.window, |elapsed| policy.window.saturating_sub(elapsed)),
            _ => Duration::ZERO,
        };
        cooldown.max(window)
    }

    /// Drop all state for `key`
    pub fn clear(&mut self, key: &str) {
        self.states.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(1);
    const WINDOW: Duration = Duration::from_secs(60);
    const POLICY: ActionPolicy = ActionPolicy::new(COOLDOWN, 3, WINDOW);

    #[test]
    fn test_cooldown_blocks_burst() {
        let mut limiter = RateLimiter::new();
        let start = Instant::now();

        let results: Vec<bool> = (0..4)
            .map(|i| limiter.try_acquire("msg", POLICY, start + Duration::from_millis(i * 200)))
            .collect();
        assert_eq!(results, vec![true, false, false, false]);

        assert!(limiter.try_acquire("msg", POLICY, start + WINDOW));
    }

    #[test]
    fn test_window_cap_and_lazy_reset() {
        let mut limiter = RateLimiter::new();
        let start = Instant::now();

        for i in 0..3 {
            assert!(limiter.try_acquire("msg", POLICY, start + COOLDOWN * 2 * i));
        }
        // cooldown has passed but the window is full
        assert!(!limiter.try_acquire("msg", POLICY, start + Duration::from_secs(10)));
        assert!(limiter.retry_after("msg", POLICY, start + Duration::from_secs(10)) > Duration::ZERO);

        assert!(limiter.try_acquire("msg", POLICY, start + Duration::from_secs(60)));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(limiter.try_acquire("msg:ABC234", POLICY, now));
        assert!(limiter.try_acquire("msg:XYZ789", POLICY, now));
        assert!(!limiter.try_acquire("msg:ABC234", POLICY, now));
    }

    #[test]
    fn test_remaining_cooldown() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        assert_eq!(limiter.remaining_cooldown_at("ping", COOLDOWN, now), Duration::ZERO);

        limiter.record_action_at("ping", now);
        assert_eq!(
            limiter.remaining_cooldown_at("ping", COOLDOWN, now + Duration::from_millis(400)),
            Duration::from_millis(600)
        );
        assert_eq!(
            limiter.remaining_cooldown_at("ping", COOLDOWN, now + Duration::from_secs(5)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_clock_going_backwards_denies() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now() + Duration::from_secs(10);
        limiter.record_action_at("msg", now);

        let earlier = now - Duration::from_secs(5);
        assert!(!limiter.can_perform_action_at("msg", Duration::ZERO, 10, WINDOW, earlier));
    }

    #[test]
    fn test_policies_from_config() {
        let policies = ActionPolicies::default();
        assert_eq!(policies.message.cooldown, Duration::from_millis(300));
        assert_eq!(policies.message.max_per_window, 30);
        assert_eq!(policies.ping.cooldown, Duration::from_secs(30));
        assert_eq!(policies.ping.window, Duration::from_secs(600));
        assert_eq!(policies.typing.cooldown, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_budget_denies() {
        let mut limiter = RateLimiter::new();
        assert!(!limiter.can_perform_action("msg", COOLDOWN, 0, WINDOW));
    }
}
