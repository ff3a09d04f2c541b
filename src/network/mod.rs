//! Local network admission control.

pub mod rate_limit;

pub use rate_limit::{ActionPolicies, ActionPolicy, RateLimiter};
